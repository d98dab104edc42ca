use proxmox_cancel::Signal;

use crate::{CancelRead, CancelWrite, PartialError, Result};

const SCRATCH_SIZE: usize = 8 * 1024;

/// A writer which accepts and drops all data.
///
/// Copying into it with [`copy()`](crate::copy()) reads into a small scratch buffer instead of the
/// usual staging buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl CancelWrite for Discard {
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        signal.check()?;
        Ok(buf.len())
    }

    fn read_from(
        &self,
        signal: &Signal,
        src: &dyn CancelRead,
    ) -> Option<Result<u64, PartialError>> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut total = 0u64;
        loop {
            match src.read(signal, &mut scratch) {
                Ok(0) => return Some(Ok(total)),
                Ok(n) => total += n as u64,
                Err(err) => return Some(Err(PartialError::new(total, err))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use proxmox_cancel::Signal;

    use super::Discard;
    use crate::{copy, CancelWrite, Direct};

    #[test]
    fn test_discard() {
        let src = Direct::new(std::io::Cursor::new(vec![7u8; 20_000]));
        assert_eq!(copy(&Signal::new(), &Discard, &src).unwrap(), 20_000);
        assert_eq!(Discard.write(&Signal::new(), b"gone").unwrap(), 4);
    }
}
