//! Copying between cancellation aware readers and writers.

use proxmox_cancel::Signal;

use crate::{CancelRead, CancelWrite, Error, PartialError, Result};

/// Size of the staging buffer used by [`copy()`].
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy from `src` to `dst` until `src` reports the end of data or an error occurs.
///
/// Returns the number of bytes copied; reaching the end of data is not an error. On failure
/// the returned [`PartialError`] holds the number of bytes written to `dst` before it. A writer
/// accepting fewer bytes than offered without reporting why is a [`Error::ShortWrite`].
///
/// If `src` implements [`write_to`](CancelRead::write_to) or `dst` implements
/// [`read_from`](CancelWrite::read_from), the copy is left to them. Otherwise data is staged in
/// a buffer of [`DEFAULT_COPY_BUFFER_SIZE`] bytes.
///
/// ```
/// use proxmox_cancel::Signal;
/// use proxmox_cancel_io::{copy, Direct, NopClose};
///
/// # fn code() -> Result<(), proxmox_cancel_io::PartialError> {
/// let src = Direct::new(std::io::Cursor::new(b"some data".to_vec()));
/// let dst = NopClose::new(Direct::new(Vec::new()));
///
/// assert_eq!(copy(&Signal::new(), &dst, &src)?, 9);
/// assert_eq!(dst.into_inner().into_inner(), b"some data");
/// # Ok(())
/// # }
/// # code().unwrap();
/// ```
pub fn copy(
    signal: &Signal,
    dst: &dyn CancelWrite,
    src: &dyn CancelRead,
) -> Result<u64, PartialError> {
    if let Some(res) = delegate(signal, dst, src) {
        return res;
    }

    let mut buf = vec![0u8; DEFAULT_COPY_BUFFER_SIZE];
    copy_loop(signal, dst, src, &mut buf)
}

/// Like [`copy()`] but stages data in `buf` instead of allocating a buffer.
///
/// An empty `buf` is rejected with [`Error::ShortBuffer`].
pub fn copy_buffer(
    signal: &Signal,
    dst: &dyn CancelWrite,
    src: &dyn CancelRead,
    buf: &mut [u8],
) -> Result<u64, PartialError> {
    if buf.is_empty() {
        return Err(PartialError::new(0, Error::ShortBuffer));
    }

    if let Some(res) = delegate(signal, dst, src) {
        return res;
    }

    copy_loop(signal, dst, src, buf)
}

fn delegate(
    signal: &Signal,
    dst: &dyn CancelWrite,
    src: &dyn CancelRead,
) -> Option<Result<u64, PartialError>> {
    src.write_to(signal, dst).or_else(|| dst.read_from(signal, src))
}

fn copy_loop(
    signal: &Signal,
    dst: &dyn CancelWrite,
    src: &dyn CancelRead,
    buf: &mut [u8],
) -> Result<u64, PartialError> {
    let mut total = 0u64;

    loop {
        let got = match src.read(signal, buf) {
            Ok(0) => return Ok(total),
            Ok(got) => got,
            Err(err) => return Err(PartialError::new(total, err)),
        };

        let (written, error) = write_chunk(signal, dst, &buf[..got]);
        total += written as u64;
        if let Some(err) = error {
            return Err(PartialError::new(total, err));
        }
    }
}

/// Write `data` with a single call, returning how much was written and what went wrong.
///
/// A writer returning a short count reports the reason with its next call, so one more write
/// is issued to pick it up. If that one succeeds the writer broke its contract.
fn write_chunk(signal: &Signal, dst: &dyn CancelWrite, data: &[u8]) -> (usize, Option<Error>) {
    let written = match dst.write(signal, data) {
        Ok(n) if n > data.len() => return (0, Some(Error::InvalidWrite)),
        Ok(n) if n == data.len() => return (n, None),
        Ok(n) => n,
        Err(err) => return (0, Some(err)),
    };

    let rest = &data[written..];
    match dst.write(signal, rest) {
        Ok(n) if n > rest.len() => (written, Some(Error::InvalidWrite)),
        Ok(n) => (written + n, Some(Error::ShortWrite)),
        Err(err) => (written, Some(err)),
    }
}

/// Write a string to `dst`.
pub fn write_str(signal: &Signal, dst: &dyn CancelWrite, s: &str) -> Result<usize> {
    dst.write(signal, s.as_bytes())
}
