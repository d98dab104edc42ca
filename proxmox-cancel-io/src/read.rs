//! Helpers reading more than a single chunk.

use proxmox_cancel::Signal;

use crate::{CancelRead, Error, PartialError, Result};

const MIN_READ_SIZE: usize = 512;

/// Read until `buf` holds at least `min` bytes.
///
/// Returns the number of bytes read, which may be more than `min`. Fails with
/// [`Error::ShortBuffer`] if `buf` is shorter than `min`, with [`Error::Eof`] if the reader
/// reported the end of data before anything was read and with [`Error::UnexpectedEof`] if it
/// did so after fewer than `min` bytes. The error's [`done`](PartialError::done) count tells
/// how much of `buf` was filled.
pub fn read_at_least<R>(
    signal: &Signal,
    src: &R,
    buf: &mut [u8],
    min: usize,
) -> Result<usize, PartialError>
where
    R: CancelRead + ?Sized,
{
    if buf.len() < min {
        return Err(PartialError::new(0, Error::ShortBuffer));
    }

    let mut done = 0;
    while done < min {
        let error = match src.read(signal, &mut buf[done..]) {
            Ok(0) if done == 0 => Error::Eof,
            Ok(0) => Error::UnexpectedEof,
            Ok(n) => {
                done += n;
                continue;
            }
            Err(err) => err,
        };
        return Err(PartialError::new(done as u64, error));
    }

    Ok(done)
}

/// Fill all of `buf`, see [`read_at_least`].
///
/// ```
/// use proxmox_cancel::Signal;
/// use proxmox_cancel_io::{read_full, Direct, Error};
///
/// let src = Direct::new(std::io::Cursor::new(b"0123456789".to_vec()));
///
/// let mut buf = [0u8; 8];
/// assert_eq!(read_full(&Signal::new(), &src, &mut buf).unwrap(), 8);
///
/// let err = read_full(&Signal::new(), &src, &mut buf).unwrap_err();
/// assert!(matches!(err.error, Error::UnexpectedEof));
/// assert_eq!(&buf[..err.done as usize], b"89");
///
/// let err = read_full(&Signal::new(), &src, &mut buf).unwrap_err();
/// assert!(matches!(err.error, Error::Eof));
/// ```
pub fn read_full<R>(signal: &Signal, src: &R, buf: &mut [u8]) -> Result<usize, PartialError>
where
    R: CancelRead + ?Sized,
{
    let len = buf.len();
    read_at_least(signal, src, buf, len)
}

/// Append everything up to the end of data to `out`.
///
/// Returns the number of bytes appended. On error the data read so far stays in `out`.
pub fn read_to_end<R>(signal: &Signal, src: &R, out: &mut Vec<u8>) -> Result<usize>
where
    R: CancelRead + ?Sized,
{
    let start = out.len();
    out.reserve(MIN_READ_SIZE);

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }

        let filled = out.len();
        out.resize(out.capacity(), 0);

        match src.read(signal, &mut out[filled..]) {
            Ok(0) => {
                out.truncate(filled);
                return Ok(filled - start);
            }
            Ok(n) => out.truncate(filled + n.min(out.len() - filled)),
            Err(err) => {
                out.truncate(filled);
                return Err(err);
            }
        }
    }
}

/// Read everything up to the end of data into a new vector.
pub fn read_all<R>(signal: &Signal, src: &R) -> Result<Vec<u8>>
where
    R: CancelRead + ?Sized,
{
    let mut out = Vec::with_capacity(MIN_READ_SIZE);
    read_to_end(signal, src, &mut out)?;
    Ok(out)
}
