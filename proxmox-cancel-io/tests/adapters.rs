use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Result};
use crossbeam_channel::Sender;

use proxmox_cancel::{Reason, Signal};
use proxmox_cancel_io::{
    wrap_deadline_reader, wrap_deadline_writer, wrap_reader, wrap_writer, CancelRead,
    CancelWrite, Close, DeadlineFd, Error,
};

fn init_log() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUST_LOG", "debug"))
        .is_test(true)
        .try_init();
}

#[test]
fn test_deadline_read_cancel_and_resume() -> Result<()> {
    init_log();
    let (a, mut b) = UnixStream::pair()?;
    let reader = wrap_deadline_reader(DeadlineFd::new(a)?)?;
    ensure!(reader.uses_deadline(), "unix sockets support deadlines");

    let signal = Signal::new();
    let start = Instant::now();
    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(30));
            signal.cancel();
        });

        let mut buf = [0u8; 16];
        match reader.read(&signal, &mut buf) {
            Err(Error::Canceled(Reason::Canceled)) => (),
            other => panic!("expected cancellation, got {other:?}"),
        }
    });
    ensure!(start.elapsed() < Duration::from_secs(5), "cancel took too long");

    // the forced deadline does not leak into the next call
    b.write_all(b"resumed")?;
    let mut buf = [0u8; 16];
    let got = reader.read(&Signal::with_timeout(Duration::from_secs(10)), &mut buf)?;
    ensure!(&buf[..got] == b"resumed");

    reader.close()?;
    reader.close()?;
    match reader.read(&Signal::new(), &mut buf) {
        Err(Error::Closed) => Ok(()),
        other => bail!("expected closed error, got {other:?}"),
    }
}

#[test]
fn test_deadline_write_timeout() -> Result<()> {
    init_log();
    let (a, _b) = UnixStream::pair()?;
    let writer = wrap_deadline_writer(DeadlineFd::new(a)?)?;
    ensure!(writer.uses_deadline());

    // nobody reads, so the socket buffer fills up and a write blocks
    let data = vec![0u8; 1024 * 1024];
    let signal = Signal::with_timeout(Duration::from_millis(50));
    let start = Instant::now();
    loop {
        match writer.write(&signal, &data) {
            Ok(n) => ensure!(n > 0 && n <= data.len()),
            Err(Error::Canceled(Reason::DeadlineExceeded)) => break,
            Err(err) => bail!("unexpected error {err:?}"),
        }
        ensure!(start.elapsed() < Duration::from_secs(5), "write never blocked");
    }

    Ok(())
}

#[test]
fn test_proxy_read_retry_cycles() -> Result<()> {
    init_log();
    let (a, mut b) = UnixStream::pair()?;
    let reader = wrap_reader(a)?;

    let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    let mut out = Vec::new();
    let mut cancellations = 0;

    std::thread::scope(|s| -> Result<()> {
        s.spawn(|| {
            for chunk in data.chunks(100) {
                std::thread::sleep(Duration::from_millis(5));
                b.write_all(chunk).unwrap();
            }
            drop(b);
        });

        let mut buf = [0u8; 64];
        loop {
            match reader.read(&Signal::with_timeout(Duration::from_millis(2)), &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Error::Canceled(Reason::DeadlineExceeded)) => cancellations += 1,
                Err(err) => bail!("unexpected error {err:?}"),
            }
        }
        Ok(())
    })?;

    ensure!(out == data, "data lost or reordered across cancellations");
    ensure!(cancellations > 0, "no read was ever canceled");
    Ok(())
}

/// Writer blocking until a consumer takes each write.
struct Handoff(Sender<Vec<u8>>);

impl Write for Handoff {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_proxy_write_retry_cycles() -> Result<()> {
    init_log();
    let (tx, rx) = crossbeam_channel::bounded(0);
    let writer = wrap_writer(Handoff(tx))?;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();

    let consumer = std::thread::spawn(move || {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.recv() {
            std::thread::sleep(Duration::from_millis(1));
            out.extend_from_slice(&chunk);
        }
        out
    });

    let mut written = 0;
    let mut cancellations = 0;
    while written < data.len() {
        match writer.write(&Signal::with_timeout(Duration::from_millis(2)), &data[written..]) {
            Ok(n) => written += n,
            Err(Error::Canceled(Reason::DeadlineExceeded)) => cancellations += 1,
            Err(err) => bail!("unexpected error {err:?}"),
        }
    }
    drop(writer);

    let out = match consumer.join() {
        Ok(out) => out,
        Err(_) => bail!("consumer panicked"),
    };
    ensure!(out.len() == data.len(), "got {} of {} bytes", out.len(), data.len());
    ensure!(out == data);
    log::debug!("{cancellations} writes canceled");
    Ok(())
}
