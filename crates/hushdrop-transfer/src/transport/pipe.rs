//! Bounded in-process byte pipe.
//!
//! Connects blocking workers (which see `Read`/`Write`) to transport tasks.
//! The reader only reports a clean end of stream when the writer called
//! [`PipeWriter::finish`]; a writer that vanishes without it, or an explicit
//! [`PipeAbort::abort`], surfaces as `ConnectionAborted` on the reader.
//! An abort also releases a blocking writer stuck on a full pipe.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use crossbeam_channel::{Receiver, Sender, bounded, select};

struct Shared {
    finished: AtomicBool,
    aborted: AtomicBool,
    /// Never sent on. Dropping it disconnects every `aborted_rx` at once.
    abort_tx: Mutex<Option<Sender<()>>>,
}

/// Create a pipe holding at most `depth` unread writes.
pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(depth.max(1));
    let (abort_tx, aborted_rx) = bounded(0);
    let shared = Arc::new(Shared {
        finished: AtomicBool::new(false),
        aborted: AtomicBool::new(false),
        abort_tx: Mutex::new(Some(abort_tx)),
    });
    (
        PipeWriter {
            tx,
            aborted_rx: aborted_rx.clone(),
            shared: shared.clone(),
        },
        PipeReader {
            rx,
            aborted_rx,
            shared,
            current: Bytes::new(),
        },
    )
}

/// Write half. Every write blocks while the pipe is full, so async tasks
/// hand it to `spawn_blocking`.
pub struct PipeWriter {
    tx: Sender<Bytes>,
    aborted_rx: Receiver<()>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Queue one chunk without copying it.
    pub fn send(&self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(reader_closed());
        }
        select! {
            send(self.tx, data) -> sent => sent.map_err(|_| reader_closed()),
            recv(self.aborted_rx) -> _ => Err(reader_closed()),
        }
    }

    /// Mark the stream complete. The reader sees end of input once it has
    /// drained everything written before this call.
    pub fn finish(self) {
        self.shared.finished.store(true, Ordering::Release);
    }

    pub fn abort_handle(&self) -> PipeAbort {
        PipeAbort {
            shared: self.shared.clone(),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cuts a pipe from the outside, waking whichever side is blocked on it.
/// Does not keep the pipe open.
#[derive(Clone)]
pub struct PipeAbort {
    shared: Arc<Shared>,
}

impl PipeAbort {
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        let abort_tx = self
            .shared
            .abort_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        drop(abort_tx);
    }
}

/// Read half. Blocks while the pipe is empty. Dropping it fails the writer.
pub struct PipeReader {
    rx: Receiver<Bytes>,
    aborted_rx: Receiver<()>,
    shared: Arc<Shared>,
    current: Bytes,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            if self.shared.aborted.load(Ordering::Acquire) {
                return Err(stream_aborted());
            }
            select! {
                recv(self.rx) -> chunk => match chunk {
                    Ok(data) => self.current = data,
                    // Disconnected only after everything queued was read.
                    Err(_) if self.shared.finished.load(Ordering::Acquire) => return Ok(0),
                    Err(_) => return Err(stream_aborted()),
                },
                recv(self.aborted_rx) -> _ => return Err(stream_aborted()),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

fn reader_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

fn stream_aborted() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "stream aborted before completion",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn delivers_all_bytes_then_eof() {
        let (mut writer, mut reader) = pipe(2);
        let producer = thread::spawn(move || {
            for i in 0..10u8 {
                writer.write_all(&[i; 1000]).unwrap();
            }
            writer.finish();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();

        assert_eq!(out.len(), 10_000);
        assert_eq!(out[0], 0);
        assert_eq!(out[9_999], 9);
    }

    #[test]
    fn finished_pipe_is_drained_before_eof() {
        let (writer, mut reader) = pipe(4);
        writer.send(Bytes::from_static(b"queued ")).unwrap();
        writer.send(Bytes::from_static(b"before finish")).unwrap();
        writer.finish();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "queued before finish");
    }

    #[test]
    fn writer_dropped_without_finish_is_an_abort() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"partial").unwrap();
        drop(writer);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(out, b"partial");
    }

    #[test]
    fn abort_wakes_blocked_reader() {
        let (writer, mut reader) = pipe(4);
        let abort = writer.abort_handle();
        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        abort.abort();

        let err = consumer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        drop(writer);
    }

    #[test]
    fn abort_releases_writer_on_full_pipe() {
        let (mut writer, reader) = pipe(1);
        let abort = writer.abort_handle();
        let producer = thread::spawn(move || {
            writer.write_all(b"first")?;
            writer.write_all(b"second")
        });

        thread::sleep(Duration::from_millis(20));
        abort.abort();

        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        drop(reader);
    }

    #[test]
    fn aborting_twice_is_harmless() {
        let (writer, mut reader) = pipe(1);
        let abort = writer.abort_handle();
        abort.abort();
        abort.clone().abort();

        let err = writer.send(Bytes::from_static(b"late")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn dropping_reader_releases_writer() {
        let (mut writer, reader) = pipe(1);
        let producer = thread::spawn(move || {
            writer.write_all(b"first")?;
            writer.write_all(b"second")
        });

        thread::sleep(Duration::from_millis(20));
        drop(reader);

        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_after_reader_dropped_fails() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
