//! Blocking encrypt/decrypt jobs, one per active session.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hushdrop_crypto::{ChunkObserver, CodecError, SymmetricKey, decrypt_stream, encrypt_stream};
use hushdrop_types::{FailureReason, SessionEvent, SessionHandle};

use crate::stats::SessionStats;
use crate::storage::{StagedFile, Storage, StorageError};
use crate::transport::PayloadStream;
use crate::transport::pipe::PipeWriter;

const READ_BUF_SIZE: usize = 64 * 1024;

pub(crate) enum WorkerOutcome {
    /// The whole frame was handed to the transport.
    Sent(u64),
    /// Authenticated plaintext, not yet visible.
    Received(StagedFile),
}

pub(crate) type WorkerResult = Result<WorkerOutcome, FailureReason>;

/// Bridges the codec's chunk hooks to the session's cancel token, counters
/// and event stream.
pub(crate) struct WorkerObserver {
    session: SessionHandle,
    cancel: CancellationToken,
    stats: Arc<SessionStats>,
    events: broadcast::Sender<SessionEvent>,
    progress_interval: u64,
}

impl WorkerObserver {
    pub(crate) fn new(
        session: SessionHandle,
        cancel: CancellationToken,
        stats: Arc<SessionStats>,
        events: broadcast::Sender<SessionEvent>,
        progress_interval: u64,
    ) -> Self {
        Self {
            session,
            cancel,
            stats,
            events,
            progress_interval,
        }
    }
}

impl ChunkObserver for WorkerObserver {
    fn should_continue(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn on_progress(&self, bytes: u64) {
        if self.stats.record(bytes, self.progress_interval) {
            let _ = self.events.send(SessionEvent::Progress {
                session: self.session,
                bytes_transferred: bytes,
                total_bytes: self.stats.total(),
            });
        }
    }
}

/// Encrypt a file into the outgoing pipe. The pipe is finished only on success,
/// so the remote side sees an aborted stream for every other outcome.
pub(crate) fn encrypt_file(
    path: &Path,
    mut out: PipeWriter,
    key: &SymmetricKey,
    observer: &WorkerObserver,
) -> WorkerResult {
    let file = File::open(path).map_err(io_failure)?;
    let reader = BufReader::with_capacity(READ_BUF_SIZE, file);

    let sent = encrypt_stream(reader, &mut out, key, observer).map_err(codec_failure)?;
    out.finish();
    debug!(session = %observer.session.id, bytes = sent, "Encryption finished");
    Ok(WorkerOutcome::Sent(sent))
}

/// Decrypt an incoming stream into a staged file. The staged file is dropped
/// (and deleted) on every failure.
pub(crate) fn decrypt_to_storage(
    storage: &Storage,
    file_name: &str,
    stream: PayloadStream,
    key: &SymmetricKey,
    observer: &WorkerObserver,
) -> WorkerResult {
    let mut staged = storage.stage(file_name).map_err(storage_failure)?;
    let received =
        decrypt_stream(stream, &mut staged, key, observer).map_err(codec_failure)?;
    staged.sync().map_err(io_failure)?;
    debug!(session = %observer.session.id, bytes = received, "Decryption authenticated");
    Ok(WorkerOutcome::Received(staged))
}

pub(crate) fn codec_failure(err: CodecError) -> FailureReason {
    match err {
        CodecError::MalformedStream => FailureReason::MalformedStream,
        CodecError::AuthenticationFailure => FailureReason::AuthenticationFailure,
        CodecError::Cancelled => FailureReason::Cancelled,
        CodecError::StreamTooLong => FailureReason::Io {
            message: err.to_string(),
        },
        CodecError::Io(e) => io_failure(e),
    }
}

pub(crate) fn io_failure(err: io::Error) -> FailureReason {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => FailureReason::Disconnected,
        _ => FailureReason::Io {
            message: err.to_string(),
        },
    }
}

pub(crate) fn storage_failure(err: StorageError) -> FailureReason {
    match err {
        StorageError::Io(e) => FailureReason::Io {
            message: e.to_string(),
        },
        other => FailureReason::Io {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe::pipe;
    use hushdrop_crypto::derive_key;
    use hushdrop_types::Role;
    use std::io::{Read, Write};

    fn observer(cancel: CancellationToken) -> (WorkerObserver, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let observer = WorkerObserver::new(
            SessionHandle::new(Role::Receiver),
            cancel,
            Arc::new(SessionStats::new()),
            tx,
            1024,
        );
        (observer, rx)
    }

    fn sealed(plaintext: &[u8], password: &str) -> PayloadStream {
        let frame = hushdrop_crypto::seal(plaintext, &derive_key(password)).unwrap();
        Box::new(io::Cursor::new(frame))
    }

    #[test]
    fn decrypt_stages_authenticated_data() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();
        let (observer, mut events) = observer(CancellationToken::new());

        let data = vec![7u8; 10_000];
        let outcome = decrypt_to_storage(
            &storage,
            "data.bin",
            sealed(&data, "pw"),
            &derive_key("pw"),
            &observer,
        )
        .unwrap();

        let WorkerOutcome::Received(staged) = outcome else {
            panic!("expected a staged file");
        };
        let file = staged.commit().unwrap();
        assert_eq!(std::fs::read(file.path).unwrap(), data);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Progress { .. }
        ));
    }

    #[test]
    fn wrong_key_leaves_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();
        let (observer, _events) = observer(CancellationToken::new());

        let result = decrypt_to_storage(
            &storage,
            "hello.txt",
            sealed(b"hello world", "secret123"),
            &derive_key("wrongpass"),
            &observer,
        );

        assert!(matches!(result, Err(FailureReason::AuthenticationFailure)));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn cut_stream_is_a_disconnect() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();
        let (observer, _events) = observer(CancellationToken::new());

        let (mut writer, reader) = pipe(4);
        writer.write_all(&[0u8; 40]).unwrap();
        drop(writer);

        let result = decrypt_to_storage(
            &storage,
            "x",
            Box::new(reader),
            &derive_key("pw"),
            &observer,
        );
        assert!(matches!(result, Err(FailureReason::Disconnected)));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancelled_encrypt_aborts_the_pipe() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.bin");
        std::fs::write(&path, vec![1u8; 100_000]).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (observer, _events) = observer(cancel);

        let (writer, mut reader) = pipe(64);
        let result = encrypt_file(&path, writer, &derive_key("pw"), &observer);
        assert!(matches!(result, Err(FailureReason::Cancelled)));

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
