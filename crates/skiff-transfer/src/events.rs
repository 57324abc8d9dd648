use bytes::Bytes;
use skiff_protocol::transfer::FileMetadata;
use thiserror::Error;

/// Transfer session lifecycle. `Cancelled` and `Failed` are reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AnnouncingMetadata,
    Streaming,
    Completing,
    Done,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("chunk {chunk_index} of file {file_id} unacknowledged after {retries} retries")]
    RetryExhausted {
        file_id: String,
        chunk_index: u32,
        retries: u32,
    },
    #[error("content hash mismatch for file {file_id} ({filename})")]
    IntegrityFailure { file_id: String, filename: String },
    #[error("protocol desynchronization: {0}")]
    Desync(String),
    #[error("direct channel failed: {0}")]
    Channel(String),
    #[error("relay path failed: {0}")]
    Relay(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("wire encoding failed: {0}")]
    Wire(String),
}

/// A fully reassembled (or relay-downloaded) file whose content hash matched
/// the announced hash. `filename` is the sanitized form of the declared name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub filename: String,
    pub bytes: Bytes,
}

/// Everything a session reports, in order, on its event channel. Consumers
/// receive from the channel; there are no registered callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    StateChanged(SessionState),
    /// The session switched, permanently, to the relay path.
    FallbackEngaged { reason: String },
    FileProgress {
        file_id: String,
        transferred: u64,
        total: u64,
        chunks_done: u32,
        total_chunks: u32,
    },
    FileCompleted(ReceivedFile),
    /// Fatal to one file only; the rest of the batch continues.
    FileFailed {
        file_id: String,
        error: TransferError,
    },
    Completed,
    /// Terminal failure of the whole session.
    Failed(TransferError),
}
