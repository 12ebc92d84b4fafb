//! Chunked upload core: chunk storage, ordered reassembly and the
//! init / chunk / complete state machine.
//!
//! Session state lives on disk only. A chunk exists if its file exists
//! under the chunk directory; completeness is decided from that at
//! completion time, so nothing has to survive a restart in memory.

mod assemble;
mod claim;
mod service;
mod session;
mod store;
mod sweep;
mod validation;

use std::time::Duration;

use cropscan_classifier::ClassifyError;
use cropscan_protocol::ErrorKind;

pub use assemble::Reassembler;
pub use claim::{ClaimGuard, Claims};
pub use service::UploadService;
pub use session::{InvalidSessionId, generate_session_id, session_created_at, validate_session_id};
pub use store::{ChunkStore, FsChunkStore, checksum_bytes};
pub use sweep::{SweepReport, Sweeper};
pub use validation::validate_file_name;

/// Default time allowed for one storage operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest `totalChunks` a request may declare.
///
/// Completeness checks visit every index below the total, so the bound
/// also caps the work and the response size of one status request.
pub const MAX_TOTAL_CHUNKS: u64 = 100_000;

/// Errors produced by a [`ChunkStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("write cancelled")]
    Cancelled,
}

/// Errors surfaced to upload clients.
///
/// Each variant identifies the stage that failed so the caller can tell a
/// bad request from a gap in the chunk set, a merge failure or a
/// classifier failure.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("parameter {field}: {reason}")]
    Parameter { field: &'static str, reason: String },

    #[error("no data uploaded")]
    NoData,

    #[error("chunk not found: {0}")]
    NotFound(String),

    #[error("missing chunks: {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("completion already in progress for session {0}")]
    Conflict(String),

    #[error("reassembly failed: {0}")]
    Reassembly(String),

    #[error("classifier: {0}")]
    Downstream(#[from] ClassifyError),

    #[error("session id generation failed: {0}")]
    Entropy(String),

    #[error("storage timed out after {0:?}")]
    Timeout(Duration),

    /// The caller gave up (timeout or disconnect) and the work was abandoned.
    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl UploadError {
    /// A required field was not supplied.
    pub fn missing(field: &'static str) -> Self {
        Self::Parameter {
            field,
            reason: "missing".into(),
        }
    }

    /// A supplied field failed validation.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Parameter {
            field,
            reason: reason.into(),
        }
    }

    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parameter { .. } => ErrorKind::Parameter,
            Self::NoData => ErrorKind::NoData,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::IncompleteUpload { .. } => ErrorKind::MissingChunks,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Downstream(_) => ErrorKind::Downstream,
            Self::Entropy(_) => ErrorKind::Entropy,
            Self::Timeout(_) | Self::Cancelled => ErrorKind::Timeout,
            Self::Reassembly(_) | Self::Storage(_) | Self::Task(_) => ErrorKind::Processing,
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::InvalidKey(reason) => Self::invalid("sessionId", reason),
            StoreError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}
