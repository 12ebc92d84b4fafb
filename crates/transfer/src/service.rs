use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cropscan_classifier::Classifier;
use cropscan_protocol::messages::{
    CompleteUploadRequest, CompleteUploadResponse, UploadChunkRequest, UploadChunkResponse,
    UploadStatusRequest, UploadStatusResponse,
};
use tokio_util::sync::CancellationToken;

use crate::assemble::Reassembler;
use crate::claim::Claims;
use crate::session::{generate_session_id, validate_session_id};
use crate::store::{ChunkStore, checksum_bytes};
use crate::validation::validate_file_name;
use crate::{DEFAULT_IO_TIMEOUT, MAX_TOTAL_CHUNKS, UploadError};

/// The init / chunk / complete state machine, independent of transport.
///
/// Holds no per-session memory. Every decision is made from what the
/// chunk store reports at the time of the request.
pub struct UploadService<S, C: ?Sized> {
    store: Arc<S>,
    claims: Claims,
    reassembler: Reassembler,
    classifier: Arc<C>,
    io_timeout: Duration,
}

impl<S, C: ?Sized> Clone for UploadService<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            claims: self.claims.clone(),
            reassembler: self.reassembler.clone(),
            classifier: Arc::clone(&self.classifier),
            io_timeout: self.io_timeout,
        }
    }
}

impl<S: ChunkStore, C: Classifier + ?Sized> UploadService<S, C> {
    pub fn new(store: Arc<S>, claims: Claims, reassembler: Reassembler, classifier: Arc<C>) -> Self {
        Self {
            store,
            claims,
            reassembler,
            classifier,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Sets the limit for each blocking storage step.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issues a new session id. Nothing is written until the first chunk.
    pub fn initiate(&self) -> Result<String, UploadError> {
        let session_id = generate_session_id()?;
        tracing::info!(session_id = %session_id, "upload session issued");
        Ok(session_id)
    }

    /// Stores one chunk, replacing any earlier upload of the same index.
    pub async fn upload_chunk(
        &self,
        req: UploadChunkRequest,
    ) -> Result<UploadChunkResponse, UploadError> {
        let session_id = require_session_id(req.session_id)?;
        let chunk_index = req.chunk_index.ok_or_else(|| UploadError::missing("chunkIndex"))?;
        let total_chunks = req.total_chunks.ok_or_else(|| UploadError::missing("totalChunks"))?;
        check_total_bound(total_chunks)?;

        let data = match req.data {
            Some(data) if !data.is_empty() => data,
            _ => return Err(UploadError::NoData),
        };

        if let Some(expected) = req.checksum.as_deref() {
            let actual = checksum_bytes(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(UploadError::invalid(
                    "checksum",
                    format!("mismatch: expected {expected}, got {actual}"),
                ));
            }
        }

        let size = data.len();
        let store = Arc::clone(&self.store);
        let sid = session_id.clone();
        self.run_blocking(move |cancel| {
            store
                .put_cancellable(&sid, chunk_index, &data, cancel)
                .map_err(UploadError::from)
        })
            .await
            .inspect_err(|e| {
                tracing::error!(session_id = %session_id, chunk_index, error = %e, "chunk write failed");
            })?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index,
            total_chunks,
            size,
            file_name = req.file_name.as_deref().unwrap_or(""),
            "chunk stored"
        );

        Ok(UploadChunkResponse {
            session_id,
            chunk_index,
        })
    }

    /// Verifies the chunk set, assembles the artifact and classifies it.
    ///
    /// A classifier failure is reported as [`UploadError::Downstream`] and
    /// the assembled artifact stays on disk.
    pub async fn complete(
        &self,
        req: CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, UploadError> {
        let session_id = require_session_id(req.session_id)?;
        let file_name = match req.file_name {
            Some(name) => {
                validate_file_name(&name)?;
                name
            }
            None => return Err(UploadError::missing("fileName")),
        };
        let total_chunks = require_total(req.total_chunks)?;

        let store = Arc::clone(&self.store);
        let claims = self.claims.clone();
        let reassembler = self.reassembler.clone();
        let sid = session_id.clone();
        let name = file_name.clone();

        let artifact: PathBuf = self
            .run_blocking(move |cancel| {
                let _claim = claims.acquire(&sid)?;
                let missing = store.missing(&sid, total_chunks)?;
                if !missing.is_empty() {
                    return Err(UploadError::IncompleteUpload { missing });
                }
                reassembler.assemble(store.as_ref(), &sid, &name, total_chunks, cancel)
            })
            .await
            .inspect_err(|e| {
                tracing::warn!(session_id = %session_id, file_name = %file_name, error = %e, "completion rejected");
            })?;

        let result = self.classifier.classify(&artifact).await.map_err(|e| {
            tracing::warn!(
                session_id = %session_id,
                path = %artifact.display(),
                error = %e,
                "classification failed, artifact kept"
            );
            UploadError::Downstream(e)
        })?;

        tracing::info!(
            session_id = %session_id,
            path = %artifact.display(),
            label = %result.label,
            confidence = result.confidence,
            "upload completed"
        );

        Ok(CompleteUploadResponse {
            result,
            artifact_path: artifact.display().to_string(),
        })
    }

    /// Reports which chunks of `0..totalChunks` are stored.
    pub async fn status(
        &self,
        req: UploadStatusRequest,
    ) -> Result<UploadStatusResponse, UploadError> {
        let session_id = require_session_id(req.session_id)?;
        let total_chunks = require_total(req.total_chunks)?;

        let store = Arc::clone(&self.store);
        let sid = session_id.clone();
        let missing = self
            .run_blocking(move |_| store.missing(&sid, total_chunks).map_err(UploadError::from))
            .await?;

        let mut gaps = missing.iter().peekable();
        let present = (0..total_chunks)
            .filter(|i| {
                if gaps.peek() == Some(&i) {
                    gaps.next();
                    false
                } else {
                    true
                }
            })
            .collect();

        Ok(UploadStatusResponse {
            session_id,
            total_chunks,
            present,
            missing,
        })
    }

    /// Runs `f` on the blocking pool under the I/O timeout.
    ///
    /// The token handed to `f` is cancelled as soon as this call stops
    /// waiting, whether through the timeout or because the request itself
    /// was dropped. `f` is expected to check it before any step that
    /// publishes or consumes state.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T, UploadError>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, UploadError> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let _abandon = cancel.clone().drop_guard();
        let task = tokio::task::spawn_blocking(move || f(&cancel));

        match tokio::time::timeout(self.io_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(UploadError::Task(e.to_string())),
            Err(_) => Err(UploadError::Timeout(self.io_timeout)),
        }
    }
}

fn require_session_id(session_id: Option<String>) -> Result<String, UploadError> {
    let session_id = match session_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(UploadError::missing("sessionId")),
    };
    validate_session_id(&session_id).map_err(|e| UploadError::invalid("sessionId", e.to_string()))?;
    Ok(session_id)
}

fn require_total(total_chunks: Option<u64>) -> Result<u64, UploadError> {
    match total_chunks {
        None => Err(UploadError::missing("totalChunks")),
        Some(0) => Err(UploadError::invalid("totalChunks", "must be at least 1")),
        Some(n) => check_total_bound(n).map(|()| n),
    }
}

fn check_total_bound(total_chunks: u64) -> Result<(), UploadError> {
    if total_chunks > MAX_TOTAL_CHUNKS {
        return Err(UploadError::invalid(
            "totalChunks",
            format!("{total_chunks} exceeds the limit of {MAX_TOTAL_CHUNKS}"),
        ));
    }
    Ok(())
}
