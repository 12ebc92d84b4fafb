use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::ChunkStore;
use crate::{StoreError, UploadError};

/// Prefix of in-progress artifact files in the output directory.
pub(crate) const PART_PREFIX: &str = ".cropscan-";
pub(crate) const PART_SUFFIX: &str = ".part";

/// Concatenates a session's chunks into the final artifact.
///
/// The artifact is written to a hidden part file next to its final path,
/// synced, then renamed into place, so readers never see a partial file.
/// Chunks are purged only after the rename: a failed merge leaves every
/// chunk in the store for a retry.
#[derive(Debug, Clone)]
pub struct Reassembler {
    output_dir: PathBuf,
}

impl Reassembler {
    /// Creates the output directory if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Merges chunks `0..total` of `session_id` into `file_name`.
    ///
    /// The caller has already confirmed every index is present. A chunk
    /// that disappears in between is a [`UploadError::Reassembly`].
    ///
    /// `cancel` is checked before every chunk and before the rename. Once
    /// it fires the part file is removed and every chunk is left in place,
    /// so the completion can be retried.
    pub fn assemble<S: ChunkStore + ?Sized>(
        &self,
        store: &S,
        session_id: &str,
        file_name: &str,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UploadError> {
        let final_path = self.output_dir.join(file_name);
        let parent = final_path.parent().unwrap_or(&self.output_dir).to_path_buf();
        fs::create_dir_all(&parent)
            .map_err(|e| UploadError::Reassembly(format!("create {}: {e}", parent.display())))?;

        let part_path = parent.join(format!("{PART_PREFIX}{}{PART_SUFFIX}", Uuid::new_v4()));

        let mut result = self.write_part(store, session_id, total, &part_path, cancel);
        if result.is_ok() && cancel.is_cancelled() {
            result = Err(UploadError::Cancelled);
        }
        if let Err(e) = result {
            if let Err(rm) = fs::remove_file(&part_path) {
                tracing::warn!(path = %part_path.display(), error = %rm, "failed to remove partial artifact");
            }
            return Err(e);
        }

        if let Err(e) = fs::rename(&part_path, &final_path) {
            let _ = fs::remove_file(&part_path);
            return Err(UploadError::Reassembly(format!(
                "rename to {}: {e}",
                final_path.display()
            )));
        }

        for index in 0..total {
            if let Err(e) = store.delete(session_id, index) {
                tracing::warn!(
                    session_id = %session_id,
                    chunk_index = index,
                    error = %e,
                    "failed to delete consumed chunk"
                );
            }
        }

        tracing::info!(
            session_id = %session_id,
            chunks = total,
            path = %final_path.display(),
            "artifact assembled"
        );
        Ok(final_path)
    }

    fn write_part<S: ChunkStore + ?Sized>(
        &self,
        store: &S,
        session_id: &str,
        total: u64,
        part_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let file = File::create(part_path)
            .map_err(|e| UploadError::Reassembly(format!("create {}: {e}", part_path.display())))?;
        let mut writer = BufWriter::new(file);

        for index in 0..total {
            if cancel.is_cancelled() {
                tracing::debug!(session_id = %session_id, chunk_index = index, "reassembly cancelled");
                return Err(UploadError::Cancelled);
            }
            let data = store.read(session_id, index).map_err(|e| {
                UploadError::Reassembly(format!("read chunk {index} of {session_id}: {e}"))
            })?;
            writer
                .write_all(&data)
                .map_err(|e| UploadError::Reassembly(format!("write chunk {index}: {e}")))?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| UploadError::Reassembly(format!("flush: {}", e.error())))?;
        file.sync_all()
            .map_err(|e| UploadError::Reassembly(format!("sync: {e}")))?;
        Ok(())
    }
}
