use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::session::validate_session_id;
use crate::{StoreError, UploadError};

/// Suffix of completion claim records in the chunk directory.
pub(crate) const CLAIM_SUFFIX: &str = ".claim";

/// Per-session completion claims backed by `<session>.claim` files.
///
/// Creating the file with `create_new` is the check-and-set: exactly one
/// caller wins, across tasks and across processes sharing the directory.
#[derive(Debug, Clone)]
pub struct Claims {
    dir: PathBuf,
}

impl Claims {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Takes the completion claim for `session_id`.
    ///
    /// Returns [`UploadError::Conflict`] while another holder has it.
    pub fn acquire(&self, session_id: &str) -> Result<ClaimGuard, UploadError> {
        validate_session_id(session_id).map_err(|e| UploadError::invalid("sessionId", e.to_string()))?;
        let path = self.dir.join(format!("{session_id}{CLAIM_SUFFIX}"));

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UploadError::Conflict(session_id.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e).into()),
        };
        // Holder pid for operators; the claim itself is the file's existence.
        let _ = writeln!(file, "{}", std::process::id());

        tracing::debug!(session_id = %session_id, "completion claim taken");
        Ok(ClaimGuard { path })
    }
}

/// Releases the claim when dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    path: PathBuf,
}

impl ClaimGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release completion claim");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_conflicts() {
        let dir = TempDir::new().unwrap();
        let claims = Claims::new(dir.path());
        let _guard = claims.acquire("S").unwrap();
        let err = claims.acquire("S").unwrap_err();
        assert!(matches!(err, UploadError::Conflict(ref id) if id == "S"));
    }

    #[test]
    fn drop_releases_claim() {
        let dir = TempDir::new().unwrap();
        let claims = Claims::new(dir.path());
        let guard = claims.acquire("S").unwrap();
        let path = guard.path().to_path_buf();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
        assert!(claims.acquire("S").is_ok());
    }

    #[test]
    fn sessions_are_independent() {
        let dir = TempDir::new().unwrap();
        let claims = Claims::new(dir.path());
        let _a = claims.acquire("A").unwrap();
        assert!(claims.acquire("B").is_ok());
    }

    #[test]
    fn rejects_unsafe_session_id() {
        let dir = TempDir::new().unwrap();
        let claims = Claims::new(dir.path());
        let err = claims.acquire("../x").unwrap_err();
        assert!(matches!(err, UploadError::Parameter { field: "sessionId", .. }));
    }
}
