use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::StoreError;
use crate::session::validate_session_id;

/// Persistence for chunk payloads keyed by `(session, index)`.
///
/// Methods are blocking; callers run them on the blocking pool.
pub trait ChunkStore: Send + Sync + 'static {
    /// Stores a payload, replacing any previous one under the same key,
    /// unless `cancel` fires before the payload becomes visible.
    ///
    /// A cancelled put returns [`StoreError::Cancelled`] and leaves the key
    /// untouched, so it can never overwrite a later put of the same key.
    fn put_cancellable(
        &self,
        session_id: &str,
        index: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Stores a payload, replacing any previous one under the same key.
    fn put(&self, session_id: &str, index: u64, data: &[u8]) -> Result<(), StoreError> {
        self.put_cancellable(session_id, index, data, &CancellationToken::new())
    }

    fn exists(&self, session_id: &str, index: u64) -> Result<bool, StoreError>;

    fn read(&self, session_id: &str, index: u64) -> Result<Vec<u8>, StoreError>;

    /// Removes a chunk. Deleting an absent chunk is not an error.
    fn delete(&self, session_id: &str, index: u64) -> Result<(), StoreError>;

    /// Indices in `0..total` with no stored chunk, ascending.
    fn missing(&self, session_id: &str, total: u64) -> Result<Vec<u64>, StoreError> {
        let mut missing = Vec::new();
        for index in 0..total {
            if !self.exists(session_id, index)? {
                missing.push(index);
            }
        }
        Ok(missing)
    }
}

/// Filesystem chunk store: one file per chunk under a flat directory.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    dir: PathBuf,
    /// Serializes the cancel check and rename of every put.
    commit: Arc<Mutex<()>>,
}

impl FsChunkStore {
    /// Opens the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            commit: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_path(&self, session_id: &str, index: u64) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        Ok(self.dir.join(format!("{session_id}_{index}")))
    }
}

impl ChunkStore for FsChunkStore {
    fn put_cancellable(
        &self,
        session_id: &str,
        index: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let path = self.chunk_path(session_id, index)?;
        let tmp_path = self.dir.join(format!(".tmp.{}", Uuid::new_v4()));

        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        // A put whose caller has already been told it failed must not land
        // after the retry that followed. The retry's rename needs this lock,
        // so checking under it orders the two.
        let _commit = self.commit.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&tmp_path);
            tracing::debug!(session_id = %session_id, chunk_index = index, "chunk write cancelled before commit");
            return Err(StoreError::Cancelled);
        }

        match fs::rename(&tmp_path, &path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // The sweep or an operator removed the temp file under us.
                Err(StoreError::NotFound(format!(
                    "temp file for {session_id}_{index} vanished before rename"
                )))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e.into())
            }
        }
    }

    fn exists(&self, session_id: &str, index: u64) -> Result<bool, StoreError> {
        let path = self.chunk_path(session_id, index)?;
        Ok(path.try_exists()?)
    }

    fn read(&self, session_id: &str, index: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.chunk_path(session_id, index)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{session_id}_{index}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, session_id: &str, index: u64) -> Result<(), StoreError> {
        let path = self.chunk_path(session_id, index)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hex SHA-256 of a chunk payload.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = FsChunkStore::open(dir.path().join("temp")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_directory() {
        let (_dir, store) = store();
        assert!(store.dir().is_dir());
    }

    #[test]
    fn put_then_read() {
        let (_dir, store) = store();
        store.put("S", 0, b"AAA").unwrap();
        assert!(store.exists("S", 0).unwrap());
        assert_eq!(store.read("S", 0).unwrap(), b"AAA");
        assert!(store.dir().join("S_0").is_file());
    }

    #[test]
    fn reupload_replaces_payload() {
        let (_dir, store) = store();
        store.put("S", 1, b"first").unwrap();
        store.put("S", 1, b"second").unwrap();
        assert_eq!(store.read("S", 1).unwrap(), b"second");
    }

    #[test]
    fn put_leaves_no_temp_files() {
        let (_dir, store) = store();
        store.put("S", 0, b"x").unwrap();
        store.put("S", 1, b"y").unwrap();
        assert_eq!(temp_files(&store), 0);
    }

    fn temp_files(store: &FsChunkStore) -> usize {
        fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
            .count()
    }

    #[test]
    fn cancelled_put_keeps_previous_payload() {
        let (_dir, store) = store();
        store.put("S", 0, b"kept").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = store.put_cancellable("S", 0, b"stale", &cancel);
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(store.read("S", 0).unwrap(), b"kept");
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn cancelled_put_creates_nothing() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(store.put_cancellable("S", 3, b"x", &cancel).is_err());
        assert!(!store.exists("S", 3).unwrap());
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn read_absent_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.read("S", 7), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.put("S", 0, b"x").unwrap();
        store.delete("S", 0).unwrap();
        store.delete("S", 0).unwrap();
        assert!(!store.exists("S", 0).unwrap());
    }

    #[test]
    fn missing_lists_gaps_ascending() {
        let (_dir, store) = store();
        store.put("S", 0, b"a").unwrap();
        store.put("S", 2, b"c").unwrap();
        assert_eq!(store.missing("S", 3).unwrap(), vec![1]);
        assert_eq!(store.missing("S", 5).unwrap(), vec![1, 3, 4]);
        assert!(store.missing("S", 1).unwrap().is_empty());
    }

    #[test]
    fn sessions_do_not_share_keys() {
        let (_dir, store) = store();
        store.put("S1", 0, b"one").unwrap();
        assert!(!store.exists("S", 10).unwrap());
        assert!(!store.exists("S2", 0).unwrap());
    }

    #[test]
    fn rejects_unsafe_session_id() {
        let (_dir, store) = store();
        let result = store.put("../escape", 0, b"x");
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
