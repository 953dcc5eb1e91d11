//! LMDB-backed container store.
//!
//! Uses the heed crate (Rust bindings for LMDB) as the opaque durable
//! key/value store underneath a KEA image. All keys of one image live in a
//! single unnamed database; see [`crate::layout`] for the key scheme.
//!
//! # Atomicity
//!
//! Every mutation goes through [`Container::write`], which runs a closure
//! against one LMDB write transaction. The transaction commits only if the
//! closure succeeds; an error (or a failed commit) aborts it, leaving the
//! container at its previous committed state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use kea_core::{ImageError, KeaError, TableError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for container operations.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes do not decode.
    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// No container exists at the path.
    #[error("No container at {0}")]
    Missing(PathBuf),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert ContainerError to TableError.
impl From<ContainerError> for TableError {
    fn from(e: ContainerError) -> Self {
        TableError::BackendIOFailure {
            reason: e.to_string(),
        }
    }
}

/// Convert ContainerError to KeaError.
impl From<ContainerError> for KeaError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Corrupt { key, reason } => {
                KeaError::Image(ImageError::CorruptHeader { key, reason })
            }
            ContainerError::Missing(path) => KeaError::Image(ImageError::NotFound {
                path: path.display().to_string(),
            }),
            other => KeaError::Table(other.into()),
        }
    }
}

/// An open container file.
///
/// Shared between the image-band manager and every persistent table opened
/// from it via `Arc<Container>`.
pub struct Container {
    path: PathBuf,
    env: Env,
    db: Database<Bytes, Bytes>,
    /// Per-band layout locks shared by all table handles of this container.
    layout_locks: Mutex<HashMap<u32, Arc<RwLock<()>>>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("path", &self.path).finish()
    }
}

impl Container {
    /// Create the container directory if needed and open it.
    pub fn create<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, ContainerError> {
        std::fs::create_dir_all(&path)?;
        Self::open_env(path.as_ref(), map_size_mb)
    }

    /// Open an existing container directory. Nothing is created on disk if
    /// the directory is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory does not exist
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(ContainerError::Missing(path.to_path_buf()));
        }
        Self::open_env(path, map_size_mb)
    }

    fn open_env(path: &Path, map_size_mb: usize) -> Result<Self, ContainerError> {
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| ContainerError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| ContainerError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            env,
            db,
            layout_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a raw value.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ContainerError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;

        let value = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    /// Read and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContainerError> {
        match self.get(key)? {
            Some(bytes) => decode_json(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, ContainerError> {
        Ok(self.get(key)?.is_some())
    }

    /// Run `f` inside one write transaction and commit it.
    ///
    /// If `f` fails, or the commit fails, nothing is written.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut Batch<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<ContainerError>,
    {
        let wtxn = self
            .env
            .write_txn()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;
        let mut batch = Batch { txn: wtxn, db: self.db };

        let out = f(&mut batch)?;

        batch
            .txn
            .commit()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;
        Ok(out)
    }

    /// The layout lock for a band, created on first use.
    pub fn layout_lock(&self, band: u32) -> Result<Arc<RwLock<()>>, TableError> {
        let mut locks = self
            .layout_locks
            .lock()
            .map_err(|_| TableError::LockPoisoned)?;
        Ok(locks.entry(band).or_default().clone())
    }

    /// Flush to disk and close the environment, waiting until LMDB has
    /// released the files.
    pub fn close(self) -> Result<(), ContainerError> {
        self.env
            .force_sync()
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;
        self.env.prepare_for_closing().wait();
        Ok(())
    }
}

/// An open write transaction.
pub struct Batch<'a> {
    txn: RwTxn<'a>,
    db: Database<Bytes, Bytes>,
}

impl Batch<'_> {
    /// Read a value as seen by this transaction.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ContainerError> {
        let value = self
            .db
            .get(&self.txn, key.as_bytes())
            .map_err(|e| ContainerError::Transaction(e.to_string()))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContainerError> {
        match self.get(key)? {
            Some(bytes) => decode_json(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), ContainerError> {
        self.db
            .put(&mut self.txn, key.as_bytes(), value)
            .map_err(|e| ContainerError::Transaction(e.to_string()))
    }

    /// Remove every key.
    pub fn clear(&mut self) -> Result<(), ContainerError> {
        self.db
            .clear(&mut self.txn)
            .map_err(|e| ContainerError::Transaction(e.to_string()))
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ContainerError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| ContainerError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }
}

fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, ContainerError> {
    serde_json::from_slice(bytes).map_err(|e| ContainerError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_container() -> (Container, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let container =
            Container::create(temp_dir.path(), 10).expect("container creation should succeed");
        (container, temp_dir)
    }

    #[test]
    fn test_put_and_get() {
        let (container, _temp_dir) = create_test_container();
        container
            .write(|batch| batch.put("/A", b"hello"))
            .expect("write should succeed");
        assert_eq!(container.get("/A").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(container.get("/B").unwrap(), None);
    }

    #[test]
    fn test_failed_closure_aborts() {
        let (container, _temp_dir) = create_test_container();
        let result: Result<(), ContainerError> = container.write(|batch| {
            batch.put("/A", b"one")?;
            Err(ContainerError::Serialization("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(!container.contains("/A").unwrap());
    }

    #[test]
    fn test_batch_sees_own_writes() {
        let (container, _temp_dir) = create_test_container();
        container
            .write(|batch| {
                batch.put_json("/J", &vec![1u32, 2, 3])?;
                let read: Option<Vec<u32>> = batch.get_json("/J")?;
                assert_eq!(read, Some(vec![1, 2, 3]));
                Ok::<_, ContainerError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_corrupt_json_is_reported() {
        let (container, _temp_dir) = create_test_container();
        container.write(|batch| batch.put("/J", b"{not json")).unwrap();
        let err = container.get_json::<Vec<u32>>("/J").unwrap_err();
        assert!(matches!(err, ContainerError::Corrupt { .. }));
    }

    #[test]
    fn test_layout_lock_is_shared_per_band() {
        let (container, _temp_dir) = create_test_container();
        let a = container.layout_lock(1).unwrap();
        let b = container.layout_lock(1).unwrap();
        let c = container.layout_lock(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_reopen_after_close() {
        let temp_dir = TempDir::new().unwrap();
        {
            let container = Container::create(temp_dir.path(), 10).unwrap();
            container.write(|batch| batch.put("/K", b"v")).unwrap();
            container.close().unwrap();
        }
        let container = Container::open(temp_dir.path(), 10).unwrap();
        assert_eq!(container.get("/K").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_clear_removes_every_key() {
        let (container, _temp_dir) = create_test_container();
        container
            .write(|batch| {
                batch.put("/A", b"1")?;
                batch.put("/B/C", b"2")
            })
            .unwrap();
        container
            .write(|batch| {
                batch.clear()?;
                batch.put("/D", b"3")
            })
            .unwrap();
        assert!(!container.contains("/A").unwrap());
        assert!(!container.contains("/B/C").unwrap());
        assert!(container.contains("/D").unwrap());
    }

    #[test]
    fn test_open_missing_path_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent");
        let err = Container::open(&path, 10).unwrap_err();
        assert!(matches!(err, ContainerError::Missing(_)));
        assert!(!path.exists());
        assert!(matches!(
            KeaError::from(err),
            KeaError::Image(ImageError::NotFound { .. })
        ));
    }
}
