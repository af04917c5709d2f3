//! Durable key-value storage for the session record.
//!
//! Vigil persists two things between runs: the encoded [`Session`] under
//! the session key and the last-activity timestamp under the activity key.
//! Where they live is the application's choice, expressed through the
//! [`PersistedStore`] trait. Two implementations ship here:
//!
//! - [`MemoryStore`] for tests and processes that don't survive restarts.
//! - [`FileStore`], one JSON file per key in a directory.
//!
//! [`Session`]: vigil_protocol::Session

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::SessionError;

/// Async key-value storage for persisted session data.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → one store is shared by the coordinator, the
///   scheduler, and the orchestrator for the whole life of the app.
/// - Futures are `Send` → calls happen inside spawned tasks.
///
/// Every failure is reported as [`SessionError::Storage`]; callers decide
/// whether it matters (a failed activity write doesn't, a failed session
/// write after refresh does).
pub trait PersistedStore: Send + Sync + 'static {
    /// Reads the value stored under `key`. `Ok(None)` if nothing is.
    fn load(&self, key: &str)
    -> impl Future<Output = Result<Option<Vec<u8>>, SessionError>> + Send;

    /// Writes `value` under `key`, replacing what was there.
    fn save(&self, key: &str, value: Vec<u8>)
    -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Deletes `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Deletes everything this store holds.
    fn clear(&self) -> impl Future<Output = Result<(), SessionError>> + Send;
}

impl<S: PersistedStore> PersistedStore for Arc<S> {
    fn load(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, SessionError>> + Send {
        (**self).load(key)
    }

    fn save(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send {
        (**self).save(key, value)
    }

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), SessionError>> + Send {
        (**self).remove(key)
    }

    fn clear(&self) -> impl Future<Output = Result<(), SessionError>> + Send {
        (**self).clear()
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read, for assertions.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries().get(key).cloned()
    }

    /// Synchronous write, for seeding.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistedStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), SessionError> {
        self.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.entries().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

const FILE_EXTENSION: &str = "json";

/// Stores each key as `<dir>/<key>.json`.
///
/// Key characters outside `[A-Za-z0-9._-]` are replaced with `_`, so
/// `"vigil.session"` lands in `vigil.session.json`. [`clear`] removes only
/// `.json` files in the directory; anything else there is left alone.
///
/// [`clear`]: PersistedStore::clear
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Uses `dir`, which is created on the first write if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.{FILE_EXTENSION}"))
    }
}

fn storage_error(action: &str, path: &Path, err: io::Error) -> SessionError {
    SessionError::Storage(format!("{action} {}: {err}", path.display()))
}

impl PersistedStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("reading", &path, e)),
        }
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("creating", &self.dir, e))?;

        // Write-then-rename so a crash never leaves a half-written record.
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| storage_error("writing", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("renaming", &path, e))?;
        debug!(path = %path.display(), bytes = value.len(), "stored");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SessionError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("removing", &path, e)),
        }
    }

    async fn clear(&self) -> Result<(), SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(storage_error("listing", &self.dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("listing", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == FILE_EXTENSION) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(storage_error("removing", &path, e)),
                }
            }
        }
        Ok(())
    }
}
