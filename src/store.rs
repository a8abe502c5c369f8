//! Crash-safe persistence of pending stream items.
//!
//! Each stream owns one file, `{root}/{stream}.json`, holding a JSON array
//! of its unsent items. Writes go to a sibling `.tmp` file that is renamed
//! over the live one, so readers never see a partial file. An empty list
//! removes the file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PersistenceError;

/// Best-effort, stateless queue file store.
///
/// A store without a root persists nothing and always loads empty lists.
#[derive(Debug, Clone, Default)]
pub struct PersistenceStore {
    root: Option<PathBuf>,
}

impl PersistenceStore {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// A store that keeps nothing on disk.
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Location of the queue file for `stream`, if persistence is enabled.
    pub fn path_for(&self, stream: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(format!("{stream}.json")))
    }

    /// Save `items` for `stream`, logging and swallowing any failure.
    pub fn save<T: Serialize>(&self, stream: &str, items: &[T]) {
        if let Err(e) = self.try_save(stream, items) {
            warn!(stream = stream, error = %e, "Failed to persist pending items");
        }
    }

    /// Save `items` for `stream`; an empty slice deletes the file.
    pub fn try_save<T: Serialize>(&self, stream: &str, items: &[T]) -> Result<(), PersistenceError> {
        let Some(path) = self.path_for(stream) else {
            return Ok(());
        };

        if items.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(stream = stream, "Removed empty queue file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(&path, e)),
            };
        }

        let bytes = serde_json::to_vec(items)?;
        write_atomic(&path, &bytes)?;
        debug!(stream = stream, count = items.len(), "Persisted pending items");
        Ok(())
    }

    /// Load the items previously saved for `stream`.
    ///
    /// A missing, unreadable, or corrupt file yields an empty list.
    pub fn load<T: DeserializeOwned>(&self, stream: &str) -> Vec<T> {
        match self.try_load(stream) {
            Ok(items) => items,
            Err(e) => {
                warn!(stream = stream, error = %e, "Discarding unreadable queue file");
                Vec::new()
            }
        }
    }

    pub fn try_load<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<T>, PersistenceError> {
        let Some(path) = self.path_for(stream) else {
            return Ok(Vec::new());
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path, e)),
        };

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Write `bytes` to `path` through a `.tmp` sibling and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_error(path, e));
    }

    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}
