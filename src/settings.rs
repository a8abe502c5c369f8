//! Small persistent key-value store for client identity and flags.
//!
//! Values are kept as JSON in memory and, when opened on a path, written to
//! `settings.json` with the same temp-then-rename replace as the queue files.
//! Failures are logged; a settings problem never stops the client.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::store::write_atomic;

/// File name used under the storage root.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Default)]
pub struct Settings {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl Settings {
    /// Settings that live only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Settings backed by `{root}/settings.json`; an unreadable file starts
    /// empty.
    pub fn open(root: &Path) -> Self {
        let path = root.join(SETTINGS_FILE);
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
                Map::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read settings file");
                Map::new()
            }
        };

        debug!(path = %path.display(), keys = values.len(), "Settings loaded");
        Self {
            path: Some(path),
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value stored under `key`, if present and of the expected shape.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let value = values.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.update(|values| {
                values.insert(key.to_string(), value);
            }),
            Err(e) => warn!(key = key, error = %e, "Failed to encode setting"),
        }
    }

    pub fn remove(&self, key: &str) {
        self.update(|values| {
            values.remove(key);
        });
    }

    fn update(&self, change: impl FnOnce(&mut Map<String, Value>)) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut values);

        let Some(path) = &self.path else {
            return;
        };
        // Written under the lock so concurrent saves land in order
        let result = serde_json::to_vec_pretty(&*values)
            .map_err(Into::into)
            .and_then(|bytes| write_atomic(path, &bytes));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to write settings");
        }
    }
}
