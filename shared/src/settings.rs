//! Process-wide key/value settings.
//!
//! Values are JSON and stored in ~/.farfield/settings.json by default.
//! Clones share one map, and every write is flushed to disk before it
//! returns.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HOME not set")]
    NoHome,
}

type Map = BTreeMap<String, serde_json::Value>;

#[derive(Debug)]
struct Inner {
    path: Option<PathBuf>,
    values: Map,
}

/// Shared settings handle.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<Mutex<Inner>>,
}

impl SettingsStore {
    /// Open the store at the default location (~/.farfield/settings.json).
    pub fn new() -> Result<Self, SettingsError> {
        let home = std::env::var("HOME").map_err(|_| SettingsError::NoHome)?;
        Self::with_path(PathBuf::from(home).join(".farfield").join("settings.json"))
    }

    /// Open the store backed by `path`, loading it if it exists.
    ///
    /// An unreadable file is logged and replaced by an empty map so a
    /// corrupt settings file never blocks startup.
    pub fn with_path(path: PathBuf) -> Result<Self, SettingsError> {
        let values = if path.exists() {
            match load_map(&path) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring unreadable settings {}: {e}", path.display());
                    Map::new()
                }
            }
        } else {
            Map::new()
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                path: Some(path),
                values,
            })),
        })
    }

    /// Store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: None,
                values: Map::new(),
            })),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read and decode a value. Missing or mistyped keys return `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().values.get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)
    }

    /// Write a value and persist the store.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), SettingsError> {
        let value = serde_json::to_value(value)?;
        let mut inner = self.lock();
        inner.values.insert(key.to_string(), value);
        persist(&inner)
    }

    pub fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut inner = self.lock();
        if inner.values.remove(key).is_some() {
            persist(&inner)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().values.keys().cloned().collect()
    }
}

fn load_map(path: &Path) -> Result<Map, SettingsError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn persist(inner: &Inner) -> Result<(), SettingsError> {
    let Some(path) = &inner.path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &inner.values)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::with_path(path.clone()).unwrap();
        store.set("turntable_phi", 12.5).unwrap();
        store.set("label", "lab A").unwrap();

        let reopened = SettingsStore::with_path(path).unwrap();
        assert_eq!(reopened.get_f64("turntable_phi"), Some(12.5));
        assert_eq!(reopened.get::<String>("label").as_deref(), Some("lab A"));
    }

    #[test]
    fn test_clones_share_values() {
        let store = SettingsStore::in_memory();
        let other = store.clone();
        store.set("x", 1.0).unwrap();
        assert_eq!(other.get_f64("x"), Some(1.0));

        other.remove("x").unwrap();
        assert_eq!(store.get_f64("x"), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let store = SettingsStore::with_path(path).unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_mistyped_value_reads_none() {
        let store = SettingsStore::in_memory();
        store.set("name", "abc").unwrap();
        assert_eq!(store.get_f64("name"), None);
    }
}
