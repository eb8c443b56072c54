//! Small durable key-value state kept outside the relational store.
//!
//! Replication keeps its change tokens and zone setup flags here.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("failed to read preferences {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write preferences {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("preferences {} are not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("preference '{key}' has an unexpected shape: {source}")]
    Value {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PrefsError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Parse { .. } | Self::Value { .. } => ErrorCode::ConfigParseError,
            Self::Read { .. } | Self::Write { .. } => ErrorCode::PreferencesUnavailable,
        }
    }
}

/// Durable string-keyed preferences. Writes are visible to the next read
/// and survive a restart before the call returns.
pub trait Preferences: Send + Sync {
    /// # Errors
    ///
    /// Implementations may fail on I/O.
    fn get(&self, key: &str) -> Result<Option<String>, PrefsError>;

    /// # Errors
    ///
    /// Implementations may fail on I/O.
    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError>;

    /// # Errors
    ///
    /// Implementations may fail on I/O.
    fn remove(&self, key: &str) -> Result<(), PrefsError>;
}

/// Read `key` as JSON.
///
/// # Errors
///
/// Returns [`PrefsError::Value`] when the stored string does not decode as
/// `T`, or the backend error.
pub fn get_json<T: DeserializeOwned>(
    prefs: &dyn Preferences,
    key: &str,
) -> Result<Option<T>, PrefsError> {
    prefs
        .get(key)?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|source| PrefsError::Value {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

/// Store `value` under `key` as JSON.
///
/// # Errors
///
/// Returns [`PrefsError::Value`] if `value` fails to serialize, or the
/// backend error.
pub fn set_json<T: Serialize + ?Sized>(
    prefs: &dyn Preferences,
    key: &str,
    value: &T,
) -> Result<(), PrefsError> {
    let raw = serde_json::to_string(value).map_err(|source| PrefsError::Value {
        key: key.to_string(),
        source,
    })?;
    prefs.set(key, &raw)
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// A JSON object on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Load `path`, or start empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PrefsError::Read`] or [`PrefsError::Parse`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| PrefsError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(PrefsError::Read { path, source }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), PrefsError> {
        let write_err = |source| PrefsError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let encoded = serde_json::to_vec_pretty(values).map_err(|source| PrefsError::Value {
            key: String::new(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(&encoded).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)
    }
}

impl Preferences for FilePreferences {
    fn get(&self, key: &str) -> Result<Option<String>, PrefsError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(err) = self.persist(&values) {
            match previous {
                Some(prev) => values.insert(key.to_string(), prev),
                None => values.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = values.remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.persist(&values) {
            values.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }
}

/// Volatile preferences for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Result<Option<String>, PrefsError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
