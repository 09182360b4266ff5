//! Injected key-value configuration storage.
//!
//! Every stateful component takes an `Arc<dyn ConfigStore>` instead of reaching
//! into process-wide state. Two implementations are provided: an in-memory
//! store for tests and embedding, and a JSON file store that persists with
//! atomic writes.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored value could not be encoded or decoded.
    #[error("store value for '{key}' is invalid: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backing file is not a valid store document.
    #[error("store file {0} is corrupt")]
    Corrupt(PathBuf),

    /// Lock poisoned during operation.
    #[error("lock poisoned: {context}")]
    LockPoisoned { context: String },
}

/// Minimal get/set/delete storage used by every stateful component.
pub trait ConfigStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Deletes `key`. Returns whether a value was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Typed helpers over any [`ConfigStore`].
pub trait ConfigStoreExt: ConfigStore {
    /// Reads and deserializes the value under `key`.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Serializes and stores `value` under `key`.
    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set(key, value)
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }
}

impl<S: ConfigStore + ?Sized> ConfigStoreExt for S {}

/// Volatile store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned {
            context: "memory store read".to_string(),
        })?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned {
            context: "memory store write".to_string(),
        })?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned {
            context: "memory store delete".to_string(),
        })?;
        Ok(entries.remove(key).is_some())
    }
}

/// On-disk document layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    /// Version of the store format.
    version: u32,
    /// Stored values.
    entries: BTreeMap<String, Value>,
}

const STORE_VERSION: u32 = 1;

/// Store persisted as a single JSON document.
///
/// Every mutation rewrites the document through a temp file and rename, so a
/// crash never leaves a half-written file behind.
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading it if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(BTreeMap::new()),
        };
        store.load()?;
        Ok(store)
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the document from disk, replacing in-memory state.
    pub fn load(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            tracing::debug!("Store file not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let document: StoreDocument =
            serde_json::from_str(&contents).map_err(|_| StoreError::Corrupt(self.path.clone()))?;
        if document.version != STORE_VERSION {
            return Err(StoreError::Corrupt(self.path.clone()));
        }

        #[cfg(unix)]
        self.restrict_permissions()?;

        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned {
            context: "file store load".to_string(),
        })?;
        *entries = document.entries;

        tracing::debug!("Loaded {} store entries from {:?}", entries.len(), self.path);
        Ok(())
    }

    /// Tighten a document left readable by other users.
    #[cfg(unix)]
    fn restrict_permissions(&self) -> Result<(), StoreError> {
        use std::os::unix::fs::PermissionsExt;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mode = fs::metadata(&self.path).map_err(io_err)?.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!("Store file {:?} was readable by others, restricting", self.path);
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
            move |source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let document = StoreDocument {
            version: STORE_VERSION,
            entries: entries.clone(),
        };
        let contents =
            serde_json::to_string_pretty(&document).map_err(|source| StoreError::Serialization {
                key: "<document>".to_string(),
                source,
            })?;

        // The document carries vault key material: owner only.
        let temp_path = self.path.with_extension("json.tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp_path).map_err(io_err(&temp_path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(io_err(&temp_path))?;
        }
        file.write_all(contents.as_bytes())
            .map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;
        drop(file);
        fs::rename(&temp_path, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned {
            context: "file store read".to_string(),
        })?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned {
            context: "file store write".to_string(),
        })?;
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned {
            context: "file store delete".to_string(),
        })?;
        let existed = entries.remove(key).is_some();
        if existed {
            self.persist(&entries)?;
        }
        Ok(existed)
    }
}
