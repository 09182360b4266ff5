//! Lifecycle of the secure root directory.
//!
//! Exactly one root is active at a time. It is created lazily under a base
//! directory with a random name and can be rotated, which retires the old
//! identifier for good. Rotation does not move existing files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::path::{CanonicalPath, PathError};
use crate::store::{ConfigStore, ConfigStoreExt, StoreError};

/// Store key for the active root record.
pub const CURRENT_ROOT_KEY: &str = "root.current";

/// Store key for the list of retired root identifiers.
pub const RETIRED_ROOTS_KEY: &str = "root.retired";

/// Errors raised while managing the secure root.
#[derive(Debug, Error)]
pub enum RootError {
    /// The root directory could not be created.
    #[error("failed to create secure root {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The root directory exists but cannot be used.
    #[error("secure root is unusable: {0}")]
    Path(#[from] PathError),

    /// Root state could not be read or written.
    #[error("root storage error: {0}")]
    Store(#[from] StoreError),
}

/// The active secure root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureRoot {
    /// Random identifier, also the directory name.
    pub id: String,
    /// Canonical directory.
    pub path: CanonicalPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootRecord {
    id: String,
    path: PathBuf,
}

/// Creates, reports and rotates the secure root.
pub struct SecureRootManager {
    base_dir: PathBuf,
    store: Arc<dyn ConfigStore>,
    lock: Mutex<()>,
}

impl SecureRootManager {
    /// Create a manager placing roots under `base_dir`.
    pub fn new<P: AsRef<Path>>(base_dir: P, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            store,
            lock: Mutex::new(()),
        }
    }

    /// Directory under which roots are created.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The active root, created on first use.
    ///
    /// A recorded root whose directory disappeared is recreated in place.
    pub fn current(&self) -> Result<SecureRoot, RootError> {
        let _guard = self.guard()?;

        match self.store.get_as::<RootRecord>(CURRENT_ROOT_KEY)? {
            Some(record) => {
                ensure_dir(&record.path)?;
                Ok(SecureRoot {
                    id: record.id,
                    path: CanonicalPath::directory(&record.path)?,
                })
            }
            None => {
                let retired = self.retired()?;
                let root = self.create_root(&retired)?;
                tracing::info!(id = %root.id, "Created secure root");
                Ok(root)
            }
        }
    }

    /// Replace the active root with a fresh one, retiring the old id.
    pub fn rotate(&self) -> Result<SecureRoot, RootError> {
        let _guard = self.guard()?;

        let mut retired = self.retired()?;
        let previous = self.store.get_as::<RootRecord>(CURRENT_ROOT_KEY)?;
        if let Some(previous) = &previous {
            if !retired.contains(&previous.id) {
                retired.push(previous.id.clone());
            }
        }

        let root = self.create_root(&retired)?;
        self.store.set_as(RETIRED_ROOTS_KEY, &retired)?;

        tracing::info!(
            id = %root.id,
            retired = ?previous.map(|p| p.id),
            "Rotated secure root"
        );
        Ok(root)
    }

    /// Identifiers of every retired root, oldest first.
    pub fn retired(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .get_as::<Vec<String>>(RETIRED_ROOTS_KEY)?
            .unwrap_or_default())
    }

    fn create_root(&self, retired: &[String]) -> Result<SecureRoot, RootError> {
        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !retired.contains(&candidate) && !self.base_dir.join(&candidate).exists() {
                break candidate;
            }
        };

        let path = self.base_dir.join(&id);
        ensure_dir(&path)?;
        self.store.set_as(
            CURRENT_ROOT_KEY,
            &RootRecord {
                id: id.clone(),
                path: path.clone(),
            },
        )?;

        Ok(SecureRoot {
            id,
            path: CanonicalPath::directory(&path)?,
        })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::LockPoisoned {
            context: "secure root".to_string(),
        })
    }
}

fn ensure_dir(path: &Path) -> Result<(), RootError> {
    if path.is_dir() {
        return Ok(());
    }

    let create_err = |source: std::io::Error| RootError::Create {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).map_err(create_err)?;

    // Owner only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(create_err)?;
    }

    Ok(())
}
