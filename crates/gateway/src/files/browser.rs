//! Directory listing inside the secure root.
//!
//! Paths are resolved through the access core before anything is read, and
//! entries are described from `symlink_metadata`, so a symlink is reported as
//! a symlink and never followed.

use std::fs;
use std::time::SystemTime;

use access::path::{self, CanonicalPath, NormalizedPath, PathError};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during directory browsing.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The path failed resolution against the root.
    #[error("path rejected: {0}")]
    Path(#[from] PathError),

    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(NormalizedPath),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Directory,
    File,
    Symlink,
    Other,
}

/// A directory entry with metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Root-relative path.
    pub relative_path: NormalizedPath,
    /// Entry type.
    pub entry_type: EntryType,
    /// Size in bytes (0 for anything but regular files).
    pub size: u64,
    /// Unix permissions mode.
    pub mode: u32,
    /// Last modified timestamp.
    pub modified: SystemTime,
    /// Guessed MIME type, for regular files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl DirectoryEntry {
    fn from_metadata(name: String, relative_path: NormalizedPath, metadata: &fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let entry_type = if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::File
        } else {
            EntryType::Other
        };

        let (size, mime) = if entry_type == EntryType::File {
            let mime = mime_guess::from_path(&name).first_or_octet_stream();
            (metadata.len(), Some(mime.essence_str().to_string()))
        } else {
            (0, None)
        };

        Self {
            name,
            relative_path,
            entry_type,
            size,
            mode: permission_mode(metadata),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            mime,
        }
    }
}

#[cfg(unix)]
fn permission_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn permission_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Lists directories below one secure root.
pub struct DirectoryBrowser {
    root: CanonicalPath,
}

impl DirectoryBrowser {
    /// Create a browser for `root`.
    pub fn new(root: CanonicalPath) -> Self {
        Self { root }
    }

    /// The root being browsed.
    pub fn root(&self) -> &CanonicalPath {
        &self.root
    }

    /// List the contents of `relative`, directories first.
    ///
    /// Hidden entries (names starting with '.') are included only when
    /// `include_hidden` is set.
    pub fn list_directory(
        &self,
        relative: &str,
        include_hidden: bool,
    ) -> Result<Vec<DirectoryEntry>, BrowserError> {
        let canonical = path::resolve(&self.root, relative)?;
        let dir = path::relative_to(&self.root, &canonical)?;

        if !fs::symlink_metadata(canonical.as_path())?.is_dir() {
            return Err(BrowserError::NotADirectory(dir));
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(canonical.as_path())? {
            let Ok(entry) = entry else {
                continue; // Skip entries we can't read
            };

            let name = entry.file_name().to_string_lossy().to_string();
            if !include_hidden && name.starts_with('.') {
                continue;
            }

            // DirEntry::metadata does not traverse symlinks.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            let relative_path = dir.join(&name);
            results.push(DirectoryEntry::from_metadata(name, relative_path, &metadata));
        }

        results.sort_by(|a, b| {
            let a_is_dir = a.entry_type == EntryType::Directory;
            let b_is_dir = b.entry_type == EntryType::Directory;
            b_is_dir
                .cmp(&a_is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        tracing::debug!(dir = %dir, entries = results.len(), "Listed directory");
        Ok(results)
    }

    /// Metadata for a single path.
    pub fn get_entry(&self, relative: &str) -> Result<DirectoryEntry, BrowserError> {
        let canonical = path::resolve(&self.root, relative)?;
        let relative_path = path::relative_to(&self.root, &canonical)?;
        let metadata = fs::symlink_metadata(canonical.as_path())?;

        let name = relative_path.file_name().unwrap_or("/").to_string();
        Ok(DirectoryEntry::from_metadata(name, relative_path, &metadata))
    }
}
