//! Path resolution with containment proofs.
//!
//! Every path that reaches a file operation is produced by [`resolve`] (or
//! [`resolve_for_creation`]) and is therefore a canonical descendant of the
//! secure root with no symlinked segment.
//!
//! # Security
//!
//! Relative inputs are rejected outright when they contain `..`, a null byte,
//! or repeated separators. The joined path is then walked segment by segment
//! without following links before it is canonicalized, so a symlink anywhere
//! below the root is refused rather than silently resolved.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while resolving a path below the secure root.
///
/// Callers must present every variant to the outside world as "not found".
#[derive(Debug, Error)]
pub enum PathError {
    /// The relative path would resolve outside the root.
    #[error("path escapes the secure root")]
    Escape,

    /// A segment of the path is a symbolic link.
    #[error("symlink detected in path")]
    SymlinkDetected,

    /// The relative path contains a null byte.
    #[error("path contains a null byte")]
    NullByte,

    /// The relative path is syntactically invalid.
    #[error("malformed path: {0}")]
    Malformed(&'static str),

    /// A segment of the path does not exist.
    #[error("path not found")]
    NotFound,

    /// The root itself is not an absolute, canonical directory.
    #[error("invalid root directory: {0}")]
    InvalidRoot(PathBuf),

    /// IO error while inspecting the path.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An absolute path that has been canonicalized by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    /// Canonicalize `path`, which must exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, PathError> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PathError::NotFound,
            _ => PathError::Io(e),
        })?;
        Ok(Self(canonical))
    }

    /// Canonicalize `path` and require it to be a directory.
    pub fn directory<P: AsRef<Path>>(path: P) -> Result<Self, PathError> {
        let canonical = Self::new(path.as_ref())?;
        if !canonical.0.is_dir() {
            return Err(PathError::InvalidRoot(path.as_ref().to_path_buf()));
        }
        Ok(canonical)
    }

    /// Borrow as a `Path`.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Consume into a `PathBuf`.
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Whether `self` equals `ancestor` or lies below it, compared by component.
    pub fn is_within(&self, ancestor: &CanonicalPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<PathBuf> for CanonicalPath {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        if !path.is_absolute() {
            return Err(PathError::InvalidRoot(path));
        }
        Ok(Self(path))
    }
}

impl From<CanonicalPath> for PathBuf {
    fn from(path: CanonicalPath) -> Self {
        path.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A root-relative directory or file key in forward-slash form.
///
/// Surrounding whitespace and separators are trimmed, backslashes become
/// forward slashes and empty or `.` segments are dropped, so
/// `"/reports//q1/"`, `"reports\\q1"` and `"./reports/q1"` all normalize to
/// `"reports/q1"`. Whitespace inside the path is kept, so `"docs /f.txt"`
/// and `"docs/f.txt"` are different keys. The empty string denotes the root
/// itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NormalizedPath(String);

impl NormalizedPath {
    /// Normalize an arbitrary representation.
    pub fn new(raw: &str) -> Self {
        let joined = raw
            .trim()
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    /// The root of the secure tree.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Whether this is the root key.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the normalized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<NormalizedPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, _)) => Some(Self(parent.to_string())),
            None => Some(Self::root()),
        }
    }

    /// The final segment, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// This path followed by each ancestor up to and including the root.
    pub fn ancestors(&self) -> Vec<NormalizedPath> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(dir) = current {
            current = dir.parent();
            chain.push(dir);
        }
        chain
    }

    /// Append a child segment (normalized).
    pub fn join(&self, child: &str) -> NormalizedPath {
        if self.is_root() {
            Self::new(child)
        } else {
            Self::new(&format!("{}/{}", self.0, child))
        }
    }
}

impl From<String> for NormalizedPath {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for NormalizedPath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<NormalizedPath> for String {
    fn from(path: NormalizedPath) -> Self {
        path.0
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Validate a raw relative input and split it into clean segments.
fn checked_segments(relative: &str) -> Result<Vec<&str>, PathError> {
    if relative.contains('\0') {
        return Err(PathError::NullByte);
    }
    if relative.contains("..") {
        return Err(PathError::Escape);
    }

    let trimmed = relative
        .trim()
        .trim_matches(|c: char| c == '/' || c == '\\');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        if segment.is_empty() {
            return Err(PathError::Malformed("repeated separator"));
        }
        if segment == "." {
            continue;
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Resolve `relative` against `root` and prove containment.
///
/// Returns `root` unchanged for an empty relative path. Never creates
/// anything on disk.
pub fn resolve(root: &CanonicalPath, relative: &str) -> Result<CanonicalPath, PathError> {
    let segments = checked_segments(relative)?;
    if segments.is_empty() {
        return Ok(root.clone());
    }

    // Walk the joined path without following links.
    let mut cursor = root.as_path().to_path_buf();
    for segment in &segments {
        cursor.push(segment);
        let metadata = fs::symlink_metadata(&cursor).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PathError::NotFound,
            _ => PathError::Io(e),
        })?;
        if metadata.file_type().is_symlink() {
            tracing::warn!("Refusing path with symlinked segment");
            return Err(PathError::SymlinkDetected);
        }
    }

    let canonical = CanonicalPath::new(&cursor)?;
    if !canonical.is_within(root) {
        tracing::warn!("Resolved path escaped the secure root");
        return Err(PathError::Escape);
    }

    Ok(canonical)
}

/// Resolve a path that does not exist yet.
///
/// The parent must resolve under [`resolve`]; the leaf name must be a single
/// plain segment. The returned path is not canonical in the filesystem sense
/// because nothing exists there yet, but its parent is.
pub fn resolve_for_creation(root: &CanonicalPath, relative: &str) -> Result<PathBuf, PathError> {
    let segments = checked_segments(relative)?;
    let (leaf, parents) = segments
        .split_last()
        .ok_or(PathError::Malformed("path has no file name"))?;

    let leaf_path = Path::new(leaf);
    if leaf_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
        || leaf_path.components().count() != 1
    {
        return Err(PathError::Malformed("invalid file name"));
    }

    let parent = resolve(root, &parents.join("/"))?;
    let target = parent.as_path().join(leaf);

    if let Ok(metadata) = fs::symlink_metadata(&target) {
        if metadata.file_type().is_symlink() {
            return Err(PathError::SymlinkDetected);
        }
    }

    Ok(target)
}

/// Express a canonical path as a root-relative key.
pub fn relative_to(root: &CanonicalPath, path: &CanonicalPath) -> Result<NormalizedPath, PathError> {
    let stripped = path
        .as_path()
        .strip_prefix(root.as_path())
        .map_err(|_| PathError::Escape)?;
    let raw = stripped
        .to_str()
        .ok_or(PathError::Malformed("name is not valid UTF-8"))?;

    // The key must resolve back to this exact path.
    let key = NormalizedPath::new(raw);
    if key.as_str() != raw {
        return Err(PathError::Malformed("name cannot be expressed as a key"));
    }
    Ok(key)
}
