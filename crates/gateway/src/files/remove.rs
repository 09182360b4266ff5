//! Bounded deletion inside the secure root.
//!
//! The tree is scanned completely before anything is removed. The scan fails
//! on the first symlink, on excessive depth or on too many entries, in which
//! case nothing is deleted.

use std::fs;
use std::path::PathBuf;

use access::path::{self, CanonicalPath, NormalizedPath, PathError};
use thiserror::Error;

/// Errors that can occur during deletion.
#[derive(Debug, Error)]
pub enum RemoveError {
    /// The path failed resolution against the root.
    #[error("path rejected: {0}")]
    Path(#[from] PathError),

    /// The secure root itself cannot be removed.
    #[error("refusing to remove the secure root")]
    RootRefused,

    /// The tree nests deeper than allowed.
    #[error("directory tree deeper than {0} levels")]
    DepthExceeded(usize),

    /// The tree holds more entries than allowed.
    #[error("directory tree has more than {0} entries")]
    TooManyEntries(usize),

    /// A symlink was found inside the tree.
    #[error("symlink inside tree: {0}")]
    SymlinkDetected(NormalizedPath),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Limits applied to one deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveLimits {
    pub max_depth: usize,
    pub max_entries: usize,
}

impl Default for RemoveLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_entries: 10_000,
        }
    }
}

/// What a deletion removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    pub files: usize,
    pub directories: usize,
}

/// Remove the file or directory tree at `relative` below `root`.
pub fn remove_tree(
    root: &CanonicalPath,
    relative: &str,
    limits: RemoveLimits,
) -> Result<RemoveSummary, RemoveError> {
    let target = path::resolve(root, relative)?;
    if target == *root {
        return Err(RemoveError::RootRefused);
    }
    let target_relative = path::relative_to(root, &target)?;

    let metadata = fs::symlink_metadata(target.as_path())?;
    if !metadata.is_dir() {
        fs::remove_file(target.as_path())?;
        tracing::info!(path = %target_relative, "Removed file");
        return Ok(RemoveSummary {
            files: 1,
            directories: 0,
        });
    }

    let mut files = Vec::new();
    let mut directories = Vec::new();
    scan(
        target.into_path_buf(),
        target_relative.clone(),
        0,
        &limits,
        &mut files,
        &mut directories,
    )?;

    for file in &files {
        fs::remove_file(file)?;
    }
    // Children were pushed after their parents.
    for dir in directories.iter().rev() {
        fs::remove_dir(dir)?;
    }

    let summary = RemoveSummary {
        files: files.len(),
        directories: directories.len(),
    };
    tracing::info!(
        path = %target_relative,
        files = summary.files,
        directories = summary.directories,
        "Removed directory tree"
    );
    Ok(summary)
}

fn scan(
    dir: PathBuf,
    relative: NormalizedPath,
    depth: usize,
    limits: &RemoveLimits,
    files: &mut Vec<PathBuf>,
    directories: &mut Vec<PathBuf>,
) -> Result<(), RemoveError> {
    if depth > limits.max_depth {
        return Err(RemoveError::DepthExceeded(limits.max_depth));
    }

    let mut subdirs = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let file_type = entry.file_type()?;

        if files.len() + directories.len() + subdirs.len() >= limits.max_entries {
            return Err(RemoveError::TooManyEntries(limits.max_entries));
        }

        if file_type.is_symlink() {
            return Err(RemoveError::SymlinkDetected(relative.join(&name)));
        } else if file_type.is_dir() {
            subdirs.push((entry.path(), relative.join(&name)));
        } else {
            files.push(entry.path());
        }
    }

    directories.push(dir);
    for (path, child) in subdirs {
        scan(path, child, depth + 1, limits, files, directories)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CanonicalPath) {
        let temp_dir = TempDir::new().unwrap();
        let root = CanonicalPath::directory(temp_dir.path()).unwrap();
        fs::create_dir_all(temp_dir.path().join("tree/a/b")).unwrap();
        fs::write(temp_dir.path().join("tree/top.txt"), "1").unwrap();
        fs::write(temp_dir.path().join("tree/a/mid.txt"), "2").unwrap();
        fs::write(temp_dir.path().join("tree/a/b/deep.txt"), "3").unwrap();
        fs::write(temp_dir.path().join("single.txt"), "4").unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_remove_single_file() {
        let (temp_dir, root) = setup();
        let summary = remove_tree(&root, "single.txt", RemoveLimits::default()).unwrap();
        assert_eq!(summary, RemoveSummary { files: 1, directories: 0 });
        assert!(!temp_dir.path().join("single.txt").exists());
    }

    #[test]
    fn test_remove_tree() {
        let (temp_dir, root) = setup();
        let summary = remove_tree(&root, "tree", RemoveLimits::default()).unwrap();
        assert_eq!(summary, RemoveSummary { files: 3, directories: 3 });
        assert!(!temp_dir.path().join("tree").exists());
        assert!(temp_dir.path().join("single.txt").exists());
    }

    #[test]
    fn test_refuses_root() {
        let (_temp_dir, root) = setup();
        assert!(matches!(
            remove_tree(&root, "", RemoveLimits::default()),
            Err(RemoveError::RootRefused)
        ));
        assert!(matches!(
            remove_tree(&root, "/", RemoveLimits::default()),
            Err(RemoveError::RootRefused)
        ));
    }

    #[test]
    fn test_depth_limit_deletes_nothing() {
        let (temp_dir, root) = setup();
        let limits = RemoveLimits {
            max_depth: 1,
            max_entries: 100,
        };
        assert!(matches!(
            remove_tree(&root, "tree", limits),
            Err(RemoveError::DepthExceeded(1))
        ));
        assert!(temp_dir.path().join("tree/a/b/deep.txt").exists());
    }

    #[test]
    fn test_entry_limit_deletes_nothing() {
        let (temp_dir, root) = setup();
        let limits = RemoveLimits {
            max_depth: 32,
            max_entries: 3,
        };
        assert!(matches!(
            remove_tree(&root, "tree", limits),
            Err(RemoveError::TooManyEntries(3))
        ));
        assert!(temp_dir.path().join("tree/top.txt").exists());
    }

    #[test]
    fn test_symlink_inside_tree_refused() {
        let (temp_dir, root) = setup();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("keep.txt"), "keep").unwrap();
        symlink(outside.path(), temp_dir.path().join("tree/a/link")).unwrap();

        let result = remove_tree(&root, "tree", RemoveLimits::default());
        assert!(matches!(result, Err(RemoveError::SymlinkDetected(_))));
        assert!(outside.path().join("keep.txt").exists());
        assert!(temp_dir.path().join("tree/top.txt").exists());
    }

    #[test]
    fn test_traversal_refused() {
        let (_temp_dir, root) = setup();
        assert!(matches!(
            remove_tree(&root, "../etc", RemoveLimits::default()),
            Err(RemoveError::Path(PathError::Escape))
        ));
    }
}
