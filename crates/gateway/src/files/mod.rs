//! File operations inside the secure root.
//!
//! This module provides:
//! - Directory listing that never follows symlinks
//! - Chunked streaming of files granted by the access gate
//! - Bounded recursive deletion
//!
//! # Security
//!
//! Every path is resolved through `access::path` before use, so traversal,
//! null bytes and symlinked segments are rejected before touching the disk.

pub mod browser;
pub mod remove;
pub mod stream;

pub use browser::{BrowserError, DirectoryBrowser, DirectoryEntry, EntryType};
pub use remove::{remove_tree, RemoveError, RemoveLimits, RemoveSummary};
pub use stream::{FileInfo, FileStream, FileStreamer, StreamError, DEFAULT_CHUNK_SIZE};
