//! Chunked streaming of granted files.
//!
//! A [`FileStreamer`] only accepts a [`FileGrant`] produced by the access
//! gate. After opening, the file handle is compared with the path's own
//! metadata so a file replaced by a symlink in the meantime is refused.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use access::FileGrant;
use thiserror::Error;

/// Default chunk size for streaming (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Errors that can occur while streaming a file.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The granted path is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    /// The file exceeds the configured size limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// Offset beyond end of file.
    #[error("invalid offset {offset} for file of size {file_size}")]
    InvalidOffset { offset: u64, file_size: u64 },

    /// The file changed between authorization and open.
    #[error("file changed while opening: {0}")]
    Changed(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Response metadata for a streamed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_name: String,
    pub size: u64,
    pub mime: String,
}

impl FileInfo {
    /// `Content-Disposition` value forcing a download under the file's name.
    pub fn content_disposition(&self) -> String {
        let name: String = self
            .file_name
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| if c == '"' || c == '\\' { '_' } else { c })
            .collect();
        format!("attachment; filename=\"{name}\"")
    }
}

/// Reads granted files in bounded chunks.
#[derive(Debug, Clone)]
pub struct FileStreamer {
    chunk_size: usize,
    max_file_size: u64,
}

impl FileStreamer {
    /// Create a streamer.
    pub fn new(chunk_size: usize, max_file_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_file_size,
        }
    }

    /// Open the granted file for sequential streaming.
    pub fn open(&self, grant: &FileGrant) -> Result<FileStream, StreamError> {
        let (file, info) = self.open_checked(grant)?;
        Ok(FileStream {
            file,
            remaining: info.size,
            info,
            chunk_size: self.chunk_size,
        })
    }

    /// Read one chunk starting at `offset`.
    ///
    /// Returns the chunk data, the file size and whether this is the last chunk.
    pub fn download_chunk(
        &self,
        grant: &FileGrant,
        offset: u64,
    ) -> Result<(Vec<u8>, u64, bool), StreamError> {
        let (mut file, info) = self.open_checked(grant)?;
        let file_size = info.size;

        if offset > file_size {
            return Err(StreamError::InvalidOffset { offset, file_size });
        }

        file.seek(SeekFrom::Start(offset))?;
        let chunk_size = (self.chunk_size as u64).min(file_size - offset) as usize;
        let mut buffer = vec![0u8; chunk_size];
        file.read_exact(&mut buffer)?;

        let is_last = offset + chunk_size as u64 >= file_size;
        Ok((buffer, file_size, is_last))
    }

    /// Stream the whole granted file into `writer`.
    ///
    /// Returns the file's metadata and the number of bytes written.
    pub fn copy_to<W: Write>(
        &self,
        grant: &FileGrant,
        writer: &mut W,
    ) -> Result<(FileInfo, u64), StreamError> {
        let mut stream = self.open(grant)?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next_chunk()? {
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        writer.flush()?;

        tracing::debug!(path = %grant.relative_path, bytes = written, "Streamed file");
        Ok((stream.info, written))
    }

    fn open_checked(&self, grant: &FileGrant) -> Result<(File, FileInfo), StreamError> {
        let path = grant.path.as_path();
        let file = File::open(path)?;
        let opened = file.metadata()?;
        let on_disk = fs::symlink_metadata(path)?;

        if on_disk.file_type().is_symlink() || !same_file(&opened, &on_disk) {
            return Err(StreamError::Changed(path.to_path_buf()));
        }
        if !opened.is_file() {
            return Err(StreamError::NotAFile(path.to_path_buf()));
        }
        if opened.len() > self.max_file_size {
            return Err(StreamError::FileTooLarge {
                size: opened.len(),
                limit: self.max_file_size,
            });
        }

        let file_name = grant
            .relative_path
            .file_name()
            .unwrap_or("download")
            .to_string();
        let mime = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok((
            file,
            FileInfo {
                file_name,
                size: opened.len(),
                mime,
            },
        ))
    }
}

impl Default for FileStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, u64::MAX)
    }
}

/// An open file being streamed chunk by chunk.
pub struct FileStream {
    file: File,
    info: FileInfo,
    chunk_size: usize,
    remaining: u64,
}

impl FileStream {
    /// Metadata for response headers.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Next chunk, or `None` once the size reported at open has been read.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let len = (self.chunk_size as u64).min(self.remaining) as usize;
        let mut buffer = vec![0u8; len];
        let read = self.file.read(&mut buffer)?;
        if read == 0 {
            // Truncated since open.
            self.remaining = 0;
            return Ok(None);
        }

        buffer.truncate(read);
        self.remaining -= read as u64;
        Ok(Some(buffer))
    }
}

/// Whether an open handle and a path's metadata describe the same file.
#[cfg(unix)]
fn same_file(opened: &fs::Metadata, on_disk: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    opened.dev() == on_disk.dev() && opened.ino() == on_disk.ino()
}

#[cfg(not(unix))]
fn same_file(opened: &fs::Metadata, on_disk: &fs::Metadata) -> bool {
    opened.len() == on_disk.len() && opened.modified().ok() == on_disk.modified().ok()
}
