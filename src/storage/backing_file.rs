//! The single random-access file that every unit pages into
//!
//! The cache never interprets bytes itself: units serialize their own payload
//! into whatever range the allocator gave them. This type only provides
//! positional reads and writes, so any number of threads can do I/O on
//! disjoint ranges at the same time without sharing a file cursor.

use crate::error::CacheError;
use crate::types::FileRange;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Backing file addressed by `(offset, length)`
#[derive(Debug)]
pub struct BackingFile {
    path: PathBuf,
    file: File,
    /// Highest byte written so far (physical length)
    len: AtomicU64,
}

impl BackingFile {
    /// Create a new, empty backing file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        info!(path = %path.display(), "Created backing file");
        Ok(Self {
            path,
            file,
            len: AtomicU64::new(0),
        })
    }

    /// Open an existing backing file without truncating it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        info!(path = %path.display(), len, "Opened backing file");
        Ok(Self {
            path,
            file,
            len: AtomicU64::new(len),
        })
    }

    /// Path of the file on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical length of the file in bytes
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if nothing was ever written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `data` starting at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), CacheError> {
        write_all_at(&self.file, data, offset)?;
        let end = offset + data.len() as u64;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Fill `buf` from `offset`
    ///
    /// Reading past the physical end of file is reported as `CorruptedData`
    /// since the allocator never hands out ranges that were not written.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        match read_exact_at(&self.file, buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(CacheError::CorruptedData(format!(
                    "short read at offset {} ({} bytes requested, file is {} bytes)",
                    offset,
                    buf.len(),
                    self.len()
                )))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Write a record into an owned range
    ///
    /// Fails with a precondition error if `data` does not fit.
    pub fn write_range(&self, range: FileRange, data: &[u8]) -> Result<(), CacheError> {
        if data.len() as u64 > range.length {
            return Err(CacheError::Precondition(format!(
                "{} bytes do not fit in range {}",
                data.len(),
                range
            )));
        }
        self.write_at(range.offset, data)
    }

    /// Read `len` bytes from the start of an owned range
    pub fn read_range(&self, range: FileRange, len: u64) -> Result<Vec<u8>, CacheError> {
        if len > range.length {
            return Err(CacheError::Precondition(format!(
                "cannot read {} bytes from range {}",
                len, range
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_at(range.offset, &mut buf)?;
        Ok(buf)
    }

    /// Flush OS buffers to stable storage
    pub fn sync(&self) -> Result<(), CacheError> {
        self.file.sync_data()?;
        debug!(path = %self.path.display(), "Synced backing file");
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
