//! Shared file handles with positional I/O, advisory locking and memory
//! mapping.
//!
//! All positional reads and writes go through
//! [`std::os::unix::fs::FileExt::read_exact_at`] and
//! [`std::os::unix::fs::FileExt::write_all_at`], which retry on
//! `ErrorKind::Interrupted` and either fully satisfy the request or fail.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt as _, OpenOptionsExt as _};
use std::path::Path;

use fs2::FileExt as _;
use memmap2::{Mmap, MmapMut};

/// A handle on one file of a log directory.
///
/// Handles may be shared across threads. Locking the same handle from two
/// threads concurrently is not supported: the lock is per open file
/// description, so the second acquisition silently succeeds instead of
/// blocking. Callers either coordinate through an external mutex or use
/// distinct handles.
#[derive(Debug)]
pub(crate) struct LogFile {
    file: File,
    locking: bool,
}

impl LogFile {
    /// Open an existing file in read/write mode.
    pub fn open(path: &Path, mode: u32, locking: bool) -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .mode(mode)
            .open(path)
            .map(|file| Self { file, locking })
    }

    /// Open a file in read/write mode, creating it if absent.
    pub fn create(path: &Path, mode: u32, locking: bool) -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)
            .map(|file| Self { file, locking })
    }

    /// Create a file that must not yet exist.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if it does.
    pub fn create_new(path: &Path, mode: u32, locking: bool) -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
            .map(|file| Self { file, locking })
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Write all of `buf` at `offset`.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Write a sequence of buffers contiguously starting at `offset`.
    ///
    /// Callers hold the file lock across the call, so the buffers need not
    /// land atomically.
    pub fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> io::Result<()> {
        let mut offset = offset;
        for buf in bufs {
            self.file.write_all_at(buf, offset)?;
            offset += buf.len() as u64;
        }
        Ok(())
    }

    /// Acquire the whole-file advisory write lock, blocking until it is
    /// available. The lock is released when the returned guard drops.
    ///
    /// When locking is disabled for this log (single-process mode), the
    /// guard is a no-op.
    pub fn lock(&self) -> io::Result<FileLock> {
        if !self.locking {
            return Ok(FileLock { file: None });
        }
        // The duplicated handle shares the open file description, so
        // unlocking it on drop releases the lock taken here.
        let file = self.file.try_clone()?;
        file.lock_exclusive()?;
        Ok(FileLock { file: Some(file) })
    }

    pub fn size(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// Flush file data to stable storage (`fdatasync`).
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Map the whole file read-only.
    ///
    /// The file must not be empty; callers branch on [`Self::size`] first.
    pub fn map_read(&self) -> io::Result<Mmap> {
        unsafe { Mmap::map(&self.file) }
    }

    /// Map the whole file read/write.
    pub fn map_rdwr(&self) -> io::Result<MmapMut> {
        unsafe { MmapMut::map_mut(&self.file) }
    }
}

/// Guard for a held file lock; unlocks on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: Option<File>,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.unlock() {
                log::warn!("failed to release file lock: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pwritev_is_contiguous() {
        let tmp = tempdir().unwrap();
        let f = LogFile::create(&tmp.path().join("f"), 0o640, true).unwrap();

        f.pwritev(&[b"abc", b"", b"defg"], 0).unwrap();
        assert_eq!(f.size().unwrap(), 7);

        let mut buf = [0; 7];
        f.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abcdefg");
    }

    #[test]
    fn lock_guard_releases() {
        let tmp = tempdir().unwrap();
        let f = LogFile::create(&tmp.path().join("f"), 0o640, true).unwrap();

        let guard = f.lock().unwrap();
        drop(guard);
        // Would deadlock if the previous guard leaked the lock on a
        // separate file description.
        let other = LogFile::open(&tmp.path().join("f"), 0o640, true).unwrap();
        drop(other.lock().unwrap());
    }
}
