//! The pre-commit buffer: a memory-mapped staging area that batches record
//! bytes before they are written to the segment.
//!
//! The file is `capacity + 4` bytes; the first four hold the current staged
//! byte count (little-endian), the rest the raw record bytes exactly as
//! they will appear in the segment. The count lives in the mapping, so a
//! crashed writer's staged bytes survive to its next incarnation.
//!
//! Staging is only coherent with a single writer process. Multiple writer
//! processes must disable the buffer.

use log::debug;
use memmap2::MmapMut;

use crate::error::{ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::repo::Repo;
use crate::Safety;

const COUNT_LEN: usize = 4;

pub(crate) struct PreCommit {
    map: MmapMut,
}

impl PreCommit {
    /// Open (creating and zero-filling if absent) and map the pre-commit
    /// file. `desired` sizes the staging area of a freshly created file;
    /// an existing file keeps its size.
    pub fn open(repo: &Repo, desired: usize, safety: Safety) -> Result<Self> {
        let file = LogFile::create(&repo.pre_commit_path(), repo.file_mode(), repo.locking())
            .map_kind(ErrorKind::CreatePreCommit)?;
        let _lock = file.lock().map_kind(ErrorKind::Lock)?;

        if file.size().map_kind(ErrorKind::PreCommitOpen)? == 0 {
            debug!("zero-filling pre-commit buffer of {desired} bytes");
            let zeros = vec![0u8; desired + COUNT_LEN];
            file.pwrite(&zeros, 0).map_kind(ErrorKind::FileWrite)?;
            if safety == Safety::Safe {
                file.sync().map_kind(ErrorKind::FileWrite)?;
            }
        }

        let map = file.map_rdwr().map_kind(ErrorKind::PreCommitOpen)?;
        Ok(Self { map })
    }

    /// Unlink and recreate the buffer at a new size.
    ///
    /// Administrative path: the caller must have flushed the staged bytes
    /// and must ensure no readers are active.
    pub fn recreate(&mut self, repo: &Repo, desired: usize, safety: Safety) -> Result<()> {
        std::fs::remove_file(repo.pre_commit_path()).map_kind(ErrorKind::PreCommitOpen)?;
        *self = Self::open(repo, desired, safety)?;
        Ok(())
    }

    /// Bytes the staging area can hold.
    pub fn capacity(&self) -> usize {
        self.map.len() - COUNT_LEN
    }

    /// Bytes currently staged.
    pub fn staged(&self) -> usize {
        let mut buf = [0; COUNT_LEN];
        buf.copy_from_slice(&self.map[..COUNT_LEN]);
        // Clamp a torn count so a corrupt file cannot index out of range.
        (u32::from_le_bytes(buf) as usize).min(self.capacity())
    }

    pub fn staged_bytes(&self) -> &[u8] {
        &self.map[COUNT_LEN..COUNT_LEN + self.staged()]
    }

    /// Append the buffers to the staging area. The caller checks capacity;
    /// the data-file lock it holds makes the copy single-writer.
    pub fn stage(&mut self, bufs: &[&[u8]]) {
        let mut pos = COUNT_LEN + self.staged();
        for buf in bufs {
            self.map[pos..pos + buf.len()].copy_from_slice(buf);
            pos += buf.len();
        }
        let count = (pos - COUNT_LEN) as u32;
        self.map[..COUNT_LEN].copy_from_slice(&count.to_le_bytes());
    }

    /// Discard the staged bytes (after they were written to the segment).
    pub fn reset(&mut self) {
        self.map[..COUNT_LEN].copy_from_slice(&0u32.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_and_reset() {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);

        let mut pc = PreCommit::open(&repo, 32, Safety::AlmostSafe).unwrap();
        assert_eq!(pc.capacity(), 32);
        assert_eq!(pc.staged(), 0);

        pc.stage(&[b"head", b"er"]);
        pc.stage(&[b"body"]);
        assert_eq!(pc.staged(), 10);
        assert_eq!(pc.staged_bytes(), b"headerbody");

        pc.reset();
        assert_eq!(pc.staged(), 0);
    }

    #[test]
    fn staged_count_survives_reopen() {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);

        let mut pc = PreCommit::open(&repo, 16, Safety::AlmostSafe).unwrap();
        pc.stage(&[b"abc"]);
        drop(pc);

        let pc = PreCommit::open(&repo, 16, Safety::AlmostSafe).unwrap();
        assert_eq!(pc.staged(), 3);
        assert_eq!(pc.staged_bytes(), b"abc");
    }

    #[test]
    fn recreate_resizes() {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);

        let mut pc = PreCommit::open(&repo, 16, Safety::AlmostSafe).unwrap();
        pc.recreate(&repo, 64, Safety::AlmostSafe).unwrap();
        assert_eq!(pc.capacity(), 64);
        assert_eq!(pc.staged(), 0);
    }
}
