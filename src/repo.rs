//! On-disk layout of a log directory.
//!
//! A log directory contains the `metastore`, an optional `pre_commit`
//! staging file, one segment file per generation named by the zero-padded
//! lowercase hex value of its `log` number, an `.idx` sidecar per segment,
//! and one `cp.<hex-of-name>` checkpoint file per subscriber.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::fileio::LogFile;

pub(crate) const METASTORE_FILE: &str = "metastore";
pub(crate) const PRE_COMMIT_FILE: &str = "pre_commit";
pub(crate) const INDEX_EXT: &str = ".idx";
pub(crate) const CHECKPOINT_PREFIX: &str = "cp.";

pub(crate) fn segment_file_name(log: u32) -> String {
    format!("{log:08x}")
}

/// Parse a directory entry name as a segment number.
///
/// Only the exact names written by [`segment_file_name`] match: eight
/// lowercase hex digits, nothing else.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u32> {
    if name.len() != 8 || !name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

pub(crate) fn checkpoint_file_name(subscriber: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{}", hex::encode(subscriber))
}

pub(crate) fn subscriber_of_file_name(name: &str) -> Option<String> {
    let encoded = name.strip_prefix(CHECKPOINT_PREFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Resolves names within one log directory and opens its files.
#[derive(Clone, Debug)]
pub(crate) struct Repo {
    root: PathBuf,
    file_mode: u32,
    locking: bool,
}

impl Repo {
    pub fn new(root: PathBuf, file_mode: u32, locking: bool) -> Self {
        Self {
            root,
            file_mode,
            locking,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_mode(&self) -> u32 {
        self.file_mode
    }

    pub fn locking(&self) -> bool {
        self.locking
    }

    pub fn segment_path(&self, log: u32) -> PathBuf {
        self.root.join(segment_file_name(log))
    }

    pub fn index_path(&self, log: u32) -> PathBuf {
        self.root.join(format!("{}{INDEX_EXT}", segment_file_name(log)))
    }

    pub fn metastore_path(&self) -> PathBuf {
        self.root.join(METASTORE_FILE)
    }

    pub fn pre_commit_path(&self) -> PathBuf {
        self.root.join(PRE_COMMIT_FILE)
    }

    pub fn checkpoint_path(&self, subscriber: &str) -> PathBuf {
        self.root.join(checkpoint_file_name(subscriber))
    }

    /// Open the segment `log`, which must exist.
    pub fn open_segment(&self, log: u32) -> io::Result<LogFile> {
        LogFile::open(&self.segment_path(log), self.file_mode, self.locking)
    }

    /// Open the segment `log`, creating it if absent.
    pub fn create_segment(&self, log: u32) -> io::Result<LogFile> {
        LogFile::create(&self.segment_path(log), self.file_mode, self.locking)
    }

    /// Open the index for segment `log`, creating it if absent. Indexes are
    /// derived state, built lazily on first read.
    pub fn open_index(&self, log: u32) -> io::Result<LogFile> {
        LogFile::create(&self.index_path(log), self.file_mode, self.locking)
    }

    pub fn remove_index(&self, log: u32) -> io::Result<()> {
        fs::remove_file(self.index_path(log))
    }

    /// Unlink the segment `log` and its index.
    pub fn remove_segment(&self, log: u32) -> io::Result<()> {
        debug!("unlinking segment {}", segment_file_name(log));
        fs::remove_file(self.segment_path(log))?;
        // The index may never have been built.
        match self.remove_index(log) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// All segment numbers present in the directory, ascending.
    pub fn existing_logs(&self) -> io::Result<Vec<u32>> {
        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(log) = name.to_str().and_then(parse_segment_file_name) {
                logs.push(log);
            }
        }
        logs.sort_unstable();
        Ok(logs)
    }

    /// The earliest and latest segment numbers, or `None` if the directory
    /// holds no segments.
    pub fn storage_bounds(&self) -> io::Result<Option<(u32, u32)>> {
        let logs = self.existing_logs()?;
        Ok(logs.first().zip(logs.last()).map(|(f, l)| (*f, *l)))
    }

    /// Names of all checkpoint files in the directory.
    pub fn checkpoint_file_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(CHECKPOINT_PREFIX) {
                    names.push(name.to_owned());
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        assert_eq!(segment_file_name(0), "00000000");
        assert_eq!(segment_file_name(0xdead_beef), "deadbeef");

        assert_eq!(parse_segment_file_name("00000000"), Some(0));
        assert_eq!(parse_segment_file_name("deadbeef"), Some(0xdead_beef));
        assert_eq!(parse_segment_file_name("DEADBEEF"), None);
        assert_eq!(parse_segment_file_name("0000000"), None);
        assert_eq!(parse_segment_file_name("00000000.idx"), None);
        assert_eq!(parse_segment_file_name("metastore"), None);
    }

    #[test]
    fn checkpoint_names() {
        let name = checkpoint_file_name("tail");
        assert_eq!(name, "cp.7461696c");
        assert_eq!(subscriber_of_file_name(&name).as_deref(), Some("tail"));
        assert_eq!(subscriber_of_file_name("cp.zz"), None);
        assert_eq!(subscriber_of_file_name("00000000"), None);
    }
}
