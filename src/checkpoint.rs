//! Per-subscriber checkpoints and segment reclamation.
//!
//! Each subscriber owns one `cp.<hex-of-name>` file holding the last
//! `(log, marker)` it acknowledged, two little-endian u32s. Advancing a
//! checkpoint across segments sweeps the range left behind: any segment no
//! checkpoint references any more is unlinked together with its index.

use std::io;

use log::{debug, warn};

use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::repo::{self, Repo};
use crate::{LogId, Safety};

pub(crate) const CHECKPOINT_LEN: u64 = 8;

pub(crate) fn decode_id(buf: &[u8; CHECKPOINT_LEN as usize]) -> LogId {
    let mut log = [0; 4];
    let mut marker = [0; 4];
    log.copy_from_slice(&buf[0..4]);
    marker.copy_from_slice(&buf[4..8]);
    LogId {
        log: u32::from_le_bytes(log),
        marker: u32::from_le_bytes(marker),
    }
}

pub(crate) fn encode_id(id: LogId) -> [u8; CHECKPOINT_LEN as usize] {
    let mut buf = [0; CHECKPOINT_LEN as usize];
    buf[0..4].copy_from_slice(&id.log.to_le_bytes());
    buf[4..8].copy_from_slice(&id.marker.to_le_bytes());
    buf
}

fn open(repo: &Repo, subscriber: &str) -> Result<LogFile> {
    LogFile::open(&repo.checkpoint_path(subscriber), repo.file_mode(), repo.locking()).map_err(
        |e| {
            let kind = if e.kind() == io::ErrorKind::NotFound {
                ErrorKind::InvalidSubscriber
            } else {
                ErrorKind::Open
            };
            Error::with_source(kind, e)
        },
    )
}

/// Create the checkpoint file for a new subscriber.
///
/// Fails with [`ErrorKind::SubscriberExists`] if the subscriber already has
/// one.
pub(crate) fn create_exclusive(repo: &Repo, subscriber: &str) -> Result<()> {
    LogFile::create_new(&repo.checkpoint_path(subscriber), repo.file_mode(), repo.locking())
        .map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::AlreadyExists {
                ErrorKind::SubscriberExists
            } else {
                ErrorKind::Open
            };
            Error::with_source(kind, e)
        })
        .map(drop)
}

/// Remove a subscriber's checkpoint. Returns `false` if there was none.
pub(crate) fn remove(repo: &Repo, subscriber: &str) -> Result<bool> {
    match std::fs::remove_file(repo.checkpoint_path(subscriber)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::with_source(ErrorKind::Open, e)),
    }
}

/// Read a subscriber's checkpoint under its file lock.
pub(crate) fn read(repo: &Repo, subscriber: &str) -> Result<LogId> {
    let file = open(repo, subscriber)?;
    let _lock = file.lock().map_kind(ErrorKind::Lock)?;
    let mut buf = [0; CHECKPOINT_LEN as usize];
    file.pread(&mut buf, 0).map_kind(ErrorKind::InvalidSubscriber)?;
    Ok(decode_id(&buf))
}

/// Persist a subscriber's checkpoint, then reclaim every segment between
/// the previous position and the new one that no subscriber still needs.
pub(crate) fn write(repo: &Repo, subscriber: &str, id: LogId, safety: Safety) -> Result<()> {
    let file = open(repo, subscriber).map_err(|e| match e.kind() {
        ErrorKind::InvalidSubscriber => e,
        _ => Error::new(ErrorKind::Checkpoint),
    })?;
    let old = {
        let _lock = file.lock().map_kind(ErrorKind::Lock)?;
        let old = if file.size().map_kind(ErrorKind::Checkpoint)? == 0 {
            // First write: no segments were pending on this subscriber.
            LogId { log: id.log, marker: 0 }
        } else {
            let mut buf = [0; CHECKPOINT_LEN as usize];
            file.pread(&mut buf, 0).map_kind(ErrorKind::Checkpoint)?;
            decode_id(&buf)
        };
        file.pwrite(&encode_id(id), 0).map_kind(ErrorKind::FileWrite)?;
        if safety == Safety::Safe {
            file.sync().map_kind(ErrorKind::FileWrite)?;
        }
        old
    };

    for log in old.log..id.log {
        match pending_readers(repo, log) {
            Ok((0, _)) => {
                if let Err(e) = repo.remove_segment(log) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("failed to reclaim segment {log:08x}: {e}");
                    }
                }
            }
            Ok((n, _)) => debug!("segment {log:08x} still has {n} pending reader(s)"),
            Err(e) => warn!("cannot count pending readers of {log:08x}: {e}"),
        }
    }
    Ok(())
}

/// Count the subscribers whose checkpoint still references segment `log`
/// or an earlier one, scanning every checkpoint file under its own lock.
/// Also reports the earliest checkpointed segment, if any.
pub(crate) fn pending_readers(repo: &Repo, log: u32) -> Result<(usize, Option<u32>)> {
    let mut readers = 0;
    let mut earliest = None;

    for name in repo.checkpoint_file_names().map_kind(ErrorKind::NotDir)? {
        let path = repo.root().join(&name);
        let Ok(file) = LogFile::open(&path, repo.file_mode(), repo.locking()) else {
            continue;
        };
        let Ok(_lock) = file.lock() else {
            continue;
        };
        let mut buf = [0; CHECKPOINT_LEN as usize];
        if file.pread(&mut buf, 0).is_err() {
            continue;
        }
        let id = decode_id(&buf);
        earliest = Some(match earliest {
            None => id.log,
            Some(e) if id.log < e => id.log,
            Some(e) => e,
        });
        if id.log <= log {
            readers += 1;
        }
    }
    Ok((readers, earliest))
}

/// All subscriber names with a checkpoint in this log directory.
pub(crate) fn list(repo: &Repo) -> Result<Vec<String>> {
    let mut subscribers = Vec::new();
    for name in repo.checkpoint_file_names().map_kind(ErrorKind::NotDir)? {
        if let Some(subscriber) = repo::subscriber_of_file_name(&name) {
            subscribers.push(subscriber);
        }
    }
    subscribers.sort_unstable();
    Ok(subscribers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_repo() -> (TempDir, Repo) {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);
        (tmp, repo)
    }

    #[test]
    fn create_read_write() {
        let (_tmp, repo) = test_repo();

        assert_eq!(
            read(&repo, "s").unwrap_err().kind(),
            ErrorKind::InvalidSubscriber
        );

        create_exclusive(&repo, "s").unwrap();
        assert_eq!(
            create_exclusive(&repo, "s").unwrap_err().kind(),
            ErrorKind::SubscriberExists
        );

        let id = LogId { log: 2, marker: 9 };
        write(&repo, "s", id, Safety::AlmostSafe).unwrap();
        assert_eq!(read(&repo, "s").unwrap(), id);

        // Idempotent: a second identical write changes nothing.
        write(&repo, "s", id, Safety::AlmostSafe).unwrap();
        assert_eq!(read(&repo, "s").unwrap(), id);

        assert!(remove(&repo, "s").unwrap());
        assert!(!remove(&repo, "s").unwrap());
    }

    #[test]
    fn sweep_unlinks_unreferenced_segments() {
        let (_tmp, repo) = test_repo();
        for log in 0..3 {
            repo.create_segment(log).unwrap();
        }
        create_exclusive(&repo, "s").unwrap();
        write(&repo, "s", LogId { log: 0, marker: 1 }, Safety::AlmostSafe).unwrap();

        write(&repo, "s", LogId { log: 2, marker: 1 }, Safety::AlmostSafe).unwrap();
        assert!(!repo.segment_path(0).exists());
        assert!(!repo.segment_path(1).exists());
        assert!(repo.segment_path(2).exists());
    }

    #[test]
    fn sweep_respects_other_subscribers() {
        let (_tmp, repo) = test_repo();
        for log in 0..3 {
            repo.create_segment(log).unwrap();
        }
        create_exclusive(&repo, "fast").unwrap();
        write(&repo, "fast", LogId { log: 0, marker: 1 }, Safety::AlmostSafe).unwrap();
        create_exclusive(&repo, "slow").unwrap();
        write(&repo, "slow", LogId { log: 1, marker: 1 }, Safety::AlmostSafe).unwrap();

        write(&repo, "fast", LogId { log: 2, marker: 1 }, Safety::AlmostSafe).unwrap();
        // "slow" still needs segment 1; segment 0 is fair game.
        assert!(!repo.segment_path(0).exists());
        assert!(repo.segment_path(1).exists());
        assert!(repo.segment_path(2).exists());
    }

    #[test]
    fn pending_reader_counts() {
        let (_tmp, repo) = test_repo();
        create_exclusive(&repo, "a").unwrap();
        write(&repo, "a", LogId { log: 1, marker: 1 }, Safety::AlmostSafe).unwrap();
        create_exclusive(&repo, "b").unwrap();
        write(&repo, "b", LogId { log: 4, marker: 1 }, Safety::AlmostSafe).unwrap();

        assert_eq!(pending_readers(&repo, 0).unwrap(), (0, Some(1)));
        assert_eq!(pending_readers(&repo, 1).unwrap(), (1, Some(1)));
        assert_eq!(pending_readers(&repo, 4).unwrap(), (2, Some(1)));
    }

    #[test]
    fn lists_subscribers_by_name() {
        let (_tmp, repo) = test_repo();
        create_exclusive(&repo, "tail").unwrap();
        create_exclusive(&repo, "archiver").unwrap();

        assert_eq!(list(&repo).unwrap(), vec!["archiver", "tail"]);
    }
}
