//! Directory-level repair.
//!
//! Heals a log directory from first principles, trusting only the segment
//! files themselves: the hex range of segment names bounds everything else.
//! The metastore is rebuilt when malformed, checkpoints are clamped into
//! the live segment range and pulled back to their segment's resynced end,
//! and, in aggressive mode, damaged segments are scrubbed and their
//! indexes discarded.

use log::{debug, warn};

use crate::checkpoint;
use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::index;
use crate::meta;
use crate::repo::Repo;
use crate::segment::{self, HeaderShape};
use crate::LogId;

pub(crate) fn repair(repo: &Repo, aggressive: bool) -> Result<()> {
    let bounds = repo.storage_bounds().map_kind(ErrorKind::NotDir)?;
    let (earliest, latest) = bounds.unwrap_or((0, 0));
    debug!("repair: segment range {earliest:08x}..{latest:08x}");

    // Metastore first: its header magic determines how every record in the
    // directory is parsed.
    meta::repair_metastore(repo)?;
    let info = meta::read_info(repo)?;
    let shape = HeaderShape::of_magic(info.hdr_magic);

    repair_checkpoints(repo, shape, info.hdr_magic, info.storage_log, earliest, latest)?;

    if aggressive {
        repair_data(repo, shape, info.hdr_magic)?;
    }
    Ok(())
}

/// Clamp every checkpoint into `[earliest, latest]` and pull any that point
/// past their segment's resynced end back to it. Unreadable checkpoint
/// files are rewritten to the resynced end of the clamped segment.
fn repair_checkpoints(
    repo: &Repo,
    shape: HeaderShape,
    magic: u32,
    storage_log: u32,
    earliest: u32,
    latest: u32,
) -> Result<()> {
    for name in repo.checkpoint_file_names().map_kind(ErrorKind::NotDir)? {
        let path = repo.root().join(&name);
        let file = LogFile::create(&path, repo.file_mode(), repo.locking())
            .map_kind(ErrorKind::Checkpoint)?;

        let mut current = None;
        if file.size().map_kind(ErrorKind::Checkpoint)? == checkpoint::CHECKPOINT_LEN {
            let mut buf = [0; checkpoint::CHECKPOINT_LEN as usize];
            if file.pread(&mut buf, 0).is_ok() {
                current = Some(checkpoint::decode_id(&buf));
            }
        }

        let clamped = current
            .map(|id| id.log.clamp(earliest, latest))
            .unwrap_or(earliest);
        let end = index::resync_index(repo, shape, magic, storage_log, clamped)
            .map(|r| r.last)
            .unwrap_or(LogId {
                log: clamped,
                marker: 0,
            });

        let keep = matches!(
            current,
            Some(id) if id.log == end.log && id.marker <= end.marker
        );
        if !keep {
            match current {
                Some(id) => warn!("fixing checkpoint {name}: {id} -> {end}"),
                None => warn!("rewriting malformed checkpoint {name} to {end}"),
            }
            file.truncate(0).map_kind(ErrorKind::Checkpoint)?;
            file.pwrite(&checkpoint::encode_id(end), 0)
                .map_kind(ErrorKind::Checkpoint)?;
        }
    }
    Ok(())
}

/// Scrub every damaged segment and discard its index; resync rebuilds the
/// index from the repaired bytes on the next read.
fn repair_data(repo: &Repo, shape: HeaderShape, magic: u32) -> Result<()> {
    let mut first_err = None;
    for log in repo.existing_logs().map_kind(ErrorKind::NotDir)? {
        let result = (|| -> Result<()> {
            let data = repo.open_segment(log).map_kind(ErrorKind::FileOpen)?;
            if segment::inspect_datafile(&data, shape, magic)? {
                warn!("repairing segment {log:08x}");
                segment::repair_datafile(&data, shape, magic)?;
                match repo.remove_index(log) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        return Err(Error::with_source(ErrorKind::IdxWrite, e));
                    }
                    _ => {}
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!("repair of segment {log:08x} failed: {e}");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
