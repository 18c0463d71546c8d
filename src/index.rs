//! Index resync: reconstructing or extending a segment's `.idx` sidecar.
//!
//! An index is an array of little-endian u64 byte offsets into its segment,
//! one per record in marker order. A trailing zero entry marks the index
//! closed: the segment is frozen and will not grow. Indexes are derived
//! state: resync is idempotent and a deleted index is rebuilt from the
//! segment on the next read.

use std::io;

use log::{debug, warn};

use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::repo::Repo;
use crate::segment::{self, HeaderShape};
use crate::LogId;

/// Offsets buffered between index writes during a scan.
const BUFFERED_OFFSETS: usize = 1024;
const ENTRY_LEN: u64 = 8;

/// Outcome of a resync: the last marker present in the index, and whether
/// the index is closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Resync {
    pub last: LogId,
    pub closed: bool,
}

/// Bring the index of segment `log` up to date with the segment contents,
/// retrying through repair when the segment is frozen.
///
/// Open failures are surfaced immediately. Corruption in a frozen segment
/// (`log < storage_log`) triggers [`segment::repair_datafile`] followed by
/// an index rebuild from scratch, up to four attempts in total. Corruption
/// in the current segment is surfaced without destructive repair, as the
/// writer may still be appending to it.
pub(crate) fn resync_index(
    repo: &Repo,
    shape: HeaderShape,
    magic: u32,
    storage_log: u32,
    log: u32,
) -> Result<Resync> {
    let data = repo.open_segment(log).map_kind(ErrorKind::FileOpen)?;
    let index = repo.open_index(log).map_kind(ErrorKind::IdxOpen)?;

    let mut last_err = None;
    for attempt in 0..4 {
        match resync_once(repo, &data, &index, shape, magic, storage_log, log) {
            Ok((marker, closed)) => {
                return Ok(Resync {
                    last: LogId { log, marker },
                    closed,
                })
            }
            Err(e) => {
                if matches!(e.kind(), ErrorKind::FileOpen | ErrorKind::IdxOpen) {
                    return Err(e);
                }
                // We cannot repair a segment someone may still write to.
                if log >= storage_log {
                    return Err(e);
                }
                warn!("resync of segment {log:08x} failed (attempt {attempt}): {e}; repairing");
                if let Ok(guard) = index.lock() {
                    let _ = segment::repair_datafile(&data, shape, magic);
                    let _ = index.truncate(0);
                    drop(guard);
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::new(ErrorKind::IdxCorrupt)))
}

/// A single resync pass without the repair loop; used by the read path's
/// recovery, which must not destructively repair a segment on its own.
pub(crate) fn resync_index_once(
    repo: &Repo,
    shape: HeaderShape,
    magic: u32,
    storage_log: u32,
    log: u32,
) -> Result<Resync> {
    let data = repo.open_segment(log).map_kind(ErrorKind::FileOpen)?;
    let index = repo.open_index(log).map_kind(ErrorKind::IdxOpen)?;
    resync_once(repo, &data, &index, shape, magic, storage_log, log).map(|(marker, closed)| {
        Resync {
            last: LogId { log, marker },
            closed,
        }
    })
}

/// One resync pass under the index lock.
///
/// Returns the last marker and closedness. Recoverable inconsistencies
/// (misaligned index, offsets past end of segment, failed index writes)
/// restart the pass once from a truncated index; a second failure reports
/// `IdxCorrupt`. A record with a bad magic is `FileCorrupt`; only repair
/// may touch the segment itself.
fn resync_once(
    repo: &Repo,
    data: &LogFile,
    index: &LogFile,
    shape: HeaderShape,
    magic: u32,
    storage_log: u32,
    log: u32,
) -> Result<(u32, bool)> {
    let hdr_len = shape.len() as u64;
    let mut second_try = false;

    'restart: loop {
        let _lock = index.lock().map_kind(ErrorKind::Lock)?;

        let data_len = data.size().map_kind(ErrorKind::FileSeek)?;
        if data_len == 0 && log < storage_log {
            // Frozen and empty: the segment was emptied by repair. Finish
            // the reclamation so readers skip it.
            debug!("unlinking empty frozen segment {log:08x}");
            let _ = repo.remove_segment(log);
            return Err(Error::with_source(
                ErrorKind::FileOpen,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let mut index_off = index.size().map_kind(ErrorKind::IdxSeek)?;

        macro_rules! restart {
            () => {{
                if !second_try {
                    let _ = index.truncate(index_off);
                    second_try = true;
                    continue 'restart;
                }
                return Err(Error::new(ErrorKind::IdxCorrupt));
            }};
        }

        if index_off % ENTRY_LEN != 0 {
            debug!("index of {log:08x} has misaligned size {index_off}");
            restart!();
        }

        let mut data_off: u64 = 0;
        if index_off > ENTRY_LEN {
            let mut buf = [0; ENTRY_LEN as usize];
            index
                .pread(&mut buf, index_off - ENTRY_LEN)
                .map_kind(ErrorKind::IdxRead)?;
            let last_entry = u64::from_le_bytes(buf);
            if last_entry == 0 {
                // Terminal zero: frozen and fully indexed.
                return Ok(((index_off / ENTRY_LEN - 1) as u32, true));
            }
            if last_entry > data_len {
                debug!("index of {log:08x} points past end of segment");
                restart!();
            }
            data_off = last_entry;
        }
        if index_off > 0 {
            // The last entry names a record already indexed; skip over it.
            let hdr =
                segment::read_header_at(data, data_off, shape).map_kind(ErrorKind::FileRead)?;
            data_off += hdr_len + shape.disk_len(&hdr) as u64;
            if data_off > data_len {
                debug!("index of {log:08x} overshoots segment length {data_len}");
                restart!();
            }
        }

        let mut batch = Vec::with_capacity(BUFFERED_OFFSETS * ENTRY_LEN as usize);
        while data_off + hdr_len <= data_len {
            let hdr =
                segment::read_header_at(data, data_off, shape).map_kind(ErrorKind::FileRead)?;
            if hdr.reserved != magic {
                warn!(
                    "segment {log:08x}: bad record magic {:#010x} at offset {data_off}",
                    hdr.reserved
                );
                return Err(Error::new(ErrorKind::FileCorrupt));
            }
            let next_off = data_off + hdr_len + shape.disk_len(&hdr) as u64;
            if next_off > data_len {
                break;
            }
            batch.extend_from_slice(&data_off.to_le_bytes());
            if batch.len() == BUFFERED_OFFSETS * ENTRY_LEN as usize {
                debug!("flushing {BUFFERED_OFFSETS} offsets");
                if index.pwrite(&batch, index_off).is_err() {
                    restart!();
                }
                index_off += batch.len() as u64;
                batch.clear();
            }
            data_off = next_off;
        }
        if !batch.is_empty() {
            if index.pwrite(&batch, index_off).is_err() {
                restart!();
            }
            index_off += batch.len() as u64;
        }

        let marker = (index_off / ENTRY_LEN) as u32;
        if log >= storage_log {
            return Ok((marker, false));
        }

        // The writer may have appended and rotated while we scanned; only
        // an unchanged length lets us freeze this index.
        let recheck = data.size().map_kind(ErrorKind::FileSeek)?;
        if recheck != data_len {
            debug!("segment {log:08x} grew during resync, {data_len} -> {recheck}");
            restart!();
        }
        if data_off != data_len {
            return Err(Error::new(ErrorKind::FileCorrupt));
        }
        // An empty index cannot take the terminal zero: the next reader
        // would take it for an entry naming offset zero. Repaired-empty
        // segments stay open-ended until they are unlinked.
        if index_off > 0 {
            if index.pwrite(&0u64.to_le_bytes(), index_off).is_err() {
                restart!();
            }
        }
        return Ok((marker, true));
    }
}

/// Read one index entry; `marker` is 1-based.
pub(crate) fn read_entry(index: &LogFile, marker: u32) -> io::Result<u64> {
    let mut buf = [0; ENTRY_LEN as usize];
    index.pread(&mut buf, (marker as u64 - 1) * ENTRY_LEN)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{HeaderShape, RecordHeader, MAGIC_UNCOMPRESSED};
    use tempfile::{tempdir, TempDir};

    const SHAPE: HeaderShape = HeaderShape::Plain;

    fn repo_with_records(payloads: &[&[u8]]) -> (TempDir, Repo) {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);
        let data = repo.create_segment(0).unwrap();
        let mut off = 0;
        for payload in payloads {
            let hdr = RecordHeader {
                reserved: MAGIC_UNCOMPRESSED,
                mlen: payload.len() as u32,
                ..RecordHeader::default()
            };
            let mut buf = [0; HeaderShape::MAX_LEN];
            let n = hdr.encode(SHAPE, &mut buf);
            data.pwritev(&[&buf[..n], payload], off).unwrap();
            off += (n + payload.len()) as u64;
        }
        (tmp, repo)
    }

    #[test]
    fn builds_index_for_open_segment() {
        let (_tmp, repo) = repo_with_records(&[b"a", b"bb", b"ccc"]);

        let resync = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 0, 0).unwrap();
        assert_eq!(resync.last, LogId { log: 0, marker: 3 });
        assert!(!resync.closed);

        // Three entries, no terminal zero while the segment may grow.
        let index = repo.open_index(0).unwrap();
        assert_eq!(index.size().unwrap(), 24);
        assert_eq!(read_entry(&index, 1).unwrap(), 0);
        assert_eq!(read_entry(&index, 2).unwrap(), 17);
        assert_eq!(read_entry(&index, 3).unwrap(), 35);
    }

    #[test]
    fn closes_index_of_frozen_segment() {
        let (_tmp, repo) = repo_with_records(&[b"a", b"bb"]);

        let resync = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 1, 0).unwrap();
        assert_eq!(resync.last.marker, 2);
        assert!(resync.closed);

        let index = repo.open_index(0).unwrap();
        assert_eq!(index.size().unwrap(), 24);
        assert_eq!(read_entry(&index, 3).unwrap(), 0);

        // A second resync takes the short path off the terminal zero.
        let again = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 1, 0).unwrap();
        assert_eq!(again, resync);
    }

    #[test]
    fn extends_partial_index() {
        let (_tmp, repo) = repo_with_records(&[b"a", b"bb", b"ccc"]);
        resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 0, 0).unwrap();

        // Drop the last entry; resync must re-derive it from the segment.
        let index = repo.open_index(0).unwrap();
        index.truncate(16).unwrap();
        let resync = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 0, 0).unwrap();
        assert_eq!(resync.last.marker, 3);
        assert_eq!(read_entry(&index, 3).unwrap(), 35);
    }

    #[test]
    fn rebuilds_misaligned_index_of_frozen_segment() {
        let (_tmp, repo) = repo_with_records(&[b"a", b"bb"]);
        resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 1, 0).unwrap();

        let index = repo.open_index(0).unwrap();
        index.truncate(13).unwrap();

        let resync = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 1, 0).unwrap();
        assert_eq!(resync.last.marker, 2);
        assert!(resync.closed);
    }

    #[test]
    fn surfaces_corruption_in_current_segment() {
        let (_tmp, repo) = repo_with_records(&[b"a", b"bb"]);
        // Flip the first record's magic.
        let data = repo.open_segment(0).unwrap();
        data.pwrite(&0xffff_ffffu32.to_le_bytes(), 0).unwrap();

        let err = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileCorrupt);
        // The segment was not modified.
        assert_eq!(data.size().unwrap(), 35);
    }

    #[test]
    fn missing_segment_reports_file_open() {
        let tmp = tempdir().unwrap();
        let repo = Repo::new(tmp.path().to_path_buf(), 0o640, true);

        let err = resync_index(&repo, SHAPE, MAGIC_UNCOMPRESSED, 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOpen);
        assert!(err.is_segment_missing());
    }
}
