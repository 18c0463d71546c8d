//! The read path: interval discovery, message reads and checkpointing.
//!
//! A reader serves one named subscriber. `read_interval` reports the marker
//! range available past the subscriber's checkpoint, `read_message` and
//! `bulk_read` fetch records by id, and `read_checkpoint` acknowledges a
//! position, which may reclaim segments every subscriber has passed.
//!
//! Two strategies fetch record bytes: mapping the whole segment (the
//! default) or positional reads. Either way a record's header is copied
//! into an owned value before its fields are used (offsets into a map
//! carry no alignment guarantee), and every step through the segment is
//! bounds-checked against the view length.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use memmap2::Mmap;

use crate::checkpoint;
use crate::compress::Provider;
use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::index;
use crate::meta::Metastore;
use crate::repo::Repo;
use crate::segment::{self, HeaderShape, RecordHeader};
use crate::{Interval, LogId, Options, ReadMethod};

/// One message as returned by [`Reader::read_message`] and
/// [`Reader::bulk_read`].
///
/// The payload borrows the reader's internal buffers (or its segment
/// mapping) and is valid until the next read call.
#[derive(Debug)]
pub struct Message<'a> {
    pub header: MessageHeader,
    pub payload: &'a [u8],
}

/// Decoded record header, minus the on-disk magic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    /// Seconds of the writer-side timestamp.
    pub tv_sec: u32,
    /// Microseconds of the writer-side timestamp.
    pub tv_usec: u32,
    /// Payload length in bytes (original, before compression).
    pub len: u32,
    /// On-disk payload length for compressed logs.
    pub compressed_len: Option<u32>,
}

impl MessageHeader {
    fn of(hdr: &RecordHeader, shape: HeaderShape) -> Self {
        Self {
            tv_sec: hdr.tv_sec,
            tv_usec: hdr.tv_usec,
            len: hdr.mlen,
            compressed_len: match shape {
                HeaderShape::Plain => None,
                HeaderShape::Compressed => Some(hdr.compressed_len),
            },
        }
    }

    /// The writer-side timestamp of this message.
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.tv_sec as u64, self.tv_usec * 1000)
    }
}

/// How the current segment's bytes are reached.
#[derive(Debug)]
enum SegmentView {
    Mapped(Mmap),
    /// Zero-length segments are never mapped.
    Empty,
    /// Positional-read strategy; only the length snapshot is kept.
    Plain { len: u64 },
}

/// Where a loaded payload lives, resolved into a slice only after the
/// retry loop settles.
enum PayloadSrc {
    Mapped { off: usize, len: usize },
    Scratch { off: usize, len: usize },
}

/// An open reader for one subscriber of one log directory.
#[derive(Debug)]
pub struct Reader {
    repo: Repo,
    meta: Metastore,
    subscriber: String,
    read_method: ReadMethod,
    shape: HeaderShape,
    magic: u32,
    provider: Option<&'static dyn Provider>,
    current_log: u32,
    data: Option<LogFile>,
    index: Option<LogFile>,
    view: Option<SegmentView>,
    msg_buf: Vec<u8>,
    compressed_buf: Vec<u8>,
}

impl Reader {
    pub(crate) fn open(path: &Path, opts: &Options, subscriber: &str) -> Result<Self> {
        let md = fs::metadata(path).map_kind(ErrorKind::Open)?;
        if !md.is_dir() {
            return Err(Error::new(ErrorKind::NotDir));
        }
        let repo = Repo::new(path.to_path_buf(), opts.file_mode, opts.multi_process);
        let mut meta = Metastore::open(&repo, false).map_kind(ErrorKind::MetaOpen)?;
        // The subscriber must exist before anything else is touched.
        checkpoint::read(&repo, subscriber)?;
        meta.restore(&repo, true)?;

        let magic = meta.hdr_magic();
        let provider = segment::provider_for_magic(magic)?;
        Ok(Self {
            repo,
            meta,
            subscriber: subscriber.to_owned(),
            read_method: opts.read_method,
            shape: HeaderShape::of_magic(magic),
            magic,
            provider,
            current_log: 0,
            data: None,
            index: None,
            view: None,
            msg_buf: Vec::new(),
            compressed_buf: Vec::new(),
        })
    }

    /// The subscriber this reader serves.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// The marker range available past this subscriber's checkpoint.
    ///
    /// `count` is zero when the subscriber is caught up. A checkpoint
    /// pointing past the end of its segment (a crashed writer lost the
    /// acknowledged records) is self-healed by persisting the resynced end.
    /// When the whole checkpointed segment turned out to be reclaimed, the
    /// advanced position is persisted so the skip happens once.
    pub fn read_interval(&mut self) -> Result<Interval> {
        let chk = checkpoint::read(&self.repo, &self.subscriber)?;
        let (mut start, finish) = self.find_first_log_after(chk)?;

        start.marker = if start.log != chk.log { 0 } else { chk.marker };
        if start.log != chk.log {
            // The subscriber skipped a whole segment; persist so this work
            // is not repeated.
            self.write_checkpoint(start)?;
        }

        let count = finish.marker as i64 - start.marker as i64;
        if finish.marker > start.marker {
            start.marker += 1;
        }
        let count = if count < 0 {
            warn!(
                "repairing checkpoint for {:?}: {start} is past {finish}",
                self.subscriber
            );
            self.write_checkpoint(finish)?;
            0
        } else {
            count as u32
        };

        // Drop the view so the next read remaps with any newly appended
        // data in range.
        self.view = None;

        Ok(Interval {
            count,
            first: start,
            last: finish,
        })
    }

    /// Read the message at `id`.
    ///
    /// Index corruption is handled by truncating and resyncing the index,
    /// then retrying once under the index lock; `CloseLogId` (the id names
    /// a frozen segment's terminal marker) is surfaced immediately.
    pub fn read_message(&mut self, id: LogId) -> Result<Message<'_>> {
        let mut with_lock = false;
        let (header, src) = loop {
            match self.load_one(id, with_lock) {
                Ok(loaded) => break loaded,
                Err(e) => {
                    if e.kind() == ErrorKind::CloseLogId || with_lock {
                        return Err(e);
                    }
                    self.recover_index(id.log, &e);
                    with_lock = true;
                }
            }
        };
        Ok(self.message(header, src))
    }

    /// Read `count` consecutive messages starting at `id`.
    ///
    /// All payloads are materialized before the call returns; the total
    /// uncompressed size is computed first and the scratch buffer grown to
    /// exactly that sum.
    pub fn bulk_read(&mut self, id: LogId, count: usize) -> Result<Vec<Message<'_>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut with_lock = false;
        let loaded = loop {
            match self.load_bulk(id, count, with_lock) {
                Ok(loaded) => break loaded,
                Err(e) => {
                    if e.kind() == ErrorKind::CloseLogId || with_lock {
                        return Err(e);
                    }
                    self.recover_index(id.log, &e);
                    with_lock = true;
                }
            }
        };
        Ok(loaded
            .into_iter()
            .map(|(header, src)| self.message(header, src))
            .collect())
    }

    /// Acknowledge `id`: persist it as this subscriber's checkpoint and
    /// reclaim any segments no subscriber needs any more.
    pub fn read_checkpoint(&mut self, id: LogId) -> Result<()> {
        self.write_checkpoint(id)
    }

    /// Advance `start`/`finish` past `cur`, refreshing the interval when
    /// `cur` has exhausted it. Tail-style consumers alternate reads at
    /// `*start` with this call.
    pub fn advance_id(&mut self, cur: LogId, start: &mut LogId, finish: &mut LogId) -> Result<()> {
        if cur != *finish {
            start.marker += 1;
        } else {
            let (s, f) = self.find_first_log_after(cur)?;
            *start = s;
            *finish = f;
            start.marker = if cur.log != start.log { 1 } else { cur.marker };
        }
        Ok(())
    }

    /// The position of the last record in the current storage segment.
    pub fn last_log_id(&mut self) -> Result<LogId> {
        let storage_log = self.meta.storage_log();
        index::resync_index_once(&self.repo, self.shape, self.magic, storage_log, storage_log)
            .map(|r| r.last)
    }

    /// The segment currently designated for appends.
    pub fn last_storage_log(&self) -> u32 {
        self.meta.storage_log()
    }

    fn write_checkpoint(&self, id: LogId) -> Result<()> {
        checkpoint::write(&self.repo, &self.subscriber, id, self.meta.safety()).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSubscriber | ErrorKind::Lock => e,
                _ => Error::new(ErrorKind::Checkpoint),
            }
        })
    }

    /// Resolve the first segment with readable records at or after `chk`.
    ///
    /// Returns `(start, finish)` within one segment. Reclaimed segments are
    /// skipped; a fully consumed frozen segment advances to the next one;
    /// the scan never advances past `storage_log`.
    fn find_first_log_after(&mut self, chk: LogId) -> Result<(LogId, LogId)> {
        let mut start = chk;
        loop {
            let storage_log = self.meta.storage_log();
            let resync = match index::resync_index(
                &self.repo,
                self.shape,
                self.magic,
                storage_log,
                start.log,
            ) {
                Ok(resync) => resync,
                Err(e) if e.is_segment_missing() => {
                    // The segment was reclaimed. Recover by advancing to
                    // the next one that could exist.
                    match fs::metadata(self.repo.segment_path(start.log + 1)) {
                        Ok(_) => {}
                        Err(stat) if stat.kind() == io::ErrorKind::NotFound => {}
                        Err(_) => return Ok((start, start)),
                    }
                    if start.log >= storage_log {
                        // Never advance past where writers are.
                        return Ok((start, start));
                    }
                    debug!("skipping reclaimed segment {:08x}", start.log);
                    start = LogId {
                        log: start.log + 1,
                        marker: 0,
                    };
                    continue;
                }
                Err(e) => return Err(e),
            };

            let last = resync.last;
            // A checkpoint past the resynced end pulls back to it.
            if last.log == start.log && last.marker < start.marker {
                start = last;
            }
            if start == last && resync.closed {
                if start.log >= storage_log {
                    return Ok((start, start));
                }
                start = LogId {
                    log: start.log + 1,
                    marker: 0,
                };
                continue;
            }
            return Ok((start, last));
        }
    }

    /// After a failed read: truncate the index if it was corrupt, run one
    /// resync pass, and let the caller retry under the index lock.
    fn recover_index(&mut self, log: u32, e: &Error) {
        debug!("read of segment {log:08x} failed ({e}); resyncing for a locked retry");
        if e.kind() == ErrorKind::IdxCorrupt {
            if let Some(index) = self.index.as_ref() {
                if let Ok(_lock) = index.lock() {
                    let _ = index.truncate(0);
                }
            }
        }
        let storage_log = self.meta.storage_log();
        if let Err(resync_err) =
            index::resync_index_once(&self.repo, self.shape, self.magic, storage_log, log)
        {
            debug!("recovery resync of {log:08x} failed: {resync_err}");
        }
        // The view may be stale as well; rebuild it on the retry.
        self.view = None;
    }

    fn open_segment(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.data = None;
            self.index = None;
            self.view = None;
        }
        if self.data.is_none() {
            self.data = Some(self.repo.open_segment(log).map_kind(ErrorKind::FileOpen)?);
            self.current_log = log;
        }
        Ok(())
    }

    fn open_index(&mut self, log: u32) -> Result<()> {
        if self.current_log != log {
            self.data = None;
            self.index = None;
            self.view = None;
        }
        if self.index.is_none() {
            self.index = Some(self.repo.open_index(log).map_kind(ErrorKind::IdxOpen)?);
            self.current_log = log;
        }
        Ok(())
    }

    fn setup_view(&mut self) -> Result<()> {
        if self.view.is_some() {
            return Ok(());
        }
        let Some(data) = self.data.as_ref() else {
            return Err(Error::new(ErrorKind::FileOpen));
        };
        let view = match self.read_method {
            ReadMethod::Mmap => {
                let len = data.size().map_kind(ErrorKind::FileRead)?;
                if len == 0 {
                    SegmentView::Empty
                } else {
                    SegmentView::Mapped(data.map_read().map_kind(ErrorKind::FileRead)?)
                }
            }
            ReadMethod::Pread => SegmentView::Plain {
                len: data.size().map_kind(ErrorKind::FileSeek)?,
            },
        };
        self.view = Some(view);
        Ok(())
    }

    fn view_len(&self) -> u64 {
        match &self.view {
            Some(SegmentView::Mapped(map)) => map.len() as u64,
            Some(SegmentView::Plain { len }) => *len,
            Some(SegmentView::Empty) | None => 0,
        }
    }

    /// Copy the record header at `off` out of the view, bounds-checked.
    fn record_header_at(&self, off: u64) -> Result<RecordHeader> {
        let hdr_len = self.shape.len() as u64;
        if off + hdr_len > self.view_len() {
            debug!("header read at {off} is past the view of {} bytes", self.view_len());
            return Err(Error::new(ErrorKind::IdxCorrupt));
        }
        match &self.view {
            Some(SegmentView::Mapped(map)) => {
                Ok(RecordHeader::decode(&map[off as usize..], self.shape))
            }
            Some(SegmentView::Plain { .. }) => {
                let Some(data) = self.data.as_ref() else {
                    return Err(Error::new(ErrorKind::FileOpen));
                };
                segment::read_header_at(data, off, self.shape).map_kind(ErrorKind::IdxRead)
            }
            Some(SegmentView::Empty) | None => Err(Error::new(ErrorKind::IdxCorrupt)),
        }
    }

    /// Look up `id` in the index and validate the entry. The terminal zero
    /// of a frozen segment reads as `CloseLogId`.
    fn indexed_offset(&self, id: LogId) -> Result<u64> {
        let Some(index) = self.index.as_ref() else {
            return Err(Error::new(ErrorKind::IdxOpen));
        };
        let index_len = index.size().map_kind(ErrorKind::IdxSeek)?;
        if index_len % 8 != 0 {
            return Err(Error::new(ErrorKind::IdxCorrupt));
        }
        if id.marker as u64 * 8 > index_len {
            return Err(Error::new(ErrorKind::IllegalLogId));
        }
        let data_off = index::read_entry(index, id.marker).map_kind(ErrorKind::IdxRead)?;
        if data_off == 0 && id.marker != 1 {
            if id.marker as u64 * 8 == index_len {
                return Err(Error::new(ErrorKind::CloseLogId));
            }
            // A zero in the middle of an index is corruption.
            return Err(Error::new(ErrorKind::IdxCorrupt));
        }
        Ok(data_off)
    }

    fn lock_index(&self) -> Result<crate::fileio::FileLock> {
        let Some(index) = self.index.as_ref() else {
            return Err(Error::new(ErrorKind::IdxOpen));
        };
        index.lock().map_kind(ErrorKind::Lock)
    }

    fn ensure_msg_buf(&mut self, needed: usize) {
        if self.msg_buf.len() < needed {
            self.msg_buf.resize(needed.saturating_mul(2), 0);
        }
    }

    fn load_one(&mut self, id: LogId, with_lock: bool) -> Result<(RecordHeader, PayloadSrc)> {
        if id.marker < 1 {
            return Err(Error::new(ErrorKind::IllegalLogId));
        }
        self.open_segment(id.log)?;
        self.open_index(id.log)?;
        let _lock = if with_lock {
            Some(self.lock_index()?)
        } else {
            None
        };

        let data_off = self.indexed_offset(id)?;
        self.setup_view()?;

        let hdr = self.record_header_at(data_off)?;
        let hdr_len = self.shape.len() as u64;
        let disk_len = self.shape.disk_len(&hdr) as u64;
        if data_off + hdr_len + disk_len > self.view_len() {
            debug!("record at {data_off} runs past the view");
            return Err(Error::new(ErrorKind::IdxCorrupt));
        }

        let payload_off = data_off + hdr_len;
        let mlen = hdr.mlen as usize;
        let mapped = matches!(self.view, Some(SegmentView::Mapped(_)));

        if self.provider.is_none() && mapped {
            return Ok((
                hdr,
                PayloadSrc::Mapped {
                    off: payload_off as usize,
                    len: mlen,
                },
            ));
        }

        self.ensure_msg_buf(mlen);
        match self.provider {
            Some(provider) => {
                let clen = disk_len as usize;
                let produced = if let Some(SegmentView::Mapped(map)) = &self.view {
                    provider.decompress(
                        &map[payload_off as usize..payload_off as usize + clen],
                        &mut self.msg_buf[..mlen],
                    )?
                } else {
                    let Some(data) = self.data.as_ref() else {
                        return Err(Error::new(ErrorKind::FileOpen));
                    };
                    if self.compressed_buf.len() < clen {
                        self.compressed_buf.resize(clen.saturating_mul(2), 0);
                    }
                    data.pread(&mut self.compressed_buf[..clen], payload_off)
                        .map_kind(ErrorKind::IdxRead)?;
                    provider.decompress(&self.compressed_buf[..clen], &mut self.msg_buf[..mlen])?
                };
                if produced != mlen {
                    return Err(Error::new(ErrorKind::FileCorrupt));
                }
            }
            None => {
                let Some(data) = self.data.as_ref() else {
                    return Err(Error::new(ErrorKind::FileOpen));
                };
                data.pread(&mut self.msg_buf[..mlen], payload_off)
                    .map_kind(ErrorKind::IdxRead)?;
            }
        }
        Ok((hdr, PayloadSrc::Scratch { off: 0, len: mlen }))
    }

    fn load_bulk(
        &mut self,
        id: LogId,
        count: usize,
        with_lock: bool,
    ) -> Result<Vec<(RecordHeader, PayloadSrc)>> {
        if id.marker < 1 {
            return Err(Error::new(ErrorKind::IllegalLogId));
        }
        self.open_segment(id.log)?;
        self.open_index(id.log)?;
        let _lock = if with_lock {
            Some(self.lock_index()?)
        } else {
            None
        };

        let data_off = self.indexed_offset(id)?;
        self.setup_view()?;

        let hdr_len = self.shape.len() as u64;

        // First pass: headers only, summing payload sizes.
        let mut headers = Vec::with_capacity(count);
        let mut iter_off = data_off;
        let mut total_payload = 0usize;
        let mut total_disk = 0u64;
        for _ in 0..count {
            let hdr = self.record_header_at(iter_off)?;
            let disk_len = self.shape.disk_len(&hdr) as u64;
            headers.push((hdr, iter_off));
            total_payload += hdr.mlen as usize;
            total_disk += disk_len;
            iter_off += hdr_len + disk_len;
        }
        if data_off + hdr_len * count as u64 + total_disk > self.view_len() {
            debug!("bulk read of {count} records runs past the view");
            return Err(Error::new(ErrorKind::IdxCorrupt));
        }

        // Second pass: materialize payloads in order.
        if self.provider.is_none() && matches!(self.view, Some(SegmentView::Mapped(_))) {
            return Ok(headers
                .into_iter()
                .map(|(hdr, off)| {
                    let src = PayloadSrc::Mapped {
                        off: (off + hdr_len) as usize,
                        len: hdr.mlen as usize,
                    };
                    (hdr, src)
                })
                .collect());
        }

        if self.msg_buf.len() < total_payload {
            self.msg_buf.resize(total_payload, 0);
        }
        let mut out = Vec::with_capacity(count);
        let mut scratch_pos = 0usize;
        for (hdr, off) in headers {
            let payload_off = off + hdr_len;
            let mlen = hdr.mlen as usize;
            match self.provider {
                Some(provider) => {
                    let clen = self.shape.disk_len(&hdr) as usize;
                    let produced = match &self.view {
                        Some(SegmentView::Mapped(map)) => provider.decompress(
                            &map[payload_off as usize..payload_off as usize + clen],
                            &mut self.msg_buf[scratch_pos..scratch_pos + mlen],
                        )?,
                        _ => {
                            let Some(data) = self.data.as_ref() else {
                                return Err(Error::new(ErrorKind::FileOpen));
                            };
                            if self.compressed_buf.len() < clen {
                                self.compressed_buf.resize(clen.saturating_mul(2), 0);
                            }
                            data.pread(&mut self.compressed_buf[..clen], payload_off)
                                .map_kind(ErrorKind::IdxRead)?;
                            provider.decompress(
                                &self.compressed_buf[..clen],
                                &mut self.msg_buf[scratch_pos..scratch_pos + mlen],
                            )?
                        }
                    };
                    if produced != mlen {
                        return Err(Error::new(ErrorKind::FileCorrupt));
                    }
                }
                None => {
                    let Some(data) = self.data.as_ref() else {
                        return Err(Error::new(ErrorKind::FileOpen));
                    };
                    data.pread(&mut self.msg_buf[scratch_pos..scratch_pos + mlen], payload_off)
                        .map_kind(ErrorKind::IdxRead)?;
                }
            }
            out.push((
                hdr,
                PayloadSrc::Scratch {
                    off: scratch_pos,
                    len: mlen,
                },
            ));
            scratch_pos += mlen;
        }
        Ok(out)
    }

    fn message(&self, header: RecordHeader, src: PayloadSrc) -> Message<'_> {
        let payload: &[u8] = match src {
            PayloadSrc::Mapped { off, len } => match &self.view {
                Some(SegmentView::Mapped(map)) => &map[off..off + len],
                _ => &[],
            },
            PayloadSrc::Scratch { off, len } => &self.msg_buf[off..off + len],
        };
        Message {
            header: MessageHeader::of(&header, self.shape),
            payload,
        }
    }
}
