//! The append path: building records, staging or writing them, and
//! rotating segments.
//!
//! Only `storage_log`, the segment named by the metastore, may grow.
//! Appends happen under the segment's file lock; once a write leaves the
//! segment at or beyond `unit_limit`, the writer syncs and closes it and
//! performs the atomic increment that moves `storage_log` forward. With
//! several writer processes racing, exactly one performs the increment and
//! the rest adopt the new shared value.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::compress::Provider;
use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::meta::Metastore;
use crate::precommit::PreCommit;
use crate::repo::Repo;
use crate::segment::{self, HeaderShape, RecordHeader};
use crate::Options;

/// Where control goes after one locked append attempt.
#[derive(Eq, PartialEq)]
enum Outcome {
    /// Record placed; nothing else to do.
    Done,
    /// Record placed and the segment crossed `unit_limit`: rotate.
    Rotate,
    /// Segment was already full; rotate and run the attempt again.
    Retry,
}

/// An open writer for one log directory.
///
/// Methods take `&mut self`; a `Writer` shared between threads needs
/// external synchronization, while writers in other processes are
/// serialized by the segment file lock.
pub struct Writer {
    io: WriterIo,
    shape: HeaderShape,
    magic: u32,
    provider: Option<&'static dyn Provider>,
    compress_buf: Vec<u8>,
}

/// The file-handling half of the writer, split off so record encoding can
/// borrow the compression scratch while appending.
struct WriterIo {
    repo: Repo,
    meta: Metastore,
    pre_commit: PreCommit,
    current_log: u32,
    data: Option<LogFile>,
    closed: bool,
}

impl Writer {
    pub(crate) fn open(path: &Path, opts: &Options) -> Result<Self> {
        let md = fs::metadata(path).map_kind(ErrorKind::Open)?;
        if !md.is_dir() {
            return Err(Error::new(ErrorKind::NotDir));
        }
        let repo = Repo::new(path.to_path_buf(), opts.file_mode, opts.multi_process);
        let mut meta = Metastore::open(&repo, false).map_kind(ErrorKind::MetaOpen)?;
        meta.restore(&repo, false)?;

        let magic = meta.hdr_magic();
        let provider = segment::provider_for_magic(magic)?;
        let pre_commit = PreCommit::open(&repo, opts.pre_commit_size.unwrap_or(0), meta.safety())?;

        let mut writer = Self {
            io: WriterIo {
                current_log: meta.storage_log(),
                repo,
                meta,
                pre_commit,
                data: None,
                closed: false,
            },
            shape: HeaderShape::of_magic(magic),
            magic,
            provider,
            compress_buf: Vec::new(),
        };

        // Administrative path: an explicitly requested buffer size that
        // disagrees with the existing file means the operator resized it.
        // Flush what the previous incarnation staged, then rebuild the
        // file. Must not run while readers are active.
        if let Some(desired) = opts.pre_commit_size {
            if writer.io.pre_commit.capacity() != desired {
                debug!(
                    "recreating pre-commit buffer: {} -> {desired} bytes",
                    writer.io.pre_commit.capacity()
                );
                writer.io.flush_staged()?;
                writer
                    .io
                    .pre_commit
                    .recreate(&writer.io.repo, desired, writer.io.meta.safety())?;
            }
        }

        Ok(writer)
    }

    /// Append `message`, stamped with the current time.
    pub fn write(&mut self, message: &[u8]) -> Result<()> {
        self.write_with_timestamp(message, SystemTime::now())
    }

    /// Append `message` with an explicit timestamp.
    ///
    /// With a pre-commit buffer configured the record may be staged rather
    /// than written; it becomes visible to readers on the next flush.
    pub fn write_with_timestamp(&mut self, message: &[u8], when: SystemTime) -> Result<()> {
        let since = when.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut hdr = RecordHeader {
            reserved: self.magic,
            tv_sec: since.as_secs() as u32,
            tv_usec: since.subsec_micros(),
            mlen: message.len() as u32,
            compressed_len: 0,
        };

        // Build the on-disk payload outside any lock.
        let payload: &[u8] = match self.provider {
            Some(provider) => {
                let bound = provider.bound(message.len());
                if self.compress_buf.len() < bound {
                    self.compress_buf.resize(bound, 0);
                }
                let n = provider.compress(message, &mut self.compress_buf)?;
                hdr.compressed_len = n as u32;
                &self.compress_buf[..n]
            }
            None => message,
        };

        let mut buf = [0; HeaderShape::MAX_LEN];
        let n = hdr.encode(self.shape, &mut buf);
        self.io.append(&buf[..n], payload)
    }

    /// Write the staged pre-commit bytes to the segment, making them
    /// visible to readers. A no-op when the buffer is disabled.
    pub fn flush_pre_commit(&mut self) -> Result<()> {
        self.io.flush_staged()
    }

    /// Change the segment size limit of an initialized log, persisting it
    /// to the metastore.
    pub fn alter_journal_size(&mut self, bytes: u32) -> Result<()> {
        if self.io.meta.unit_limit() == bytes {
            return Ok(());
        }
        self.io.meta.set_unit_limit(bytes);
        self.io.meta.save(false).map_err(|e| match e.kind() {
            ErrorKind::Lock => e,
            _ => Error::new(ErrorKind::CreateMeta),
        })
    }

    /// The segment currently designated for appends.
    pub fn storage_log(&self) -> u32 {
        self.io.meta.storage_log()
    }

    /// Flush the pre-commit buffer, sync and close the current segment.
    ///
    /// Dropping a writer does the same, logging failures instead of
    /// returning them.
    pub fn close(mut self) -> Result<()> {
        self.io.flush_staged()?;
        self.io.close_segment();
        self.io.closed = true;
        Ok(())
    }
}

impl WriterIo {
    fn unit_limit(&self) -> u64 {
        self.meta.unit_limit() as u64
    }

    /// Open the shared current segment if no handle is held.
    fn ensure_segment(&mut self) -> Result<()> {
        if self.data.is_none() {
            let (log, data) = self.meta.open_current_segment(&self.repo)?;
            self.current_log = log;
            self.data = Some(data);
        }
        Ok(())
    }

    /// Sync and drop the segment handle; rotation requires it closed.
    fn close_segment(&mut self) {
        if let Some(data) = self.data.take() {
            if let Err(e) = data.sync() {
                warn!("failed to sync segment {:08x}: {e}", self.current_log);
            }
        }
    }

    fn rotate(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Err(Error::new(ErrorKind::NotSupported));
        }
        let (current, created) = self.meta.atomic_increment(&self.repo, self.current_log)?;
        self.current_log = current;
        self.data = created;
        Ok(())
    }

    /// Place one record: stage it when it fits the pre-commit buffer,
    /// otherwise write it to the segment directly, flushing staged bytes
    /// first and rotating wherever `unit_limit` is crossed.
    fn append(&mut self, header: &[u8], payload: &[u8]) -> Result<()> {
        let total = header.len() + payload.len();
        loop {
            self.ensure_segment()?;
            let outcome = {
                let Some(data) = self.data.as_ref() else {
                    return Err(Error::new(ErrorKind::FileOpen));
                };
                let _lock = data.lock().map_kind(ErrorKind::Lock)?;

                let capacity = self.pre_commit.capacity();
                let mut current_offset = 0u64;
                let mut segment_full = false;
                if self.pre_commit.staged() + total > capacity {
                    current_offset = data.size().map_kind(ErrorKind::FileSeek)?;
                    if self.unit_limit() <= current_offset {
                        segment_full = true;
                    } else {
                        let staged = self.pre_commit.staged_bytes();
                        data.pwrite(staged, current_offset)
                            .map_kind(ErrorKind::FileWrite)?;
                        current_offset += staged.len() as u64;
                        self.pre_commit.reset();
                    }
                }

                if segment_full {
                    Outcome::Retry
                } else {
                    if total <= capacity {
                        // Within-buffer staging; the data-file lock we hold
                        // is what makes this single-writer.
                        self.pre_commit.stage(&[header, payload]);
                    } else {
                        data.pwritev(&[header, payload], current_offset)
                            .map_kind(ErrorKind::FileWrite)?;
                        current_offset += total as u64;
                    }
                    if self.unit_limit() <= current_offset {
                        Outcome::Rotate
                    } else {
                        Outcome::Done
                    }
                }
            };

            match outcome {
                Outcome::Done => return Ok(()),
                Outcome::Rotate => {
                    self.close_segment();
                    self.rotate()?;
                    return Ok(());
                }
                Outcome::Retry => {
                    self.close_segment();
                    self.rotate()?;
                }
            }
        }
    }

    /// Write the staged bytes to the segment, rotating first if it is
    /// already full and after, if the flush crossed the limit.
    fn flush_staged(&mut self) -> Result<()> {
        if self.pre_commit.capacity() == 0 {
            return Ok(());
        }
        loop {
            self.ensure_segment()?;
            let outcome = {
                let Some(data) = self.data.as_ref() else {
                    return Err(Error::new(ErrorKind::FileOpen));
                };
                let _lock = data.lock().map_kind(ErrorKind::Lock)?;

                let mut current_offset = data.size().map_kind(ErrorKind::FileSeek)?;
                if self.unit_limit() <= current_offset {
                    Outcome::Retry
                } else {
                    let staged = self.pre_commit.staged_bytes();
                    data.pwrite(staged, current_offset)
                        .map_kind(ErrorKind::FileWrite)?;
                    current_offset += staged.len() as u64;
                    self.pre_commit.reset();
                    if self.unit_limit() <= current_offset {
                        Outcome::Rotate
                    } else {
                        Outcome::Done
                    }
                }
            };

            match outcome {
                Outcome::Done => return Ok(()),
                Outcome::Rotate => {
                    self.close_segment();
                    self.rotate()?;
                    return Ok(());
                }
                Outcome::Retry => {
                    self.close_segment();
                    self.rotate()?;
                }
            }
        }
    }
}

impl Drop for WriterIo {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush_staged() {
            warn!("failed to flush pre-commit buffer on close: {e}");
        }
        self.close_segment();
    }
}
