//! [`Log`]: configuration plus the administrative surface of one log
//! directory.
//!
//! A `Log` is cheap to construct and holds no file handles. `init` creates
//! the directory and metastore; `open_writer`/`open_reader` produce the
//! role-specific handles; subscriber management, repair and cleanup work
//! directly against the directory.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt as _;
use std::path::{Path, PathBuf};

use crate::checkpoint;
use crate::compress::Codec;
use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::meta::{self, MetaInfo, Metastore};
use crate::reader::Reader;
use crate::repair;
use crate::repo::Repo;
use crate::segment;
use crate::writer::Writer;
use crate::{LogId, Options, Position, ReadMethod, Safety};

pub struct Log {
    path: PathBuf,
    opts: Options,
}

impl Log {
    /// A handle on the log directory at `path`, with default [`Options`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, Options::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, opts: Options) -> Self {
        Self {
            path: path.into(),
            opts,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Mutate settings before `init`/`open_*`. Settings only affect the
    /// on-disk state at `init`; afterwards the metastore is authoritative.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.opts
    }

    /// Compress records with the default codec (LZ4). Effective at `init`
    /// only; an existing log keeps the codec it was created with.
    pub fn set_use_compression(&mut self, on: bool) -> &mut Self {
        self.opts.codec = on.then_some(Codec::Lz4);
        self
    }

    pub fn set_codec(&mut self, codec: Codec) -> &mut Self {
        self.opts.codec = Some(codec);
        self
    }

    /// The segment size limit for a log created by `init`. For an already
    /// initialized log use [`Writer::alter_journal_size`].
    pub fn set_journal_size(&mut self, bytes: u32) -> &mut Self {
        self.opts.unit_limit = bytes;
        self
    }

    pub fn set_safety(&mut self, safety: Safety) -> &mut Self {
        self.opts.safety = safety;
        self
    }

    pub fn set_read_method(&mut self, method: ReadMethod) -> &mut Self {
        self.opts.read_method = method;
        self
    }

    /// Size the pre-commit staging buffer. Only safe with a single writer
    /// process; see the crate docs. `Some(0)` disables an existing buffer.
    pub fn set_pre_commit_buffer_size(&mut self, bytes: usize) -> &mut Self {
        self.opts.pre_commit_size = Some(bytes);
        self
    }

    /// Disable file locking for logs never shared between processes.
    pub fn set_multi_process(&mut self, on: bool) -> &mut Self {
        self.opts.multi_process = on;
        self
    }

    pub fn set_file_mode(&mut self, mode: u32) -> &mut Self {
        self.opts.file_mode = mode;
        self
    }

    fn repo(&self) -> Repo {
        Repo::new(self.path.clone(), self.opts.file_mode, self.opts.multi_process)
    }

    /// Create the log directory and write a fresh metastore from the
    /// current options.
    pub fn init(&self) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(_) => return Err(Error::new(ErrorKind::CreateExists)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::with_source(ErrorKind::CreateExists, e)),
        }

        // Directories need execute wherever the file mode grants read.
        let mut dir_mode = self.opts.file_mode;
        if dir_mode & 0o400 != 0 {
            dir_mode |= 0o100;
        }
        if dir_mode & 0o040 != 0 {
            dir_mode |= 0o010;
        }
        if dir_mode & 0o004 != 0 {
            dir_mode |= 0o001;
        }
        fs::DirBuilder::new()
            .mode(dir_mode)
            .create(&self.path)
            .map_kind(ErrorKind::CreateMkdir)?;

        let repo = self.repo();
        let metastore = Metastore::open(&repo, true).map_kind(ErrorKind::CreateMeta)?;
        metastore
            .write_initial(MetaInfo {
                storage_log: 0,
                unit_limit: self.opts.unit_limit,
                safety: self.opts.safety as u32,
                hdr_magic: segment::magic_for(self.opts.codec),
            })
            .map_err(|e| match e.kind() {
                ErrorKind::Lock => e,
                _ => Error::new(ErrorKind::CreateMeta),
            })
    }

    /// Open this log for appending.
    pub fn open_writer(&self) -> Result<Writer> {
        Writer::open(&self.path, &self.opts)
    }

    /// Open this log for reading as `subscriber`, which must have been
    /// added first.
    pub fn open_reader(&self, subscriber: &str) -> Result<Reader> {
        Reader::open(&self.path, &self.opts, subscriber)
    }

    /// Register a subscriber, starting at the oldest retained record
    /// ([`Position::Begin`]) or just past the newest visible one
    /// ([`Position::End`]).
    pub fn add_subscriber(&self, name: &str, whence: Position) -> Result<()> {
        let repo = self.repo();
        checkpoint::create_exclusive(&repo, name)?;
        let safety = self.stored_safety(&repo);
        match whence {
            Position::Begin => {
                let first = self.first_log_id()?;
                checkpoint::write(&repo, name, first, safety)
            }
            Position::End => {
                let info = meta::read_info(&repo)?;
                checkpoint::write(
                    &repo,
                    name,
                    LogId {
                        log: info.storage_log,
                        marker: 0,
                    },
                    safety,
                )?;
                // Walk a throwaway reader to the end of the visible log.
                let mut reader = self.open_reader(name)?;
                let interval = reader.read_interval()?;
                checkpoint::write(&repo, name, interval.last, safety)
            }
        }
    }

    /// Drop a subscriber. Returns `false` if there was none by that name.
    /// Segments the subscriber was holding back are reclaimed by the next
    /// checkpoint sweep.
    pub fn remove_subscriber(&self, name: &str) -> Result<bool> {
        checkpoint::remove(&self.repo(), name)
    }

    pub fn get_checkpoint(&self, name: &str) -> Result<LogId> {
        checkpoint::read(&self.repo(), name)
    }

    /// Forcibly position a subscriber's checkpoint, creating the
    /// subscriber if needed.
    pub fn set_subscriber_checkpoint(&self, name: &str, id: LogId) -> Result<()> {
        match self.add_subscriber(name, Position::Begin) {
            Err(e) if e.kind() != ErrorKind::SubscriberExists => return Err(e),
            _ => {}
        }
        let repo = self.repo();
        let safety = self.stored_safety(&repo);
        checkpoint::write(&repo, name, id, safety)
    }

    /// Register `to` with `from`'s current checkpoint.
    pub fn copy_checkpoint(&self, from: &str, to: &str) -> Result<()> {
        let repo = self.repo();
        let id = checkpoint::read(&repo, from)?;
        match self.add_subscriber(to, Position::Begin) {
            Err(e) if e.kind() != ErrorKind::SubscriberExists => return Err(e),
            _ => {}
        }
        checkpoint::write(&repo, to, id, self.stored_safety(&repo))
    }

    pub fn list_subscribers(&self) -> Result<Vec<String>> {
        checkpoint::list(&self.repo())
    }

    /// The id of the oldest retained segment, at marker 0.
    pub fn first_log_id(&self) -> Result<LogId> {
        let logs = self.repo().existing_logs().map_kind(ErrorKind::Open)?;
        Ok(LogId {
            log: logs.first().copied().unwrap_or(0),
            marker: 0,
        })
    }

    /// Heal the directory: rebuild a malformed metastore, clamp checkpoints
    /// into the live segment range, and (when `aggressive`) scrub damaged
    /// segments and discard their indexes.
    pub fn repair(&self, aggressive: bool) -> Result<()> {
        repair::repair(&self.repo(), aggressive)
    }

    /// Unlink every segment below the earliest subscriber checkpoint.
    /// Returns the number of segments removed.
    pub fn clean(&self) -> Result<usize> {
        let repo = self.repo();
        let (_, earliest) = checkpoint::pending_readers(&repo, 0)?;
        let Some(earliest) = earliest else {
            return Ok(0);
        };
        let mut removed = 0;
        for log in repo.existing_logs().map_kind(ErrorKind::Open)? {
            if log < earliest && repo.remove_segment(log).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn stored_safety(&self, repo: &Repo) -> Safety {
        meta::read_info(repo)
            .ok()
            .and_then(|info| Safety::from_u32(info.safety))
            .unwrap_or(self.opts.safety)
    }
}
