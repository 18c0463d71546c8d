//! The metastore: one 16-byte file holding the log's persistent parameters
//! and the current segment number.
//!
//! Layout, all fields little-endian u32: `storage_log`, `unit_limit`,
//! `safety`, `hdr_magic`. Logs written before the magic was introduced have
//! a 12-byte metastore; those are extended in place on first restore.

use std::io;

use log::{debug, warn};
use memmap2::{Mmap, MmapMut};

use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;
use crate::repo::Repo;
use crate::segment;
use crate::Safety;

pub(crate) const META_LEN: u64 = 16;
const LEGACY_META_LEN: u64 = 12;

pub(crate) const DEFAULT_UNIT_LIMIT: u32 = 4 * 1024 * 1024;

/// A decoded metastore record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MetaInfo {
    pub storage_log: u32,
    pub unit_limit: u32,
    pub safety: u32,
    pub hdr_magic: u32,
}

impl MetaInfo {
    pub fn decode(buf: &[u8; META_LEN as usize]) -> Self {
        let field = |i: usize| {
            let mut b = [0; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            storage_log: field(0),
            unit_limit: field(1),
            safety: field(2),
            hdr_magic: field(3),
        }
    }

    pub fn encode(&self) -> [u8; META_LEN as usize] {
        let mut buf = [0; META_LEN as usize];
        buf[0..4].copy_from_slice(&self.storage_log.to_le_bytes());
        buf[4..8].copy_from_slice(&self.unit_limit.to_le_bytes());
        buf[8..12].copy_from_slice(&self.safety.to_le_bytes());
        buf[12..16].copy_from_slice(&self.hdr_magic.to_le_bytes());
        buf
    }

    /// Field-wise validation against a repair candidate.
    ///
    /// Starts from defaults with `storage_log = latest`, keeps every field
    /// of `self` that validates, and reports whether all of them did.
    pub fn validate_into(&self, latest: u32) -> (bool, MetaInfo) {
        let mut out = MetaInfo {
            storage_log: latest,
            unit_limit: DEFAULT_UNIT_LIMIT,
            safety: Safety::AlmostSafe as u32,
            hdr_magic: segment::MAGIC_UNCOMPRESSED,
        };
        let mut valid = true;

        if segment::is_valid_magic(self.hdr_magic) {
            out.hdr_magic = self.hdr_magic;
        } else {
            valid = false;
        }
        if self.unit_limit > 0 {
            out.unit_limit = self.unit_limit;
        } else {
            valid = false;
        }
        if Safety::from_u32(self.safety).is_some() {
            out.safety = self.safety;
        } else {
            valid = false;
        }
        if self.storage_log != latest {
            valid = false;
        }
        (valid, out)
    }
}

#[derive(Debug)]
enum MetaMap {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl MetaMap {
    fn bytes(&self) -> &[u8] {
        match self {
            MetaMap::ReadOnly(m) => m,
            MetaMap::ReadWrite(m) => m,
        }
    }
}

/// Handle on a log's metastore. Writers restore it read/write and mutate it
/// through the mapping; readers restore it read-only and observe the
/// writer's updates through the shared page cache.
#[derive(Debug)]
pub(crate) struct Metastore {
    file: LogFile,
    map: Option<MetaMap>,
}

impl Metastore {
    /// Open the metastore file, creating it when `create` is set.
    pub fn open(repo: &Repo, create: bool) -> io::Result<Self> {
        let path = repo.metastore_path();
        let file = if create {
            LogFile::create(&path, repo.file_mode(), repo.locking())?
        } else {
            LogFile::open(&path, repo.file_mode(), repo.locking())?
        };
        Ok(Self { file, map: None })
    }

    /// Write a fresh metastore record, bypassing the mapping. Used by
    /// `init` before anything is mapped.
    pub fn write_initial(&self, info: MetaInfo) -> Result<()> {
        self.file
            .pwrite(&info.encode(), 0)
            .map_kind(ErrorKind::FileWrite)?;
        if info.safety == Safety::Safe as u32 {
            self.file.sync().map_kind(ErrorKind::FileWrite)?;
        }
        Ok(())
    }

    /// Validate the on-disk record and map it, repairing it first when it
    /// is malformed. A no-op once mapped.
    pub fn restore(&mut self, repo: &Repo, read_only: bool) -> Result<()> {
        if self.map.is_some() {
            return Ok(());
        }
        let _lock = self.file.lock().map_kind(ErrorKind::Lock)?;

        let mut len = self.file.size().map_kind(ErrorKind::MetaOpen)?;
        if len == LEGACY_META_LEN {
            // Pre-magic format: extend with a zeroed hdr_magic, then let
            // repair settle the default.
            debug!("extending legacy 12-byte metastore");
            self.file
                .pwrite(&0u32.to_le_bytes(), LEGACY_META_LEN)
                .map_kind(ErrorKind::MetaOpen)?;
            let latest = latest_segment(repo).map_kind(ErrorKind::MetaOpen)?.unwrap_or(0);
            repair_file(&self.file, latest)?;
            len = META_LEN;
        }

        if len != META_LEN {
            warn!("metastore has invalid size {len}");
            let latest = latest_segment(repo).map_kind(ErrorKind::MetaOpen)?.unwrap_or(0);
            repair_file(&self.file, latest)?;
        } else {
            let mut buf = [0; META_LEN as usize];
            self.file.pread(&mut buf, 0).map_kind(ErrorKind::MetaOpen)?;
            let info = MetaInfo::decode(&buf);
            let (valid, _) = info.validate_into(info.storage_log);
            if !valid {
                warn!("metastore failed validation, rebuilding");
                repair_file(&self.file, info.storage_log)?;
            }
        }

        let map = if read_only {
            MetaMap::ReadOnly(self.file.map_read().map_kind(ErrorKind::Open)?)
        } else {
            MetaMap::ReadWrite(self.file.map_rdwr().map_kind(ErrorKind::Open)?)
        };
        self.map = Some(map);
        Ok(())
    }

    /// Flush the mapped record per the safety level. Readers must not call
    /// this.
    pub fn save(&mut self, already_locked: bool) -> Result<()> {
        let _lock = if already_locked {
            None
        } else {
            Some(self.file.lock().map_kind(ErrorKind::Lock)?)
        };
        match &self.map {
            Some(MetaMap::ReadWrite(map)) => {
                let res = if self.field(2) == Safety::Safe as u32 {
                    map.flush()
                } else {
                    map.flush_async()
                };
                res.map_kind(ErrorKind::FileWrite)
            }
            Some(MetaMap::ReadOnly(_)) | None => Err(Error::new(ErrorKind::IllegalWrite)),
        }
    }

    pub fn lock(&self) -> Result<crate::fileio::FileLock> {
        self.file.lock().map_kind(ErrorKind::Lock)
    }

    fn field(&self, i: usize) -> u32 {
        self.map
            .as_ref()
            .and_then(|m| m.bytes().get(i * 4..i * 4 + 4))
            .map(|b| {
                let mut buf = [0; 4];
                buf.copy_from_slice(b);
                u32::from_le_bytes(buf)
            })
            .unwrap_or(0)
    }

    fn set_field(&mut self, i: usize, value: u32) {
        if let Some(MetaMap::ReadWrite(map)) = &mut self.map {
            map[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn storage_log(&self) -> u32 {
        self.field(0)
    }

    pub fn set_storage_log(&mut self, log: u32) {
        self.set_field(0, log);
    }

    pub fn unit_limit(&self) -> u32 {
        self.field(1)
    }

    pub fn set_unit_limit(&mut self, limit: u32) {
        self.set_field(1, limit);
    }

    pub fn safety(&self) -> Safety {
        Safety::from_u32(self.field(2)).unwrap_or(Safety::AlmostSafe)
    }

    pub fn hdr_magic(&self) -> u32 {
        self.field(3)
    }

    /// Rotation: under the metastore lock, advance `storage_log` and create
    /// the next segment, but only if no other writer got there first.
    /// Returns the shared current segment number and, when this writer did
    /// the increment, the freshly created segment file.
    pub fn atomic_increment(
        &mut self,
        repo: &Repo,
        current_log: u32,
    ) -> Result<(u32, Option<LogFile>)> {
        debug!("atomic increment on {current_log}");
        let guard = self.lock()?;
        let mut created = None;
        if self.storage_log() == current_log {
            let next = current_log + 1;
            created = Some(repo.create_segment(next).map_kind(ErrorKind::FileOpen)?);
            self.set_storage_log(next);
            self.save(true).map_err(|e| {
                // Surface as a metastore failure, as the increment did not
                // take effect.
                match e.kind() {
                    ErrorKind::Lock => e,
                    _ => Error::new(ErrorKind::MetaOpen),
                }
            })?;
        }
        drop(guard);
        // Another writer may have advanced further than we know.
        Ok((self.storage_log(), created))
    }

    /// Open (creating if needed) the segment named by the shared
    /// `storage_log`, under the metastore lock.
    pub fn open_current_segment(&self, repo: &Repo) -> Result<(u32, LogFile)> {
        let _guard = self.lock()?;
        let log = self.storage_log();
        let data = repo.create_segment(log).map_kind(ErrorKind::FileOpen)?;
        Ok((log, data))
    }
}

fn latest_segment(repo: &Repo) -> io::Result<Option<u32>> {
    Ok(repo.storage_bounds()?.map(|(_, latest)| latest))
}

/// Rewrite a malformed metastore in place, keeping whichever fields still
/// validate and defaulting the rest.
fn repair_file(file: &LogFile, latest: u32) -> Result<()> {
    let mut current = MetaInfo {
        storage_log: 0,
        unit_limit: 0,
        safety: u32::MAX,
        hdr_magic: 0,
    };
    let mut buf = [0; META_LEN as usize];
    if file.size().map_kind(ErrorKind::MetaOpen)? >= META_LEN && file.pread(&mut buf, 0).is_ok() {
        current = MetaInfo::decode(&buf);
    }
    let (_, repaired) = current.validate_into(latest);
    warn!(
        "rebuilding metastore: storage_log={:08x} unit_limit={} safety={} hdr_magic={:#x}",
        repaired.storage_log, repaired.unit_limit, repaired.safety, repaired.hdr_magic
    );
    file.truncate(META_LEN).map_kind(ErrorKind::CreateMeta)?;
    file.pwrite(&repaired.encode(), 0)
        .map_kind(ErrorKind::CreateMeta)?;
    Ok(())
}

/// Repair entry point used by directory-level repair: verify the metastore
/// against the latest segment on disk and rebuild it if needed.
pub(crate) fn repair_metastore(repo: &Repo) -> Result<()> {
    let latest = latest_segment(repo).map_kind(ErrorKind::NotDir)?.unwrap_or(0);
    let file = LogFile::create(&repo.metastore_path(), repo.file_mode(), repo.locking())
        .map_kind(ErrorKind::CreateMeta)?;

    let ok = (|| -> io::Result<bool> {
        if file.size()? != META_LEN {
            return Ok(false);
        }
        let mut buf = [0; META_LEN as usize];
        file.pread(&mut buf, 0)?;
        let (valid, _) = MetaInfo::decode(&buf).validate_into(latest);
        Ok(valid)
    })()
    .unwrap_or(false);

    if !ok {
        repair_file(&file, latest)?;
    }
    Ok(())
}

/// Read the metastore without mapping it; used by repair and admin paths.
pub(crate) fn read_info(repo: &Repo) -> Result<MetaInfo> {
    let file = LogFile::open(&repo.metastore_path(), repo.file_mode(), repo.locking())
        .map_kind(ErrorKind::MetaOpen)?;
    let mut buf = [0; META_LEN as usize];
    file.pread(&mut buf, 0).map_kind(ErrorKind::MetaOpen)?;
    Ok(MetaInfo::decode(&buf))
}
