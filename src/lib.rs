//! A journaled, multi-reader, append-only message log stored as a
//! directory of segment files.
//!
//! One writer appends opaque byte messages; any number of named
//! *subscribers* consume them independently, each from its own persisted
//! checkpoint. Segments are reclaimed automatically once every subscriber
//! has acknowledged past them, so the log survives producer and consumer
//! restarts and crashes without unbounded growth.
//!
//! ```no_run
//! use seglog::{Log, Position};
//!
//! # fn main() -> seglog::Result<()> {
//! let log = Log::new("/var/spool/events");
//! log.init()?;
//! log.add_subscriber("billing", Position::Begin)?;
//!
//! let mut writer = log.open_writer()?;
//! writer.write(b"hello")?;
//! writer.close()?;
//!
//! let mut reader = log.open_reader("billing")?;
//! let interval = reader.read_interval()?;
//! let mut id = interval.first;
//! for _ in 0..interval.count {
//!     let message = reader.read_message(id)?;
//!     println!("{}: {} bytes", id, message.payload.len());
//!     id.marker += 1;
//! }
//! reader.read_checkpoint(interval.last)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! The library is blocking and OS-threaded. Within a process, [`Writer`]
//! and [`Reader`] methods take `&mut self`; across processes, whole-file
//! advisory locks serialize the metastore, segment appends, index
//! resyncs and checkpoint updates (disable with
//! [`Log::set_multi_process`] for single-process logs). The lock order is
//! metastore, then segment, then index, then checkpoint; the pre-commit
//! buffer is only touched under the segment lock.
//!
//! The optional pre-commit buffer ([`Log::set_pre_commit_buffer_size`])
//! batches appends before they become visible to readers and is only
//! coherent with a **single writer process**.
//!
//! # On-disk portability
//!
//! All on-disk integers (record headers, index entries, the metastore and
//! checkpoints) are little-endian, so a log directory can be moved
//! between little-endian hosts. (Index files are derived state and would
//! be rebuilt anyway.)

use std::fmt;

mod checkpoint;
mod compress;
mod fileio;
mod index;
mod log;
mod meta;
mod precommit;
mod reader;
mod repair;
mod repo;
mod segment;
mod writer;

pub mod error;

pub use crate::compress::Codec;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::log::Log;
pub use crate::reader::{Message, MessageHeader, Reader};
pub use crate::writer::Writer;

#[cfg(test)]
mod tests;

/// Position of one record: the segment that holds it and its 1-based
/// ordinal within that segment. Marker 0 never names a real record; it is
/// the position "before the first record".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LogId {
    pub log: u32,
    pub marker: u32,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.log, self.marker)
    }
}

/// The marker range a subscriber may read, as reported by
/// [`Reader::read_interval`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval {
    /// Number of readable records; zero when the subscriber is caught up.
    pub count: u32,
    /// First readable position (meaningful only when `count > 0`).
    pub first: LogId,
    /// Last readable position; acknowledge it with
    /// [`Reader::read_checkpoint`] once consumed.
    pub last: LogId,
}

/// Durability policy, persisted in the metastore.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Safety {
    /// Never sync; fastest, loses the tail on power failure.
    Unsafe = 0,
    /// Sync the metastore only.
    #[default]
    AlmostSafe = 1,
    /// Also sync segment data and checkpoints on every update.
    Safe = 2,
}

impl Safety {
    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Safety::Unsafe),
            1 => Some(Safety::AlmostSafe),
            2 => Some(Safety::Safe),
            _ => None,
        }
    }
}

/// How readers fetch record bytes from a segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadMethod {
    /// Map the segment and hand out payload slices without copying.
    #[default]
    Mmap,
    /// Positional reads into reader-owned buffers.
    Pread,
}

/// Where a new subscriber starts consuming.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Position {
    /// At the oldest retained record.
    Begin,
    /// Just past the newest currently visible record.
    End,
}

/// Settings for a [`Log`]. Most are only effective when the log is
/// initialized; afterwards the metastore is authoritative.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Segment size limit in bytes; a segment that reaches it is frozen
    /// and a new one started.
    pub unit_limit: u32,
    /// Durability policy.
    pub safety: Safety,
    /// Per-record compression codec, or `None` for raw records.
    pub codec: Option<Codec>,
    /// Read strategy.
    pub read_method: ReadMethod,
    /// Pre-commit staging buffer size. `None` leaves whatever the log
    /// already has; `Some(0)` disables it.
    pub pre_commit_size: Option<usize>,
    /// Use file locks so several processes can share the log.
    pub multi_process: bool,
    /// Mode bits for created files.
    pub file_mode: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            unit_limit: 4 * 1024 * 1024,
            safety: Safety::AlmostSafe,
            codec: None,
            read_method: ReadMethod::Mmap,
            pre_commit_size: None,
            multi_process: true,
            file_mode: 0o640,
        }
    }
}
