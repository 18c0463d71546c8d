use std::io;

use thiserror::Error;

/// Classification of a failed log operation.
///
/// These are surface codes: they say *which* part of the machinery failed,
/// while the underlying [`io::Error`] (if any) says why. The set mirrors the
/// on-disk state machine: metastore, segment, index, checkpoint and
/// pre-commit failures are distinguished so operators can tell a corrupt
/// index (rebuildable) from a corrupt segment (needs repair).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("log is already initialized")]
    IllegalInit,
    #[error("context is already open")]
    IllegalOpen,
    #[error("cannot open log directory")]
    Open,
    #[error("log path is not a directory")]
    NotDir,
    #[error("log path exceeds the maximum length")]
    CreatePathLen,
    #[error("log directory already exists")]
    CreateExists,
    #[error("cannot create log directory")]
    CreateMkdir,
    #[error("cannot create metastore")]
    CreateMeta,
    #[error("cannot create pre-commit buffer")]
    CreatePreCommit,
    #[error("cannot acquire file lock")]
    Lock,
    #[error("cannot open index")]
    IdxOpen,
    #[error("cannot seek in index")]
    IdxSeek,
    #[error("index is corrupt")]
    IdxCorrupt,
    #[error("cannot write index")]
    IdxWrite,
    #[error("cannot read index")]
    IdxRead,
    #[error("cannot open segment")]
    FileOpen,
    #[error("cannot seek in segment")]
    FileSeek,
    #[error("segment is corrupt")]
    FileCorrupt,
    #[error("cannot read segment")]
    FileRead,
    #[error("cannot write segment")]
    FileWrite,
    #[error("cannot open metastore")]
    MetaOpen,
    #[error("cannot open pre-commit buffer")]
    PreCommitOpen,
    #[error("log is not open for writing")]
    IllegalWrite,
    #[error("log is not open for checkpointing")]
    IllegalCheckpoint,
    #[error("no such subscriber")]
    InvalidSubscriber,
    #[error("log id is out of range")]
    IllegalLogId,
    #[error("subscriber already exists")]
    SubscriberExists,
    #[error("cannot update checkpoint")]
    Checkpoint,
    #[error("operation not supported")]
    NotSupported,
    #[error("log id names the closing marker of a segment")]
    CloseLogId,
}

/// Error returned by all fallible log operations.
///
/// Carries an [`ErrorKind`] and, where the failure originated in the
/// operating system, the underlying [`io::Error`] from which the OS errno
/// can be recovered via [`Error::os_error`].
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn with_source(kind: ErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    /// The surface code of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The OS errno underlying this error, if the failure came from a
    /// system call.
    pub fn os_error(&self) -> Option<i32> {
        self.source.as_ref().and_then(|e| e.raw_os_error())
    }

    /// The underlying I/O error, if any.
    pub fn io_source(&self) -> Option<&io::Error> {
        self.source.as_ref()
    }

    /// True for a segment-open failure against a segment that does not
    /// exist (any more). Readers use this to skip reclaimed segments.
    pub(crate) fn is_segment_missing(&self) -> bool {
        self.kind == ErrorKind::FileOpen
            && self
                .source
                .as_ref()
                .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches an [`ErrorKind`] to a raw [`io::Result`].
pub(crate) trait IoResultExt<T> {
    fn map_kind(self, kind: ErrorKind) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn map_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::with_source(kind, e))
    }
}
