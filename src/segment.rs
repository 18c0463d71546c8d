//! Segment records: header layout, datafile inspection and repair.
//!
//! A segment is a concatenation of records, each a fixed-size header
//! followed by the payload bytes. The header's `reserved` field carries the
//! log's magic tag, which doubles as the compressed/uncompressed
//! discriminator. All fields are little-endian on disk.

use std::cmp;

use log::{debug, warn};

use crate::compress::{self, Codec};
use crate::error::{Error, ErrorKind, IoResultExt as _, Result};
use crate::fileio::LogFile;

/// Magic tag of uncompressed segments.
pub(crate) const MAGIC_UNCOMPRESSED: u32 = 0x663A_7318;
/// Base of the compressed magic family; the low byte holds the codec id.
pub(crate) const MAGIC_COMPRESSED_BASE: u32 = 0x1510_6A00;

pub(crate) fn is_compressed_magic(magic: u32) -> bool {
    magic & 0xFFFF_FF00 == MAGIC_COMPRESSED_BASE
}

pub(crate) fn is_valid_magic(magic: u32) -> bool {
    magic == MAGIC_UNCOMPRESSED || is_compressed_magic(magic)
}

pub(crate) fn magic_for(codec: Option<Codec>) -> u32 {
    match codec {
        None => MAGIC_UNCOMPRESSED,
        Some(codec) => MAGIC_COMPRESSED_BASE | codec.id() as u32,
    }
}

/// The provider encoded in a compressed magic, or `None` for uncompressed
/// logs.
///
/// Fails with [`ErrorKind::NotSupported`] when the codec id is unknown to
/// this build.
pub(crate) fn provider_for_magic(magic: u32) -> Result<Option<&'static dyn compress::Provider>> {
    if !is_compressed_magic(magic) {
        return Ok(None);
    }
    Codec::from_id((magic & 0xFF) as u8)
        .map(|codec| Some(compress::provider(codec)))
        .ok_or_else(|| Error::new(ErrorKind::NotSupported))
}

/// Which of the two header layouts a log uses; fixed at `init` by the
/// choice of codec.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HeaderShape {
    Plain,
    Compressed,
}

impl HeaderShape {
    pub const MAX_LEN: usize = 20;

    pub fn of_magic(magic: u32) -> Self {
        if is_compressed_magic(magic) {
            HeaderShape::Compressed
        } else {
            HeaderShape::Plain
        }
    }

    pub const fn len(self) -> usize {
        match self {
            HeaderShape::Plain => 16,
            HeaderShape::Compressed => 20,
        }
    }

    /// The number of payload bytes a record occupies on disk.
    pub fn disk_len(self, hdr: &RecordHeader) -> u32 {
        match self {
            HeaderShape::Plain => hdr.mlen,
            HeaderShape::Compressed => hdr.compressed_len,
        }
    }
}

/// One record header. `compressed_len` is only meaningful under
/// [`HeaderShape::Compressed`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct RecordHeader {
    pub reserved: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub mlen: u32,
    pub compressed_len: u32,
}

impl RecordHeader {
    /// Decode a header from `buf`, which must hold at least `shape.len()`
    /// bytes. The copy into owned fields also serves as the alignment
    /// barrier for headers taken out of a memory map.
    pub fn decode(buf: &[u8], shape: HeaderShape) -> Self {
        let field = |i: usize| {
            let mut b = [0; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            reserved: field(0),
            tv_sec: field(1),
            tv_usec: field(2),
            mlen: field(3),
            compressed_len: match shape {
                HeaderShape::Plain => 0,
                HeaderShape::Compressed => field(4),
            },
        }
    }

    /// Encode into a fixed buffer, returning the encoded length.
    pub fn encode(&self, shape: HeaderShape, buf: &mut [u8; HeaderShape::MAX_LEN]) -> usize {
        buf[0..4].copy_from_slice(&self.reserved.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tv_sec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tv_usec.to_le_bytes());
        buf[12..16].copy_from_slice(&self.mlen.to_le_bytes());
        if shape == HeaderShape::Compressed {
            buf[16..20].copy_from_slice(&self.compressed_len.to_le_bytes());
        }
        shape.len()
    }
}

/// Read and decode the record header at `offset`.
pub(crate) fn read_header_at(
    data: &LogFile,
    offset: u64,
    shape: HeaderShape,
) -> std::io::Result<RecordHeader> {
    let mut buf = [0u8; HeaderShape::MAX_LEN];
    data.pread(&mut buf[..shape.len()], offset)?;
    Ok(RecordHeader::decode(&buf, shape))
}

/// Linear scan of a segment, checking every record's magic and bounds.
///
/// Returns `true` if the segment is damaged.
pub(crate) fn inspect_datafile(data: &LogFile, shape: HeaderShape, magic: u32) -> Result<bool> {
    let len = data.size().map_kind(ErrorKind::FileSeek)?;
    let hdr_len = shape.len() as u64;

    let mut off = 0;
    while off + hdr_len <= len {
        let hdr = read_header_at(data, off, shape).map_kind(ErrorKind::FileRead)?;
        if hdr.reserved != magic {
            return Ok(true);
        }
        let next = off + hdr_len + shape.disk_len(&hdr) as u64;
        if next > len {
            return Ok(true);
        }
        off = next;
    }
    // Trailing bytes too short to hold a header are damage too.
    Ok(off != len)
}

/// Excise invalid byte ranges from a segment.
///
/// With the segment locked, walks the file record by record. Where a header
/// is invalid (bad magic, or a length running past end of file), scans
/// forward byte by byte for a position that both looks like a valid header
/// *and* is followed by another valid header; requiring two consecutive
/// headers keeps payload bytes that happen to contain the magic from being
/// mistaken for a record boundary. The byte ranges in between are tagged
/// invalid, the survivors are slid down in 4 KiB chunks, and the file is
/// truncated to the compacted length.
///
/// Returns the number of invalid ranges excised.
pub(crate) fn repair_datafile(data: &LogFile, shape: HeaderShape, magic: u32) -> Result<usize> {
    let _lock = data.lock().map_kind(ErrorKind::Lock)?;

    let orig_len = data.size().map_kind(ErrorKind::FileSeek)?;
    if orig_len == 0 {
        return Ok(0);
    }
    let map = data.map_read().map_kind(ErrorKind::FileRead)?;

    let hdr_len = shape.len() as i64;
    let end = map.len() as i64;
    let header_at = |off: i64| RecordHeader::decode(&map[off as usize..], shape);

    let mut invalid: Vec<(i64, i64)> = Vec::new();
    // Walk as if a zero-length valid record preceded offset 0, so a bad
    // header right at the start falls into the resynchronization arm.
    let mut this: i64 = -hdr_len;
    let mut cur = RecordHeader {
        reserved: magic,
        ..RecordHeader::default()
    };

    while this + hdr_len <= end {
        let next = this + hdr_len + shape.disk_len(&cur) as i64;
        if next > 0 && next == end {
            this = next;
            break;
        }
        if next > 0 && next + hdr_len <= end {
            let hdr = header_at(next);
            if hdr.reserved == magic {
                cur = hdr;
                this = next;
                continue;
            }
        }

        // Resynchronize: find a candidate header followed by a second one.
        let mut cand = this + hdr_len;
        let mut resynced = None;
        while cand + hdr_len <= end {
            let hdr = header_at(cand);
            if hdr.reserved == magic {
                let after = cand + hdr_len + shape.disk_len(&hdr) as i64;
                if after == end {
                    resynced = Some((cand, after, hdr));
                    break;
                }
                if after > 0 && after + hdr_len <= end {
                    let hdr2 = header_at(after);
                    if hdr2.reserved == magic {
                        resynced = Some((cand, after, hdr2));
                        break;
                    }
                }
            }
            cand += 1;
        }

        if this < 0 {
            this = 0;
        }
        let Some((cand, after, hdr)) = resynced else {
            break;
        };
        if cand > this {
            invalid.push((this, cand));
        }
        this = after;
        cur = hdr;
    }
    if this != end {
        if this < 0 {
            this = 0;
        }
        invalid.push((this, end));
    }

    drop(map);

    if !invalid.is_empty() {
        warn!("excising {} invalid range(s)", invalid.len());
        let mut buf = [0u8; 4096];
        let mut dst = invalid[0].0 as u64;
        for (i, range) in invalid.iter().enumerate() {
            let src_end = invalid.get(i + 1).map(|r| r.0).unwrap_or(end) as u64;
            let mut src = range.1 as u64;
            while src < src_end {
                let chunk = cmp::min(buf.len() as u64, src_end - src) as usize;
                data.pread(&mut buf[..chunk], src)
                    .map_kind(ErrorKind::FileRead)?;
                data.pwrite(&buf[..chunk], dst)
                    .map_kind(ErrorKind::FileWrite)?;
                src += chunk as u64;
                dst += chunk as u64;
            }
        }
        debug!("compacted segment from {orig_len} to {dst} bytes");
        data.truncate(dst).map_kind(ErrorKind::FileWrite)?;
    }

    Ok(invalid.len())
}
