//! Pluggable per-record compression.
//!
//! A log fixes its codec at `init` time; the choice is recorded in the
//! metastore's header magic and looked up here whenever the log is opened.
//! Providers live in a static table indexed by codec id, so two logs with
//! different codecs can coexist in one process.

use crate::error::{Error, ErrorKind, Result};

/// Compression codec identifiers as stored in the low byte of the
/// compressed header magic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Null = 0,
    Lz4 = 1,
}

impl Codec {
    pub(crate) fn id(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Codec::Null),
            1 => Some(Codec::Lz4),
            _ => None,
        }
    }
}

/// A compression provider.
///
/// `decompress` returns the number of bytes produced; zero is legal only
/// when the compressed input was itself empty.
pub(crate) trait Provider: Sync + std::fmt::Debug {
    /// An upper bound on the compressed size of any `n`-byte input.
    fn bound(&self, n: usize) -> usize;

    /// Compress `src` into `dst`, returning the number of bytes written.
    ///
    /// `dst` must be at least `bound(src.len())` bytes.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompress `src` into `dst`, returning the number of bytes produced.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

/// Identity codec: stores records verbatim.
#[derive(Debug)]
struct Null;

impl Provider for Null {
    fn bound(&self, n: usize) -> usize {
        n
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(Error::new(ErrorKind::FileWrite));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

/// LZ4 block codec.
#[derive(Debug)]
struct Lz4;

impl Provider for Lz4 {
    fn bound(&self, n: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(n)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4_flex::block::compress_into(src, dst).map_err(|_| Error::new(ErrorKind::FileWrite))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4_flex::block::decompress_into(src, dst).map_err(|_| Error::new(ErrorKind::FileCorrupt))
    }
}

// Indexed by codec id; ids must stay consecutive.
static PROVIDERS: [&(dyn Provider); 2] = [&Null, &Lz4];

pub(crate) fn provider(codec: Codec) -> &'static dyn Provider {
    PROVIDERS[codec.id() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_round_trip() {
        let p = provider(Codec::Null);
        let src = b"hello, world";
        let mut dst = vec![0; p.bound(src.len())];
        let n = p.compress(src, &mut dst).unwrap();
        assert_eq!(&dst[..n], src);

        let mut out = vec![0; src.len()];
        let m = p.decompress(&dst[..n], &mut out).unwrap();
        assert_eq!(&out[..m], src);
    }

    #[test]
    fn lz4_round_trip() {
        let p = provider(Codec::Lz4);
        let src = vec![42u8; 64 * 1024];
        let mut dst = vec![0; p.bound(src.len())];
        let n = p.compress(&src, &mut dst).unwrap();
        assert!(n < src.len());

        let mut out = vec![0; src.len()];
        let m = p.decompress(&dst[..n], &mut out).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(out, src);
    }

    #[test]
    fn empty_input_decompresses_to_zero_bytes() {
        let p = provider(Codec::Lz4);
        let mut dst = vec![0; p.bound(0)];
        let n = p.compress(&[], &mut dst).unwrap();

        let mut out = [0u8; 0];
        assert_eq!(p.decompress(&dst[..n], &mut out).unwrap(), 0);
    }
}
