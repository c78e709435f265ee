//! SquashFS decompressor registry (read side only).
//!
//! The codec id space is closed and small, so it is modelled as an exhaustive `deku`
//! tagged enum rather than a table of trait objects -- matching how the id itself is
//! encoded on disk as a `u16` right after the superblock's fixed fields.

use std::io::Read;

use deku::prelude::*;
use tracing::trace;

use crate::error::ImageError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(id_type = "u16")]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo = 3,
    #[default]
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

/// Decompress `bytes` (a single compressed block/fragment/metadata payload) produced by
/// `compressor`, targeting roughly `expected_size` bytes of output.
pub fn decompress(
    compressor: Compressor,
    bytes: &[u8],
    expected_size: usize,
) -> Result<Vec<u8>, ImageError> {
    trace!(?compressor, input_len = bytes.len(), expected_size, "decompressing squashfs block");
    let mut out = Vec::with_capacity(expected_size);
    match compressor {
        Compressor::None => out.extend_from_slice(bytes),
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = flate2::read::ZlibDecoder::new(bytes);
            decoder.read_to_end(&mut out)?;
        }
        #[cfg(feature = "xz")]
        Compressor::Xz => {
            let mut decoder = xz2::read::XzDecoder::new(bytes);
            decoder.read_to_end(&mut out)?;
        }
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            out.resize(expected_size.max(bytes.len() * 8), 0);
            let (decompressed, status) = rust_lzo::LZOContext::decompress_to_slice(bytes, &mut out);
            let len = decompressed.len();
            out.truncate(len);
            if status != rust_lzo::LZOError::OK {
                return Err(ImageError::Format("lzo decompression failed"));
            }
        }
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new()
                .map_err(|_| ImageError::Format("zstd decompressor init failed"))?;
            decoder
                .decompress_to_buffer(bytes, &mut out)
                .map_err(|_| ImageError::Format("zstd decompression failed"))?;
        }
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            out.resize(expected_size, 0);
            let len = lz4_flex::decompress_into(bytes, &mut out)
                .map_err(|_| ImageError::Format("lz4 decompression failed"))?;
            out.truncate(len);
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(ImageError::UnsupportedCompression { id: other as u32 });
        }
    }
    Ok(out)
}
