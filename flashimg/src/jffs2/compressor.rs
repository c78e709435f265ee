//! JFFS2 codec dispatch (read side only).

use std::io::Read;

use tracing::trace;

use crate::error::ImageError;
use crate::jffs2::rtime;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Zero = 1,
    Rtime = 2,
    RubinMips = 3,
    Copy = 4,
    DynRubin = 5,
    Zlib = 6,
    Lzo = 7,
    Lzma = 8,
}

impl Compression {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::None,
            1 => Self::Zero,
            2 => Self::Rtime,
            3 => Self::RubinMips,
            4 => Self::Copy,
            5 => Self::DynRubin,
            6 => Self::Zlib,
            7 => Self::Lzo,
            8 => Self::Lzma,
            _ => return None,
        })
    }
}

/// Decompress a node's `csize`-byte payload into `dsize` bytes.
pub fn decompress(id: u8, bytes: &[u8], dsize: u32) -> Result<Vec<u8>, ImageError> {
    let compr = Compression::from_u8(id).ok_or(ImageError::UnsupportedCompression { id: id as u32 })?;
    trace!(?compr, input_len = bytes.len(), dsize, "decompressing jffs2 node data");
    match compr {
        Compression::None | Compression::Copy => Ok(bytes.to_vec()),
        Compression::Zero => Ok(vec![0u8; dsize as usize]),
        Compression::Rtime => rtime::decompress(bytes, dsize),
        #[cfg(feature = "gzip")]
        Compression::Zlib => {
            let mut out = Vec::with_capacity(dsize as usize);
            let mut decoder = flate2::read::ZlibDecoder::new(bytes);
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "lzo")]
        Compression::Lzo => {
            let mut out = vec![0u8; dsize.max(1) as usize];
            let (decompressed, status) = rust_lzo::LZOContext::decompress_to_slice(bytes, &mut out);
            let len = decompressed.len();
            out.truncate(len);
            if status != rust_lzo::LZOError::OK {
                return Err(ImageError::Format("lzo decompression failed"));
            }
            Ok(out)
        }
        // Raw LZMA1 streams (no .xz container) aren't decodable by the xz feature's decoder;
        // like legacy squashfs LZMA blocks, this id is recognised but not implemented.
        #[allow(unreachable_patterns)]
        other => Err(ImageError::UnsupportedCompression { id: other as u8 as u32 }),
    }
}
