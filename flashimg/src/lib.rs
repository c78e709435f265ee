//! Read-only parser and random-access reader for SquashFS and JFFS2 flash filesystem
//! images.
//!
//! ```no_run
//! # use std::fs::File;
//! # use std::io::BufReader;
//! let file = BufReader::new(File::open("root.squashfs").unwrap());
//! let mut image = flashimg::open(file).unwrap().expect("unrecognised image format");
//! let root_entries = image.list("/");
//! let data = image.read("/bin/busybox");
//! ```
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod crc;
mod error;
mod jffs2;
mod reader;
mod squashfs;
mod tree;

use std::io::{Seek, SeekFrom};

use tracing::info;

pub use crate::error::ImageError;
pub use crate::jffs2::Jffs2Image;
pub use crate::reader::{BufReadSeek, Endian, ReaderWithOffset};
pub use crate::squashfs::{Compressor, SquashFsImage, SuperBlock};
pub use crate::tree::{Attrs, Image, NodeKind, StatFs, TreeNode};

/// Opens `reader` as whichever of the two supported formats its leading bytes identify,
/// trying both byte orders for each format's magic. Returns `Ok(None)` when neither format's
/// magic is present at the start of `reader` -- not an error, since a caller may want to
/// probe several readers or fall back to a different handler entirely. A magic match whose
/// subsequent parse fails (bad superblock, truncated node stream, ...) still surfaces as
/// `Err`, since at that point the format has committed to being a match.
pub fn open<R: BufReadSeek + 'static>(mut reader: R) -> Result<Option<Box<dyn Image>>, ImageError> {
    reader.seek(SeekFrom::Start(0))?;
    let mut magic4 = [0u8; 4];
    let enough_for_squashfs = read_prefix(&mut reader, &mut magic4)?;
    reader.seek(SeekFrom::Start(0))?;

    if enough_for_squashfs {
        if magic4 == squashfs::MAGIC {
            info!("detected squashfs image, little-endian");
            return Ok(Some(Box::new(SquashFsImage::open(reader, Endian::Little)?)));
        }
        if magic4 == squashfs::MAGIC_SWAPPED {
            info!("detected squashfs image, big-endian");
            return Ok(Some(Box::new(SquashFsImage::open(reader, Endian::Big)?)));
        }
    }

    let mut magic2 = [0u8; 2];
    let enough_for_jffs2 = read_prefix(&mut reader, &mut magic2)?;
    reader.seek(SeekFrom::Start(0))?;

    if enough_for_jffs2 {
        let magic_le = jffs2::MAGIC.to_le_bytes();
        let magic_be = jffs2::MAGIC.to_be_bytes();
        if magic2 == magic_le {
            info!("detected jffs2 image, little-endian");
            return Ok(Some(Box::new(Jffs2Image::open(reader, Endian::Little)?)));
        }
        if magic2 == magic_be {
            info!("detected jffs2 image, big-endian");
            return Ok(Some(Box::new(Jffs2Image::open(reader, Endian::Big)?)));
        }
    }

    Ok(None)
}

/// Reads as many bytes as are available into `buf`, returning whether it was filled
/// entirely. A file shorter than `buf` can't carry either magic, so that's a clean "no
/// match" rather than an `IoError`.
fn read_prefix<R: std::io::Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, ImageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn unrecognised_magic_returns_none() {
        let data = vec![0u8; 64];
        let result = open(Cursor::new(data)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn short_file_returns_none_not_error() {
        let data = vec![0x85]; // one byte, not even a full jffs2 magic
        let result = open(Cursor::new(data)).unwrap();
        assert!(result.is_none());
    }
}
