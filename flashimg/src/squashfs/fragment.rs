//! The fragment table: tail-block entries shared by files whose last block is smaller than
//! `block_size`, packed together to avoid wasting a full block per small file.

use std::io::{Read, Seek};

use deku::prelude::*;

use crate::error::ImageError;
use crate::reader::Endian;
use crate::squashfs::metadata;
use crate::squashfs::superblock::SuperBlock;

/// Top bit of a fragment entry's size word marks the fragment block as stored uncompressed.
const UNCOMPRESSED_FLAG: u32 = 0x0100_0000;
const SIZE_MASK: u32 = 0x00FF_FFFF;

/// One 16-byte entry in the fragment table.
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Fragment {
    /// Absolute on-disk offset of the fragment block.
    pub start: u64,
    size_and_flag: u32,
    _unused: u32,
}

impl Fragment {
    /// On-disk length of the (possibly compressed) fragment block.
    pub fn size(&self) -> u32 {
        self.size_and_flag & SIZE_MASK
    }

    /// Whether the fragment block is stored uncompressed.
    pub fn is_uncompressed(&self) -> bool {
        self.size_and_flag & UNCOMPRESSED_FLAG != 0
    }
}

/// Reads the fragment table: `ceil(frag_count / 512)` 64-bit metadata-block offsets at
/// `frag_table`, each pointing to a metadata block of packed [`Fragment`] entries.
pub fn read_fragment_table<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Vec<Fragment>, ImageError> {
    if sb.frag_count == 0 {
        return Ok(Vec::new());
    }
    const FRAGMENT_SIZE: u64 = 16;
    let entry_count = div_ceil(
        sb.frag_count as u64,
        (metadata::MAX_SIZE as u64) / FRAGMENT_SIZE,
    );
    let bytes = metadata::read_lookup_table(r, sb, sb.frag_table, endian, entry_count)?;

    let mut cursor = std::io::Cursor::new(&bytes);
    let mut reader = deku::reader::Reader::new(&mut cursor);
    let mut entries = Vec::with_capacity(sb.frag_count as usize);
    for _ in 0..sb.frag_count {
        entries.push(Fragment::from_reader_with_ctx(&mut reader, endian.deku())?);
    }
    Ok(entries)
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flag_and_size() {
        let f = Fragment { start: 0, size_and_flag: UNCOMPRESSED_FLAG | 1234, _unused: 0 };
        assert!(f.is_uncompressed());
        assert_eq!(f.size(), 1234);

        let f = Fragment { start: 0, size_and_flag: 5678, _unused: 0 };
        assert!(!f.is_uncompressed());
        assert_eq!(f.size(), 5678);
    }
}
