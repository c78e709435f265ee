//! The id table: a shared pool of uid/gid values referenced by 16-bit indices in inodes.

use std::io::{Read, Seek};

use deku::prelude::*;

use crate::error::ImageError;
use crate::reader::Endian;
use crate::squashfs::metadata;
use crate::squashfs::superblock::SuperBlock;

/// One entry in the id table: a resolved 32-bit uid/gid value.
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Id {
    pub num: u32,
}

/// Reads the id table: `ceil(id_count / 2048)` 64-bit metadata-block offsets at
/// `id_table`, each pointing to a metadata block whose concatenated decompressed content is
/// `id_count` little/big-endian `u32` values.
pub fn read_id_table<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Vec<Id>, ImageError> {
    if sb.id_count == 0 {
        return Ok(Vec::new());
    }
    let entry_count = div_ceil(sb.id_count as u64, (metadata::MAX_SIZE / 4) as u64);
    let bytes = metadata::read_lookup_table(r, sb, sb.id_table, endian, entry_count)?;

    let mut cursor = std::io::Cursor::new(&bytes);
    let mut reader = deku::reader::Reader::new(&mut cursor);
    let mut ids = Vec::with_capacity(sb.id_count as usize);
    for _ in 0..sb.id_count {
        ids.push(Id::from_reader_with_ctx(&mut reader, endian.deku())?);
    }
    Ok(ids)
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
