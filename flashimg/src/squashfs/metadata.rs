//! Metadata streams: SquashFS's unit of compressed metadata.
//!
//! A metadata block is a 2-byte header (top bit: uncompressed flag; low 15 bits: on-disk
//! payload length) followed by that many bytes, decompressing to at most 8 KiB. The inode
//! table, directory table, fragment table, and id table are all concatenations of these
//! blocks; lookup tables (id/fragment) are additionally indirected through an array of
//! 64-bit pointers to the first block of each chunk.

use std::io::{Read, Seek, SeekFrom};

use tracing::trace;

use crate::error::ImageError;
use crate::reader::{read_u16, read_u64, Endian};
use crate::squashfs::compressor;
use crate::squashfs::superblock::SuperBlock;

/// Target decompressed capacity of a single metadata block.
pub const MAX_SIZE: usize = 0x2000;

const UNCOMPRESSED_BIT: u16 = 1 << 15;

/// Reads and decompresses one metadata block at the reader's current position, leaving the
/// cursor positioned right after it.
pub fn read_block<R: Read>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Vec<u8>, ImageError> {
    let header = read_u16(r, endian)?;
    let compressed = header & UNCOMPRESSED_BIT == 0;
    let len = (header & !UNCOMPRESSED_BIT) as usize;
    trace!(compressed, len, "reading squashfs metadata block");

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;

    if compressed {
        compressor::decompress(sb.compressor, &buf, MAX_SIZE)
    } else {
        Ok(buf)
    }
}

/// Reads a lookup table (id table or fragment table): `entry_count` 64-bit pointers stored
/// starting at `seek`, each pointing to exactly one metadata block. The blocks are
/// decompressed and concatenated in array order, yielding the table's full decoded content.
///
/// Unlike the inode/directory tables, a lookup table's blocks are not guaranteed contiguous
/// on disk -- the on-disk offset array is the only authority on where each block lives.
pub fn read_lookup_table<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    seek: u64,
    endian: Endian,
    entry_count: u64,
) -> Result<Vec<u8>, ImageError> {
    r.seek(SeekFrom::Start(seek))?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        offsets.push(read_u64(r, endian)?);
    }

    let mut out = Vec::with_capacity(offsets.len() * MAX_SIZE);
    for offset in offsets {
        r.seek(SeekFrom::Start(offset))?;
        out.extend(read_block(r, sb, endian)?);
    }
    Ok(out)
}
