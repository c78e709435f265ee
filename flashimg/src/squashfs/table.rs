//! Reads the inode table and directory table into in-memory structures the tree walker can
//! index without re-touching the underlying reader.

use std::io::{Cursor, Read, Seek, SeekFrom};

use deku::prelude::*;
use solana_nohash_hasher::IntMap;
use tracing::trace;

use crate::error::ImageError;
use crate::reader::Endian;
use crate::squashfs::dir::Dir;
use crate::squashfs::inode::Inode;
use crate::squashfs::metadata;
use crate::squashfs::superblock::SuperBlock;

/// Reads every inode between `inode_table` and `dir_table`, keyed by inode number.
///
/// Inode records are not aligned to metadata-block boundaries, so a record can straddle two
/// blocks: when parsing runs out of bytes mid-record, the unconsumed tail is kept and
/// prepended to the next block before parsing resumes.
pub fn read_inode_table<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<IntMap<u32, Inode>, ImageError> {
    r.seek(SeekFrom::Start(sb.inode_table))?;
    let mut inodes = IntMap::default();
    let mut leftover: Vec<u8> = Vec::new();

    while r.stream_position()? < sb.dir_table {
        let block = metadata::read_block(r, sb, endian)?;
        let mut bytes = std::mem::take(&mut leftover);
        bytes.extend(block);

        let mut cursor = Cursor::new(&bytes);
        let mut reader = deku::reader::Reader::new(&mut cursor);
        let mut consumed_bits = reader.bits_read;
        loop {
            match Inode::from_reader_with_ctx(
                &mut reader,
                (sb.bytes_used, sb.block_size, sb.block_log, endian.deku()),
            ) {
                Ok(inode) => {
                    trace!(inode_number = inode.header.inode_number, "parsed inode");
                    inodes.insert(inode.header.inode_number, inode);
                    consumed_bits = reader.bits_read;
                }
                Err(DekuError::Incomplete(_)) => {
                    leftover = bytes[(consumed_bits / 8)..].to_vec();
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(inodes)
}

/// Reads the root inode referenced by the superblock's packed `root_inode` field, which may
/// itself span two metadata blocks.
pub fn read_root_inode<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Inode, ImageError> {
    let (start, offset) = sb.root_inode_location();
    if start > sb.bytes_used {
        return Err(ImageError::Format("root inode offset exceeds bytes_used"));
    }

    r.seek(SeekFrom::Start(sb.inode_table + start))?;
    let mut bytes = metadata::read_block(r, sb, endian)?;

    if (offset as usize) <= bytes.len() {
        if let Ok(inode) = parse_inode_at(&bytes, offset as usize, sb, endian) {
            return Ok(inode);
        }
    }

    // the root inode didn't fully fit in one block; pull in the next and retry once
    let more = metadata::read_block(r, sb, endian)?;
    bytes.extend(more);
    if offset as usize > bytes.len() {
        return Err(ImageError::Format("root inode offset past end of metadata"));
    }
    parse_inode_at(&bytes, offset as usize, sb, endian)
}

fn parse_inode_at(
    bytes: &[u8],
    offset: usize,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Inode, ImageError> {
    let mut cursor = Cursor::new(&bytes[offset..]);
    let mut reader = deku::reader::Reader::new(&mut cursor);
    Inode::from_reader_with_ctx(
        &mut reader,
        (sb.bytes_used, sb.block_size, sb.block_log, endian.deku()),
    )
    .map_err(ImageError::from)
}

/// Reads every metadata block of the directory table, tagging each with its relative offset
/// from `dir_table` (directory inodes reference blocks by this offset).
pub fn read_dir_blocks<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
) -> Result<Vec<(u64, Vec<u8>)>, ImageError> {
    let base = sb.dir_table;
    r.seek(SeekFrom::Start(base))?;

    let end = next_table_start(sb);
    let mut blocks = Vec::new();
    while r.stream_position()? < end {
        let relative = r.stream_position()? - base;
        let block = metadata::read_block(r, sb, endian)?;
        blocks.push((relative, block));
    }
    Ok(blocks)
}

/// The directory table runs up to whichever of the remaining tables comes first on disk (or
/// `bytes_used` if none of them do), since nothing else bounds its length on disk.
fn next_table_start(sb: &SuperBlock) -> u64 {
    [sb.id_table, sb.frag_table, sb.xattr_table, sb.export_table, sb.bytes_used]
        .into_iter()
        .filter(|&v| v > sb.dir_table)
        .min()
        .unwrap_or(sb.bytes_used)
}

/// Reassembles the `Dir` groups covering `[block_index + block_offset, +file_size)` from the
/// pre-read directory blocks. Returns `None` for an empty directory (`file_size <= 3`, just
/// the 3 trailing bytes of a header with no entries).
pub fn dir_from_index(
    dir_blocks: &[(u64, Vec<u8>)],
    block_index: u64,
    file_size: u32,
    block_offset: usize,
    endian: Endian,
) -> Result<Option<Vec<Dir>>, ImageError> {
    if file_size <= 3 {
        return Ok(None);
    }

    let flattened: Vec<u8> =
        dir_blocks.iter().filter(|(rel, _)| *rel >= block_index).flat_map(|(_, b)| b).copied().collect();

    let end = block_offset + (file_size as usize - 3);
    if end > flattened.len() {
        return Err(ImageError::Format("directory entry extends past directory table"));
    }
    let bytes = &flattened[block_offset..end];

    let mut cursor = Cursor::new(bytes);
    let mut reader = deku::reader::Reader::new(&mut cursor);
    let mut dirs = Vec::new();
    while let Ok(dir) = Dir::from_reader_with_ctx(&mut reader, endian.deku()) {
        dirs.push(dir);
    }
    Ok(Some(dirs))
}
