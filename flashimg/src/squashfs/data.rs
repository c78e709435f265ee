//! File data assembly: turning a file inode's block-size list and optional fragment tail
//! into the file's full byte content.

use std::io::{Read, Seek, SeekFrom};

use solana_nohash_hasher::IntMap;

use crate::error::ImageError;
use crate::reader::Endian;
use crate::squashfs::compressor;
use crate::squashfs::fragment::Fragment;
use crate::squashfs::inode::{ResolvedFile, NO_FRAGMENT};
use crate::squashfs::superblock::SuperBlock;

/// Target decompressed size passed to the codec for data blocks and fragments. Only LZO
/// actually honours this as a bound; the others ignore it and just return what they produce.
const EXPECTED_BLOCK_SIZE: usize = 0x4_0000;

/// Decoded fragment blocks, memoised by their on-disk start offset so that multiple files
/// sharing a fragment block only pay its decompression cost once.
#[derive(Default)]
pub struct Cache {
    fragment_cache: IntMap<u64, Vec<u8>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reassembles a basic/extended file's content from its data blocks and optional fragment.
pub fn read_file<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    endian: Endian,
    file: &ResolvedFile,
    fragments: &[Fragment],
    cache: &mut Cache,
) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::with_capacity(file.file_size as usize);

    r.seek(SeekFrom::Start(file.blocks_start))?;
    for block in &file.block_sizes {
        if block.size() == 0 {
            // sparse hole: materialise zeros instead of reading anything from disk
            out.resize(out.len() + sb.block_size as usize, 0);
            continue;
        }
        let mut buf = vec![0u8; block.size() as usize];
        r.read_exact(&mut buf)?;
        if block.uncompressed() {
            out.extend_from_slice(&buf);
        } else {
            out.extend(compressor::decompress(sb.compressor, &buf, EXPECTED_BLOCK_SIZE)?);
        }
    }

    if file.frag_index != NO_FRAGMENT {
        let fragment = fragments
            .get(file.frag_index as usize)
            .ok_or(ImageError::Format("fragment index out of range"))?;
        let decoded = decode_fragment(r, sb, *fragment, cache)?;
        let remaining = file.file_size as usize - out.len();
        let start = file.block_offset as usize;
        let end = (start + remaining).min(decoded.len());
        if start > decoded.len() {
            return Err(ImageError::Format("fragment block_offset out of range"));
        }
        out.extend_from_slice(&decoded[start..end]);
    }

    out.truncate(file.file_size as usize);
    Ok(out)
}

fn decode_fragment<R: Read + Seek>(
    r: &mut R,
    sb: &SuperBlock,
    fragment: Fragment,
    cache: &mut Cache,
) -> Result<Vec<u8>, ImageError> {
    if let Some(cached) = cache.fragment_cache.get(&fragment.start) {
        return Ok(cached.clone());
    }

    r.seek(SeekFrom::Start(fragment.start))?;
    let mut buf = vec![0u8; fragment.size() as usize];
    r.read_exact(&mut buf)?;

    let decoded = if fragment.is_uncompressed() {
        buf
    } else {
        compressor::decompress(sb.compressor, &buf, EXPECTED_BLOCK_SIZE)?
    };

    cache.fragment_cache.insert(fragment.start, decoded.clone());
    Ok(decoded)
}
