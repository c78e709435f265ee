//! Ties the superblock, lookup tables, inode table, and directory table together into an
//! open sequence, and serves the unified read API over the resulting tree.

use std::io::{Read, Seek, SeekFrom};

use deku::prelude::*;
use solana_nohash_hasher::IntMap;
use tracing::info;

use crate::error::ImageError;
use crate::reader::Endian;
use crate::squashfs::data::{self, Cache};
use crate::squashfs::fragment::{self, Fragment};
use crate::squashfs::id::{self, Id};
use crate::squashfs::inode::{Inode, InodeId, InodeInner, ResolvedFile};
use crate::squashfs::superblock::SuperBlock;
use crate::squashfs::table;
use crate::tree::{Attrs, Image, NodeKind, StatFs, TreeNode};

/// File-type POSIX mode bits, `OR`'d with an inode's stored permissions to build `st_mode`.
mod mode_bits {
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
}

pub struct SquashFsImage<R> {
    reader: R,
    sb: SuperBlock,
    endian: Endian,
    ids: Vec<Id>,
    fragments: Vec<Fragment>,
    inodes: IntMap<u32, Inode>,
    root: TreeNode,
    cache: Cache,
}

impl<R: Read + Seek> SquashFsImage<R> {
    pub fn open(mut reader: R, endian: Endian) -> Result<Self, ImageError> {
        let total_length = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut header_reader = deku::reader::Reader::new(&mut reader);
        let sb = SuperBlock::from_reader_with_ctx(&mut header_reader, endian.deku())?;
        sb.validate(total_length)?;
        info!(?endian, inode_count = sb.inode_count, "opened squashfs superblock");

        let ids = id::read_id_table(&mut reader, &sb, endian)?;
        let fragments = fragment::read_fragment_table(&mut reader, &sb, endian)?;
        let inodes = table::read_inode_table(&mut reader, &sb, endian)?;
        let root_inode = table::read_root_inode(&mut reader, &sb, endian)?;
        let dir_blocks = table::read_dir_blocks(&mut reader, &sb, endian)?;

        let mut root = TreeNode::directory(root_inode.header.inode_number);
        build_tree(&mut root, &root_inode, &inodes, &dir_blocks, endian, root_inode.header.inode_number)?;

        Ok(Self { reader, sb, endian, ids, fragments, inodes, root, cache: Cache::new() })
    }

    fn resolve_file(&self, id: u32) -> Option<ResolvedFile> {
        match &self.inodes.get(&id)?.inner {
            InodeInner::BasicFile(f) => Some(f.into()),
            InodeInner::ExtendedFile(f) => Some(f.into()),
            _ => None,
        }
    }

    fn resolve_id(&self, index: u16) -> u32 {
        self.ids.get(index as usize).map(|i| i.num).unwrap_or(0)
    }
}

/// Recursively expands a basic/extended directory inode into `node`'s children, rejecting an
/// entry that points back at the directory currently being expanded (a self-referential
/// cycle that would otherwise recurse forever).
fn build_tree(
    node: &mut TreeNode,
    dir_inode: &Inode,
    inodes: &IntMap<u32, Inode>,
    dir_blocks: &[(u64, Vec<u8>)],
    endian: Endian,
    expanding: u32,
) -> Result<(), ImageError> {
    let (block_index, file_size, block_offset) = match &dir_inode.inner {
        InodeInner::BasicDirectory(d) => (d.block_index as u64, d.file_size as u32, d.block_offset as usize),
        InodeInner::ExtendedDirectory(d) => (d.block_index as u64, d.file_size, d.block_offset as usize),
        _ => return Err(ImageError::Format("expected a directory inode")),
    };

    let Some(dirs) = table::dir_from_index(dir_blocks, block_index, file_size, block_offset, endian)? else {
        return Ok(());
    };

    for dir in &dirs {
        for entry in &dir.dir_entries {
            let inode_number = entry.inode_number(dir.inode_num);
            if inode_number == expanding {
                return Err(ImageError::Format("self-referential directory entry"));
            }
            let name = entry.name()?;
            let found = inodes
                .get(&inode_number)
                .ok_or(ImageError::Format("directory entry references unknown inode"))?;

            let child = match entry.t {
                InodeId::BasicDirectory | InodeId::ExtendedDirectory => {
                    let mut child = TreeNode::directory(inode_number);
                    build_tree(&mut child, found, inodes, dir_blocks, endian, inode_number)?;
                    child
                }
                InodeId::BasicFile | InodeId::ExtendedFile => TreeNode::leaf(NodeKind::File, inode_number),
                InodeId::BasicSymlink => TreeNode::leaf(NodeKind::Symlink, inode_number),
                InodeId::BasicBlockDevice => TreeNode::leaf(NodeKind::BlockDevice, inode_number),
                InodeId::BasicCharacterDevice => TreeNode::leaf(NodeKind::CharDevice, inode_number),
                InodeId::BasicFifo => TreeNode::leaf(NodeKind::Fifo, inode_number),
                InodeId::BasicSocket => TreeNode::leaf(NodeKind::Socket, inode_number),
            };
            node.children.insert(name, child);
        }
    }
    Ok(())
}

impl<R: Read + Seek> Image for SquashFsImage<R> {
    fn list(&self, path: &str) -> Vec<String> {
        match crate::tree::resolve(&self.root, path) {
            Some(node) if node.is_dir() => node.children.keys().cloned().collect(),
            Some(_) => vec![path.rsplit('/').next().unwrap_or(path).to_string()],
            None => Vec::new(),
        }
    }

    fn read(&mut self, path: &str) -> Option<Vec<u8>> {
        let node = crate::tree::resolve(&self.root, path)?;
        if node.kind != NodeKind::File {
            return None;
        }
        let file = self.resolve_file(node.id)?;
        data::read_file(&mut self.reader, &self.sb, self.endian, &file, &self.fragments, &mut self.cache).ok()
    }

    fn stat(&self, path: &str) -> Option<Attrs> {
        let node = crate::tree::resolve(&self.root, path)?;
        let inode = self.inodes.get(&node.id)?;
        let header = &inode.header;
        let base_mode = header.permissions as u32;
        let (type_bits, nlink, size) = match &inode.inner {
            InodeInner::BasicDirectory(d) => (mode_bits::S_IFDIR, d.link_count, 0),
            InodeInner::ExtendedDirectory(d) => (mode_bits::S_IFDIR, d.link_count, 0),
            InodeInner::BasicFile(f) => (mode_bits::S_IFREG, 1, f.file_size as u64),
            InodeInner::ExtendedFile(f) => (mode_bits::S_IFREG, f.link_count, f.file_size),
            InodeInner::BasicSymlink(s) => (mode_bits::S_IFLNK, s.link_count, 0),
            InodeInner::BasicBlockDevice(d) => (mode_bits::S_IFBLK, d.link_count, 0),
            InodeInner::BasicCharacterDevice(d) => (mode_bits::S_IFCHR, d.link_count, 0),
            InodeInner::BasicFifo(i) => (mode_bits::S_IFIFO, i.link_count, 0),
            InodeInner::BasicSocket(i) => (mode_bits::S_IFSOCK, i.link_count, 0),
        };

        Some(Attrs {
            atime: header.mtime,
            ctime: header.mtime,
            mtime: header.mtime,
            uid: self.resolve_id(header.uid),
            gid: self.resolve_id(header.gid),
            mode: base_mode | type_bits,
            nlink,
            size,
            blocks: size.div_ceil(512),
        })
    }

    fn readlink(&self, path: &str) -> Option<String> {
        let node = crate::tree::resolve(&self.root, path)?;
        match &self.inodes.get(&node.id)?.inner {
            InodeInner::BasicSymlink(s) => Some(s.target()),
            _ => None,
        }
    }

    fn statfs(&self) -> StatFs {
        StatFs { block_size: self.sb.block_size, name_max: StatFs::NAME_MAX }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::squashfs::superblock::{MAGIC, NOT_SET};

    const SB_LEN: u32 = 96;

    /// Hand-assembles a minimal, uncompressed, single-file squashfs image: one root
    /// directory (inode 1) containing one regular file (inode 2), with no id, fragment,
    /// xattr, or export tables. Every offset is computed rather than hardcoded so the
    /// layout stays consistent if a section's length changes above.
    fn build_image(content: &[u8]) -> Vec<u8> {
        let mut dir_payload = Vec::new();
        dir_payload.extend_from_slice(&0u32.to_le_bytes()); // count (one entry)
        dir_payload.extend_from_slice(&0u32.to_le_bytes()); // start (unused by this reader)
        dir_payload.extend_from_slice(&1u32.to_le_bytes()); // inode_num (base == root)
        dir_payload.extend_from_slice(&0u16.to_le_bytes()); // entry.offset (unused)
        dir_payload.extend_from_slice(&1i16.to_le_bytes()); // entry.inode_offset (2 - 1)
        dir_payload.extend_from_slice(&2u16.to_le_bytes()); // entry.t = BasicFile
        dir_payload.extend_from_slice(&6u16.to_le_bytes()); // entry.name_size = len("busybox") - 1
        dir_payload.extend_from_slice(b"busybox");
        let dir_file_size = dir_payload.len() as u16 + 3;

        let mut inode_payload = Vec::new();
        inode_payload.extend_from_slice(&1u16.to_le_bytes()); // id: BasicDirectory
        inode_payload.extend_from_slice(&0o755u16.to_le_bytes()); // permissions
        inode_payload.extend_from_slice(&0u16.to_le_bytes()); // uid index
        inode_payload.extend_from_slice(&0u16.to_le_bytes()); // gid index
        inode_payload.extend_from_slice(&0u32.to_le_bytes()); // mtime
        inode_payload.extend_from_slice(&1u32.to_le_bytes()); // inode_number
        inode_payload.extend_from_slice(&0u32.to_le_bytes()); // block_index
        inode_payload.extend_from_slice(&2u32.to_le_bytes()); // link_count
        inode_payload.extend_from_slice(&dir_file_size.to_le_bytes()); // file_size
        inode_payload.extend_from_slice(&0u16.to_le_bytes()); // block_offset
        inode_payload.extend_from_slice(&1u32.to_le_bytes()); // parent_inode (self)

        inode_payload.extend_from_slice(&2u16.to_le_bytes()); // id: BasicFile
        inode_payload.extend_from_slice(&0o644u16.to_le_bytes()); // permissions
        inode_payload.extend_from_slice(&0u16.to_le_bytes()); // uid index
        inode_payload.extend_from_slice(&0u16.to_le_bytes()); // gid index
        inode_payload.extend_from_slice(&0u32.to_le_bytes()); // mtime
        inode_payload.extend_from_slice(&2u32.to_le_bytes()); // inode_number
        inode_payload.extend_from_slice(&SB_LEN.to_le_bytes()); // blocks_start (right after the superblock)
        inode_payload.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // frag_index: NO_FRAGMENT
        inode_payload.extend_from_slice(&0u32.to_le_bytes()); // block_offset
        inode_payload.extend_from_slice(&(content.len() as u32).to_le_bytes()); // file_size
        let block_size_word: u32 = (1 << 24) | content.len() as u32; // uncompressed flag | size
        inode_payload.extend_from_slice(&block_size_word.to_le_bytes());

        let inode_block_header: u16 = 0x8000 | inode_payload.len() as u16;
        let dir_block_header: u16 = 0x8000 | dir_payload.len() as u16;

        let mut buf = vec![0u8; SB_LEN as usize];
        buf.extend_from_slice(content);
        let inode_table_offset = buf.len() as u64;
        buf.extend_from_slice(&inode_block_header.to_le_bytes());
        buf.extend_from_slice(&inode_payload);
        let dir_table_offset = buf.len() as u64;
        buf.extend_from_slice(&dir_block_header.to_le_bytes());
        buf.extend_from_slice(&dir_payload);
        let bytes_used = buf.len() as u64;

        let mut sb = Vec::with_capacity(SB_LEN as usize);
        sb.extend_from_slice(&MAGIC);
        sb.extend_from_slice(&2u32.to_le_bytes()); // inode_count
        sb.extend_from_slice(&0u32.to_le_bytes()); // mod_time
        sb.extend_from_slice(&0x20000u32.to_le_bytes()); // block_size
        sb.extend_from_slice(&0u32.to_le_bytes()); // frag_count
        sb.extend_from_slice(&0u16.to_le_bytes()); // compressor: None
        sb.extend_from_slice(&17u16.to_le_bytes()); // block_log
        sb.extend_from_slice(&0u16.to_le_bytes()); // flags
        sb.extend_from_slice(&0u16.to_le_bytes()); // id_count
        sb.extend_from_slice(&4u16.to_le_bytes()); // version_major
        sb.extend_from_slice(&0u16.to_le_bytes()); // version_minor
        sb.extend_from_slice(&0u64.to_le_bytes()); // root_inode: block 0, byte offset 0
        sb.extend_from_slice(&bytes_used.to_le_bytes());
        sb.extend_from_slice(&bytes_used.to_le_bytes()); // id_table: never dereferenced, id_count == 0
        sb.extend_from_slice(&NOT_SET.to_le_bytes()); // xattr_table
        sb.extend_from_slice(&inode_table_offset.to_le_bytes());
        sb.extend_from_slice(&dir_table_offset.to_le_bytes());
        sb.extend_from_slice(&NOT_SET.to_le_bytes()); // frag_table
        sb.extend_from_slice(&NOT_SET.to_le_bytes()); // export_table
        assert_eq!(sb.len(), SB_LEN as usize);

        buf[..SB_LEN as usize].copy_from_slice(&sb);
        buf
    }

    #[test]
    fn round_trips_a_single_file() {
        let content = b"hello squashfs\n";
        let mut image = SquashFsImage::open(Cursor::new(build_image(content)), Endian::Little).unwrap();

        assert_eq!(image.list("/"), vec!["busybox".to_string()]);
        assert_eq!(image.read("/busybox").unwrap(), content);
        assert!(image.read("/missing").is_none());
        assert!(image.stat("/missing").is_none());

        let attrs = image.stat("/busybox").unwrap();
        assert_eq!(attrs.size, content.len() as u64);
        assert_eq!(attrs.mode & 0o170000, 0o100000);
        assert_eq!(attrs.mode & 0o777, 0o644);

        let root_attrs = image.stat("/").unwrap();
        assert_eq!(root_attrs.mode & 0o170000, 0o040000);
        assert_eq!(root_attrs.nlink, 2);
    }

    #[test]
    fn truncated_image_is_rejected_at_open() {
        let mut image_bytes = build_image(b"x");
        image_bytes.truncate(50);
        assert!(SquashFsImage::open(Cursor::new(image_bytes), Endian::Little).is_err());
    }
}
