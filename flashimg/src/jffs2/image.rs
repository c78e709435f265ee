//! Ties the linear node scan together into a reconstructed tree, and serves the unified
//! read API over the resulting per-inode version lists.

use std::io::{Read, Seek, SeekFrom};

use solana_nohash_hasher::IntMap;
use tracing::{debug, info, trace, warn};

use crate::error::ImageError;
use crate::jffs2::compressor;
use crate::jffs2::node::{self, node_type, Dirent, FileType, RawInode, GENERAL_HEADER_LEN};
use crate::reader::Endian;
use crate::tree::{Attrs, Image, NodeKind, StatFs, TreeNode};

/// Inode number of the synthetic root fabricated for the tree (see `Entry::synthetic_root`).
const ROOT_INO: u32 = 1;

/// Upper bound on consecutive byte-skip retries while resynchronising after a bad header.
const RESYNC_LIMIT: u32 = 12;

/// Everything gathered about one on-disk inode number across the whole scan: at most one
/// surviving dirent (first-wins on duplicates) and every data-version node that named it.
#[derive(Default)]
struct Entry {
    dirent: Option<Dirent>,
    versions: Vec<RawInode>,
    data: Option<Vec<u8>>,
}

impl Entry {
    fn synthetic_root(mctime: u32) -> Self {
        Self {
            dirent: Some(Dirent {
                pino: 0,
                version: 0,
                ino: ROOT_INO,
                mctime,
                dtype: FileType::Dir,
                name: String::new(),
                name_crc_ok: true,
            }),
            versions: Vec::new(),
            data: None,
        }
    }
}

mod mode_bits {
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
}

pub struct Jffs2Image<R> {
    reader: R,
    entries: IntMap<u32, Entry>,
    root: TreeNode,
}

impl<R: Read + Seek> Jffs2Image<R> {
    pub fn open(mut reader: R, endian: Endian) -> Result<Self, ImageError> {
        let total_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut entries: IntMap<u32, Entry> = IntMap::default();
        let mut first_dir_mctime: Option<u32> = None;
        let mut pos = 0u64;
        let mut consecutive_failures = 0u32;

        while pos < total_len {
            reader.seek(SeekFrom::Start(pos))?;
            let header = match node::peek_general_header(&mut reader, endian) {
                Ok(h) => h,
                Err(_) => break, // not enough bytes left for even a header: end of scan
            };

            if header.magic != node::MAGIC || !header.hdr_crc_ok || header.totlen < GENERAL_HEADER_LEN as u32
            {
                consecutive_failures += 1;
                if consecutive_failures > RESYNC_LIMIT {
                    return Err(ImageError::Format(
                        "jffs2: exceeded resynchronisation retry limit",
                    ));
                }
                warn!(pos, "jffs2: bad node header, skipping one byte to resynchronise");
                pos += 1;
                continue;
            }
            consecutive_failures = 0;

            reader.seek(SeekFrom::Start(pos))?;
            match header.nodetype {
                node_type::DIRENT => {
                    let dirent = node::read_dirent(&mut reader, endian)?;
                    if !dirent.name_crc_ok {
                        warn!(ino = dirent.ino, "jffs2: dirent name CRC mismatch, omitting entry");
                    } else if entries.get(&dirent.ino).and_then(|e| e.dirent.as_ref()).is_some() {
                        debug!(ino = dirent.ino, "jffs2: duplicate dirent, keeping first-seen");
                    } else {
                        if dirent.dtype == FileType::Dir && first_dir_mctime.is_none() {
                            first_dir_mctime = Some(dirent.mctime);
                        }
                        trace!(ino = dirent.ino, name = %dirent.name, "jffs2: parsed dirent");
                        entries.entry(dirent.ino).or_default().dirent = Some(dirent);
                    }
                }
                node_type::INODE => {
                    let raw = node::read_raw_inode(&mut reader, endian, |id, bytes, dsize| {
                        compressor::decompress(id, bytes, dsize)
                    })?;
                    if !raw.node_crc_ok {
                        warn!(ino = raw.ino, "jffs2: node CRC mismatch, keeping as zero-length placeholder");
                    }
                    trace!(ino = raw.ino, version = raw.version, "jffs2: parsed inode version");
                    entries.entry(raw.ino).or_default().versions.push(raw);
                }
                node_type::CLEANMARKER => {
                    trace!(pos, "jffs2: cleanmarker");
                }
                _ => {
                    trace!(pos, nodetype = header.nodetype, "jffs2: skipping recognised-but-unused node");
                }
            }

            pos += pad(header.totlen) as u64;
        }

        entries.entry(ROOT_INO).or_insert_with(|| Entry::synthetic_root(first_dir_mctime.unwrap_or(0)));

        let root = build_tree(&entries);
        info!(inodes = entries.len(), "opened jffs2 image");

        Ok(Self { reader, entries, root })
    }

    fn assemble(&mut self, ino: u32) -> Option<&[u8]> {
        let entry = self.entries.get_mut(&ino)?;
        if entry.data.is_none() {
            let mut versions = entry.versions.clone();
            versions.sort_by_key(|v| v.version);
            let size = versions.last().map(|v| v.isize as usize).unwrap_or(0);
            let mut buf = vec![0u8; size];
            for v in &versions {
                let start = v.offset as usize;
                if start >= buf.len() {
                    continue;
                }
                let end = (start + v.data.len()).min(buf.len());
                if end > start {
                    buf[start..end].copy_from_slice(&v.data[..end - start]);
                }
            }
            entry.data = Some(buf);
        }
        entry.data.as_deref()
    }
}

fn pad(totlen: u32) -> u32 {
    (totlen + 3) & !3
}

fn dtype_kind(dtype: FileType) -> Option<NodeKind> {
    Some(match dtype {
        FileType::Dir => NodeKind::Directory,
        FileType::Reg => NodeKind::File,
        FileType::Lnk => NodeKind::Symlink,
        FileType::Blk => NodeKind::BlockDevice,
        FileType::Chr => NodeKind::CharDevice,
        FileType::Fifo => NodeKind::Fifo,
        FileType::Sock => NodeKind::Socket,
        FileType::Unknown | FileType::Wht => return None,
    })
}

/// Builds the directory tree by grouping every surviving dirent by its `pino` and recursing
/// from the synthetic root, guarding against cycles introduced by a corrupt `pino` chain.
fn build_tree(entries: &IntMap<u32, Entry>) -> TreeNode {
    let mut children_by_parent: IntMap<u32, Vec<(String, u32, FileType)>> = IntMap::default();
    for entry in entries.values() {
        let Some(dirent) = &entry.dirent else { continue };
        if dirent.ino == 0 || dirent.ino == ROOT_INO {
            continue; // ino == 0 denotes an unlink tombstone; root can't be its own child
        }
        children_by_parent
            .entry(dirent.pino)
            .or_default()
            .push((dirent.name.clone(), dirent.ino, dirent.dtype));
    }

    let mut root = TreeNode::directory(ROOT_INO);
    attach_children(&mut root, &children_by_parent, &mut vec![ROOT_INO]);
    root
}

fn attach_children(
    node: &mut TreeNode,
    children_by_parent: &IntMap<u32, Vec<(String, u32, FileType)>>,
    visiting: &mut Vec<u32>,
) {
    let Some(children) = children_by_parent.get(&node.id) else { return };
    for (name, ino, dtype) in children {
        if visiting.contains(ino) {
            continue; // cyclic pino chain; drop rather than recurse forever
        }
        let Some(kind) = dtype_kind(*dtype) else { continue };
        let mut child = TreeNode::leaf(kind, *ino);
        if kind == NodeKind::Directory {
            visiting.push(*ino);
            attach_children(&mut child, children_by_parent, visiting);
            visiting.pop();
        }
        node.children.insert(name.clone(), child);
    }
}

impl<R: Read + Seek> Image for Jffs2Image<R> {
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
        let id = node.id;
        self.assemble(id).map(|bytes| bytes.to_vec())
    }

    fn stat(&self, path: &str) -> Option<Attrs> {
        let node = crate::tree::resolve(&self.root, path)?;
        let entry = self.entries.get(&node.id)?;
        let dtype = entry.dirent.as_ref().map(|d| d.dtype).unwrap_or(FileType::Unknown);
        let type_bits = match dtype {
            FileType::Dir => mode_bits::S_IFDIR,
            FileType::Lnk => mode_bits::S_IFLNK,
            FileType::Blk => mode_bits::S_IFBLK,
            FileType::Chr => mode_bits::S_IFCHR,
            FileType::Fifo => mode_bits::S_IFIFO,
            FileType::Sock => mode_bits::S_IFSOCK,
            FileType::Reg | FileType::Unknown | FileType::Wht => mode_bits::S_IFREG,
        };

        let mut versions = entry.versions.clone();
        versions.sort_by_key(|v| v.version);
        let Some(latest) = versions.last() else {
            let mctime = entry.dirent.as_ref().map(|d| d.mctime).unwrap_or(0);
            return Some(Attrs {
                atime: mctime,
                ctime: mctime,
                mtime: mctime,
                uid: 0,
                gid: 0,
                mode: 0o755 | type_bits,
                nlink: if dtype == FileType::Dir { 2 } else { 1 },
                size: 0,
                blocks: 0,
            });
        };

        let size = latest.isize as u64;
        Some(Attrs {
            atime: latest.atime,
            ctime: latest.ctime,
            mtime: latest.mtime,
            uid: latest.uid as u32,
            gid: latest.gid as u32,
            mode: (latest.mode & 0o7777) | type_bits,
            nlink: if dtype == FileType::Dir { 2 } else { 1 },
            size,
            blocks: size.div_ceil(512),
        })
    }

    fn readlink(&self, path: &str) -> Option<String> {
        let node = crate::tree::resolve(&self.root, path)?;
        if node.kind != NodeKind::Symlink {
            return None;
        }
        let entry = self.entries.get(&node.id)?;
        let mut versions = entry.versions.clone();
        versions.sort_by_key(|v| v.version);
        let data = versions.last()?;
        Some(String::from_utf8_lossy(&data.data).into_owned())
    }

    fn statfs(&self) -> StatFs {
        StatFs { block_size: 131_072, name_max: StatFs::NAME_MAX }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::crc::mtd_crc;

    fn pad_to_4(rec: &mut Vec<u8>) {
        while rec.len() % 4 != 0 {
            rec.push(0);
        }
    }

    fn header_bytes(nodetype: u16, totlen: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(12);
        h.extend_from_slice(&node::MAGIC.to_le_bytes());
        h.extend_from_slice(&nodetype.to_le_bytes());
        h.extend_from_slice(&totlen.to_le_bytes());
        let crc = mtd_crc(&h);
        h.extend_from_slice(&crc.to_le_bytes());
        h
    }

    /// Builds one padded dirent node. `ino == 0` would mark a name as unlinked; unused here.
    fn build_dirent(pino: u32, version: u32, ino: u32, mctime: u32, dtype: u8, name: &[u8]) -> Vec<u8> {
        let content_len = 40 + name.len() as u32;
        let mut rec = header_bytes(node_type::DIRENT, content_len);
        rec.extend_from_slice(&pino.to_le_bytes());
        rec.extend_from_slice(&version.to_le_bytes());
        rec.extend_from_slice(&ino.to_le_bytes());
        rec.extend_from_slice(&mctime.to_le_bytes());
        rec.push(name.len() as u8); // nsize
        rec.push(dtype);
        rec.extend_from_slice(&[0u8; 2]); // unused
        rec.extend_from_slice(&[0u8; 4]); // node_crc (unchecked by this reader)
        rec.extend_from_slice(&mtd_crc(name).to_le_bytes());
        rec.extend_from_slice(name);
        pad_to_4(&mut rec);
        rec
    }

    /// Builds one padded data-version node storing `data` uncompressed (`compr == 0`).
    fn build_raw_inode(ino: u32, version: u32, mode: u32, isize_: u32, offset: u32, data: &[u8]) -> Vec<u8> {
        let csize = data.len() as u32;
        let content_len = 68 + csize;
        let mut rec = header_bytes(node_type::INODE, content_len);
        rec.extend_from_slice(&ino.to_le_bytes());
        rec.extend_from_slice(&version.to_le_bytes());
        rec.extend_from_slice(&mode.to_le_bytes());
        rec.extend_from_slice(&0u16.to_le_bytes()); // uid
        rec.extend_from_slice(&0u16.to_le_bytes()); // gid
        rec.extend_from_slice(&isize_.to_le_bytes());
        rec.extend_from_slice(&0u32.to_le_bytes()); // atime
        rec.extend_from_slice(&0u32.to_le_bytes()); // mtime
        rec.extend_from_slice(&0u32.to_le_bytes()); // ctime
        rec.extend_from_slice(&offset.to_le_bytes());
        rec.extend_from_slice(&csize.to_le_bytes());
        rec.extend_from_slice(&csize.to_le_bytes()); // dsize == csize, uncompressed
        rec.push(0); // compr: None
        rec.extend_from_slice(&[0u8; 3]); // usercompr + flags, unused by this reader
        debug_assert_eq!(rec.len(), 60);
        let node_crc = mtd_crc(&rec);
        let data_crc = mtd_crc(data);
        rec.extend_from_slice(&data_crc.to_le_bytes());
        rec.extend_from_slice(&node_crc.to_le_bytes());
        rec.extend_from_slice(data);
        pad_to_4(&mut rec);
        rec
    }

    const TYPE_REG: u8 = 8;

    #[test]
    fn round_trips_a_single_file() {
        let content = b"hello jffs2\n";
        let mut bytes = build_dirent(ROOT_INO, 1, 2, 0, TYPE_REG, b"busybox");
        bytes.extend(build_raw_inode(2, 1, 0o100_644, content.len() as u32, 0, content));

        let mut image = Jffs2Image::open(Cursor::new(bytes), Endian::Little).unwrap();
        assert_eq!(image.list("/"), vec!["busybox".to_string()]);
        assert_eq!(image.read("/busybox").unwrap(), content);
        assert!(image.read("/missing").is_none());

        let attrs = image.stat("/busybox").unwrap();
        assert_eq!(attrs.size, content.len() as u64);
        assert_eq!(attrs.mode & 0o170000, mode_bits::S_IFREG);
        assert_eq!(attrs.mode & 0o777, 0o644);
    }

    #[test]
    fn later_version_overwrites_earlier_and_sets_final_size() {
        let mut bytes = build_dirent(ROOT_INO, 1, 2, 0, TYPE_REG, b"f");
        bytes.extend(build_raw_inode(2, 1, 0o100_644, 5, 0, b"AAAAA"));
        // a later, shorter version truncates the file and overwrites its prefix
        bytes.extend(build_raw_inode(2, 2, 0o100_644, 2, 0, b"BB"));

        let mut image = Jffs2Image::open(Cursor::new(bytes), Endian::Little).unwrap();
        assert_eq!(image.read("/f").unwrap(), b"BB");
    }

    #[test]
    fn duplicate_dirent_keeps_first_seen() {
        let mut bytes = build_dirent(ROOT_INO, 1, 2, 0, TYPE_REG, b"busybox");
        bytes.extend(build_dirent(ROOT_INO, 2, 2, 0, TYPE_REG, b"busybox"));
        bytes.extend(build_raw_inode(2, 1, 0o100_644, 1, 0, b"x"));

        let image = Jffs2Image::open(Cursor::new(bytes), Endian::Little).unwrap();
        assert_eq!(image.list("/"), vec!["busybox".to_string()]);
    }

    #[test]
    fn dirent_with_bad_name_crc_is_omitted() {
        let mut dirent = build_dirent(ROOT_INO, 1, 2, 0, TYPE_REG, b"busybox");
        let name_start = dirent.len() - "busybox".len() - 1; // one byte of padding follows the name
        dirent[name_start] ^= 0xFF;
        let mut bytes = dirent;
        bytes.extend(build_raw_inode(2, 1, 0o100_644, 1, 0, b"x"));

        let image = Jffs2Image::open(Cursor::new(bytes), Endian::Little).unwrap();
        assert!(image.list("/").is_empty());
    }

    #[test]
    fn raw_inode_with_corrupt_data_crc_reads_as_zero_fill() {
        let content = b"hello";
        let mut raw = build_raw_inode(2, 1, 0o100_644, content.len() as u32, 0, content);
        // corrupt one byte of the compressed payload after its CRC was already computed, so
        // the data CRC check fails and this version contributes no bytes to the assembled file
        let payload_offset = raw.len() - content.len() - 3; // 3 padding bytes follow "hello"
        raw[payload_offset] ^= 0xFF;

        let mut bytes = build_dirent(ROOT_INO, 1, 2, 0, TYPE_REG, b"busybox");
        bytes.extend(raw);

        let mut image = Jffs2Image::open(Cursor::new(bytes), Endian::Little).unwrap();
        let data = image.read("/busybox").unwrap();
        assert_eq!(data, vec![0u8; content.len()]);
    }

    #[test]
    fn empty_image_yields_only_synthetic_root() {
        let image = Jffs2Image::open(Cursor::new(Vec::new()), Endian::Little).unwrap();
        assert!(image.list("/").is_empty());
        assert!(image.list("/anything").is_empty());
    }
}
