//! The directory table: a flat, self-describing list of `(header, entries)` groups that the
//! tree walker turns into a hierarchy by following each basic/extended directory inode's
//! `block_index`/`block_offset`/`file_size` into this table.

use std::fmt;

use deku::prelude::*;

use crate::error::ImageError;
use crate::squashfs::inode::InodeId;

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "type_endian: deku::ctx::Endian")]
#[deku(endian = "type_endian")]
pub struct Dir {
    #[deku(assert = "*count <= 256")]
    pub count: u32,
    /// Start of the metadata block (relative to the inode table) holding this group's inodes.
    pub start: u32,
    /// Base inode number; each entry stores its inode number as a signed offset from this.
    pub inode_num: u32,
    #[deku(count = "*count + 1")]
    pub dir_entries: Vec<DirEntry>,
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirEntry {
    /// Offset into the uncompressed inode metadata block named by `Dir::start`.
    pub offset: u16,
    /// Signed difference between this entry's inode number and the header's `inode_num`.
    pub inode_offset: i16,
    /// Inode type; extended variants are reported as their basic counterpart here.
    pub t: InodeId,
    /// One less than the length of `name`.
    pub name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("offset", &self.offset)
            .field("inode_offset", &self.inode_offset)
            .field("t", &self.t)
            .field("name", &self.name())
            .finish()
    }
}

impl DirEntry {
    /// Decodes the entry's name and rejects anything but a single plain path component
    /// (no separators, no `.`/`..`), so a corrupt or malicious image can't escape the tree.
    pub fn name(&self) -> Result<String, ImageError> {
        let name = std::str::from_utf8(&self.name)?;
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(ImageError::Format("directory entry name is not a plain path component"));
        }
        Ok(name.to_string())
    }

    /// This entry's absolute inode number, resolved against its group's base.
    pub fn inode_number(&self, base: u32) -> u32 {
        (base as i64 + self.inode_offset as i64) as u32
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirectoryIndex {
    pub index: u32,
    pub start: u32,
    #[deku(assert = "*name_size < 100")]
    pub name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}

impl fmt::Debug for DirectoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryIndex")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("name_size", &self.name_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        let entry = DirEntry {
            offset: 0,
            inode_offset: 0,
            t: InodeId::BasicFile,
            name_size: 1,
            name: b"..".to_vec(),
        };
        assert!(entry.name().is_err());
    }

    #[test]
    fn accepts_plain_name() {
        let entry = DirEntry {
            offset: 0,
            inode_offset: 0,
            t: InodeId::BasicFile,
            name_size: 4,
            name: b"hello".to_vec(),
        };
        assert_eq!(entry.name().unwrap(), "hello");
    }
}
