//! JFFS2 on-disk node records.
//!
//! Unlike SquashFS's fixed, densely-packed metadata, every JFFS2 node carries its own CRC
//! over a precise, sometimes-discontiguous byte range, so these are parsed by reading a raw
//! byte buffer and checking/decoding fields from it directly rather than through `deku`.

use std::io::Read;

use crate::crc::mtd_crc;
use crate::error::ImageError;
use crate::reader::Endian;

pub const MAGIC: u16 = 0x1985;

const COMPAT_MASK: u16 = 0xc000;
const NODE_ACCURATE: u16 = 0x2000;
const INCOMPAT: u16 = COMPAT_MASK;
const RWCOMPAT_DELETE: u16 = 0x0000;

pub mod node_type {
    use super::*;

    pub const DIRENT: u16 = INCOMPAT | NODE_ACCURATE | 1;
    pub const INODE: u16 = INCOMPAT | NODE_ACCURATE | 2;
    pub const CLEANMARKER: u16 = RWCOMPAT_DELETE | NODE_ACCURATE | 3;
    pub const PADDING: u16 = RWCOMPAT_DELETE | NODE_ACCURATE | 4;
    pub const SUMMARY: u16 = RWCOMPAT_DELETE | NODE_ACCURATE | 6;
    pub const XATTR: u16 = INCOMPAT | NODE_ACCURATE | 8;
    pub const XREF: u16 = INCOMPAT | NODE_ACCURATE | 9;
}

/// File type tag carried on a dirent (`d_type`-style).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    Fifo,
    Chr,
    Dir,
    Blk,
    Reg,
    Lnk,
    Sock,
    Wht,
}

impl FileType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Fifo,
            2 => Self::Chr,
            4 => Self::Dir,
            6 => Self::Blk,
            8 => Self::Reg,
            10 => Self::Lnk,
            12 => Self::Sock,
            14 => Self::Wht,
            _ => Self::Unknown,
        }
    }
}

/// The 12-byte general header common to every node.
#[derive(Debug, Copy, Clone)]
pub struct GeneralHeader {
    pub magic: u16,
    pub nodetype: u16,
    pub totlen: u32,
    pub hdr_crc_ok: bool,
}

pub const GENERAL_HEADER_LEN: u64 = 12;

/// Reads the 12-byte general header at the reader's current position without consuming it
/// (the caller rewinds and re-reads the full record once the type is known).
pub fn peek_general_header<R: Read>(
    r: &mut R,
    endian: Endian,
) -> Result<GeneralHeader, ImageError> {
    let mut buf = [0u8; GENERAL_HEADER_LEN as usize];
    r.read_exact(&mut buf)?;
    let magic = endian.u16([buf[0], buf[1]]);
    let nodetype = endian.u16([buf[2], buf[3]]);
    let totlen = endian.u32([buf[4], buf[5], buf[6], buf[7]]);
    let hdr_crc = endian.u32([buf[8], buf[9], buf[10], buf[11]]);
    let hdr_crc_ok = mtd_crc(&buf[..8]) == hdr_crc;
    Ok(GeneralHeader { magic, nodetype, totlen, hdr_crc_ok })
}

/// A dirent node: associates a name with a target inode number under a parent.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub pino: u32,
    pub version: u32,
    /// Target inode number; zero means this name has been unlinked.
    pub ino: u32,
    pub mctime: u32,
    pub dtype: FileType,
    pub name: String,
    pub name_crc_ok: bool,
}

/// Reads a dirent node's body. The reader must be positioned right after the general header
/// (the 40-byte fixed portion below starts with its own copy of magic/nodetype/totlen/hdr_crc
/// so that the whole record's CRC coverage matches the source format exactly).
pub fn read_dirent<R: Read>(r: &mut R, endian: Endian) -> Result<Dirent, ImageError> {
    const FIXED_LEN: usize = 40;
    let mut buf = [0u8; FIXED_LEN];
    r.read_exact(&mut buf)?;

    let pino = endian.u32([buf[12], buf[13], buf[14], buf[15]]);
    let version = endian.u32([buf[16], buf[17], buf[18], buf[19]]);
    let ino = endian.u32([buf[20], buf[21], buf[22], buf[23]]);
    let mctime = endian.u32([buf[24], buf[25], buf[26], buf[27]]);
    let nsize = buf[28];
    let dtype = FileType::from_u8(buf[29]);
    let name_crc = endian.u32([buf[36], buf[37], buf[38], buf[39]]);

    let mut name_buf = vec![0u8; nsize as usize];
    r.read_exact(&mut name_buf)?;
    let name_crc_ok = mtd_crc(&name_buf) == name_crc;
    // A name that fails its CRC is already going to be dropped by the caller; decode it
    // lossily rather than letting a stray non-UTF8 byte turn one bad record into a hard
    // error for the whole scan.
    let name = String::from_utf8_lossy(&name_buf).into_owned();

    Ok(Dirent { pino, version, ino, mctime, dtype, name, name_crc_ok })
}

/// A data-version node: one write covering `[offset, offset + dsize)` of an inode's content.
#[derive(Debug, Clone)]
pub struct RawInode {
    pub ino: u32,
    pub version: u32,
    pub mode: u32,
    pub uid: u16,
    pub gid: u16,
    pub isize: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub offset: u32,
    pub compr: u8,
    pub node_crc_ok: bool,
    /// Decompressed payload, or empty when the node CRC or data CRC failed to validate.
    pub data: Vec<u8>,
}

/// Reads a data-version node's fixed header plus compressed payload, validating the node CRC
/// (over everything but the trailing data/node CRC pair) and the data CRC (over the raw
/// compressed bytes) before decompressing.
pub fn read_raw_inode<R: Read>(
    r: &mut R,
    endian: Endian,
    decompress: impl FnOnce(u8, &[u8], u32) -> Result<Vec<u8>, ImageError>,
) -> Result<RawInode, ImageError> {
    const FIXED_LEN: usize = 68;
    let mut buf = [0u8; FIXED_LEN];
    r.read_exact(&mut buf)?;

    let ino = endian.u32([buf[12], buf[13], buf[14], buf[15]]);
    let version = endian.u32([buf[16], buf[17], buf[18], buf[19]]);
    let mode = endian.u32([buf[20], buf[21], buf[22], buf[23]]);
    let uid = endian.u16([buf[24], buf[25]]);
    let gid = endian.u16([buf[26], buf[27]]);
    let isize = endian.u32([buf[28], buf[29], buf[30], buf[31]]);
    let atime = endian.u32([buf[32], buf[33], buf[34], buf[35]]);
    let mtime = endian.u32([buf[36], buf[37], buf[38], buf[39]]);
    let ctime = endian.u32([buf[40], buf[41], buf[42], buf[43]]);
    let offset = endian.u32([buf[44], buf[45], buf[46], buf[47]]);
    let csize = endian.u32([buf[48], buf[49], buf[50], buf[51]]);
    let dsize = endian.u32([buf[52], buf[53], buf[54], buf[55]]);
    let compr = buf[56];
    let data_crc = endian.u32([buf[60], buf[61], buf[62], buf[63]]);
    let node_crc = endian.u32([buf[64], buf[65], buf[66], buf[67]]);

    let node_crc_ok = mtd_crc(&buf[..60]) == node_crc;

    let mut data = Vec::new();
    if node_crc_ok {
        let mut compressed = vec![0u8; csize as usize];
        r.read_exact(&mut compressed)?;
        if mtd_crc(&compressed) == data_crc {
            data = decompress(compr, &compressed, dsize)?;
        }
    }

    Ok(RawInode { ino, version, mode, uid, gid, isize, atime, mtime, ctime, offset, compr, node_crc_ok, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_crc_validates_first_eight_bytes() {
        let mut buf = Vec::new();
        buf.extend(MAGIC.to_le_bytes());
        buf.extend(node_type::DIRENT.to_le_bytes());
        buf.extend(40u32.to_le_bytes());
        let crc = mtd_crc(&buf);
        buf.extend(crc.to_le_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let header = peek_general_header(&mut cursor, Endian::Little).unwrap();
        assert!(header.hdr_crc_ok);
        assert_eq!(header.nodetype, node_type::DIRENT);
    }
}
