//! Errors

use std::io;

use thiserror::Error;

/// Errors produced while detecting, opening, or reading a flash filesystem image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("corrupted or invalid image: {0}")]
    Format(&'static str),

    #[error("checksum mismatch: {0}")]
    Checksum(&'static str),

    #[error("unsupported compression id {id} for this format")]
    UnsupportedCompression { id: u32 },

    #[error("path not found")]
    NotFound,
}

impl From<ImageError> for io::Error {
    fn from(value: ImageError) -> Self {
        use ImageError::*;
        match value {
            Io(io) => io,
            NotFound => Self::from(io::ErrorKind::NotFound),
            UnsupportedCompression { .. } => Self::from(io::ErrorKind::Unsupported),
            Utf8(_) | Deku(_) | Format(_) | Checksum(_) => Self::from(io::ErrorKind::InvalidData),
        }
    }
}
