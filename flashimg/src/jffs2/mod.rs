//! JFFS2 reader: a linear scan of a log-structured node stream.

mod compressor;
mod image;
mod node;
mod rtime;

pub use image::Jffs2Image;
pub use node::MAGIC;
