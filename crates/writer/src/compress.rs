//! Compression seam used on file rotation.
//!
//! A compressor is a factory producing a byte-stream writer; the file
//! writer streams the rotated file through it into `<name>.out`.

use std::io::{self, Read, Write};

pub trait Compressor: Send + Sync {
    /// Stream `input` through the compressor into `output`.
    /// Returns the number of uncompressed bytes consumed.
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<u64>;
}

/// LZ4 frame compression.
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<u64> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
        let copied = io::copy(input, &mut encoder)?;
        encoder
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(copied)
    }
}
