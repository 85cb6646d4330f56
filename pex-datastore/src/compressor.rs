//! Payload compressor family.
//!
//! Each bundle payload is a single compression stream of concatenated
//! block bytes. The compressor is (re)initialized per payload and
//! flushed when the payload ends, so a reader can inflate each payload
//! independently.

use anyhow::{format_err, Error};
use flate2::{Compress, Compression, FlushCompress, Status};

use pex_api_types::CompressionType;

const OUTPUT_CHUNK: usize = 64 * 1024;

pub enum Compressor {
    None,
    Zlib { compress: Compress },
}

impl Compressor {
    pub fn new(compression_type: CompressionType, level: u32) -> Self {
        match compression_type {
            CompressionType::None => Compressor::None,
            CompressionType::Zlib => Compressor::Zlib {
                compress: Compress::new(Compression::new(level), true),
            },
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        match self {
            Compressor::None => CompressionType::None,
            Compressor::Zlib { .. } => CompressionType::Zlib,
        }
    }

    /// Feed block bytes into the current stream, appending compressed
    /// output to `out`.
    pub fn compress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Compressor::None => {
                out.extend_from_slice(data);
                Ok(())
            }
            Compressor::Zlib { compress, .. } => {
                let mut input = data;
                loop {
                    if out.capacity() == out.len() {
                        out.reserve(OUTPUT_CHUNK);
                    }
                    let before = compress.total_in();
                    let status = compress
                        .compress_vec(input, out, FlushCompress::None)
                        .map_err(|err| format_err!("deflate failed - {}", err))?;
                    let consumed = (compress.total_in() - before) as usize;
                    input = &input[consumed..];
                    if input.is_empty() {
                        return Ok(());
                    }
                    match status {
                        Status::Ok | Status::BufError => continue,
                        Status::StreamEnd => {
                            return Err(format_err!("deflate stream ended unexpectedly"))
                        }
                    }
                }
            }
        }
    }

    /// Terminate the current stream, appending any buffered output, and
    /// reset the compressor for the next payload.
    pub fn finalize(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Compressor::None => Ok(()),
            Compressor::Zlib { compress, .. } => {
                loop {
                    if out.capacity() == out.len() {
                        out.reserve(OUTPUT_CHUNK);
                    }
                    let status = compress
                        .compress_vec(&[], out, FlushCompress::Finish)
                        .map_err(|err| format_err!("deflate finish failed - {}", err))?;
                    match status {
                        Status::StreamEnd => break,
                        Status::Ok | Status::BufError => continue,
                    }
                }
                compress.reset();
                Ok(())
            }
        }
    }
}
