//! Fixed-size file chunking with streaming SHA-1.
//!
//! Files are split into fixed-size blocks (1 MiB by default; the final
//! block may be shorter). The per-block digests and the whole-file digest
//! are computed in a single pass over the data. Zero-length blocks are
//! never emitted, so an empty file yields no chunks.

use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{format_err, Error};
use openssl::sha::Sha1;

use pex_api_types::{Block, Chunk};

pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-1 of a byte slice.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha1(data))
}

pub struct FileChunks {
    pub chunks: Vec<Chunk>,
    /// Lowercase hex SHA-1 over the whole file.
    pub whole_file_sha1: String,
}

// Read::read may return short counts; fill the block buffer until EOF.
fn read_block(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

/// Split the file at `path` into fixed-size blocks, hashing each block
/// and the whole file in one pass.
pub fn hash_file_chunks(
    path: &Path,
    block_size: usize,
    observation_time: i64,
) -> Result<FileChunks, Error> {
    let mut file = std::fs::File::open(path)
        .map_err(|err| format_err!("unable to open {:?} for chunking - {}", path, err))?;

    let mut whole_file_hasher = Sha1::new();
    let mut chunks = Vec::new();
    let mut buffer = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        let count = read_block(&mut file, &mut buffer)?;
        if count == 0 {
            break;
        }
        let block_data = &buffer[..count];
        whole_file_hasher.update(block_data);
        chunks.push(Chunk {
            id: None,
            offset,
            block: Block {
                id: None,
                sha1_digest: sha1_hex(block_data),
                length: count as u64,
            },
            observation_time,
        });
        offset += count as u64;
        if count < block_size {
            break;
        }
    }

    Ok(FileChunks {
        chunks,
        whole_file_sha1: hex::encode(whole_file_hasher.finish()),
    })
}

/// Read one block's bytes back from the file at the chunk's offset.
/// Fails if the file has shrunk below the recorded span.
pub fn read_block_at(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|err| format_err!("unable to open {:?} for block read - {}", path, err))?;
    let mut data = vec![0u8; length as usize];
    file.read_exact_at(&mut data, offset)
        .map_err(|err| format_err!("short read at {}+{} in {:?} - {}", offset, length, path, err))?;
    Ok(data)
}
