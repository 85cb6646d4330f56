//! TAR container builder for bundle payloads.
//!
//! Bundles are standard TAR archives built in memory, one growing byte
//! vector. File sizes are only known after their data has been appended,
//! so the builder remembers each header's *offset* into the vector and
//! patches the size, mtime and checksum fields when the file is closed.
//! Offsets stay valid across reallocation; raw pointers into the vector
//! would not.
//!
//! Header fields follow the classic format: octal ASCII with leading
//! zeros and a NUL terminator. The checksum is the byte sum of the whole
//! 512-byte header with the checksum field read as eight ASCII spaces,
//! stored as a 6-digit zero-padded octal number terminated by NUL then
//! space.

use anyhow::{bail, Error};

pub const TAR_BLOCK_LENGTH: usize = 512;

const FILENAME_LENGTH: usize = 100;

// field offsets within a header block
const MODE_OFFSET: usize = 100;
const UID_OFFSET: usize = 108;
const GID_OFFSET: usize = 116;
const SIZE_OFFSET: usize = 124;
const MTIME_OFFSET: usize = 136;
const CHECKSUM_OFFSET: usize = 148;
const TYPEFLAG_OFFSET: usize = 156;

const TYPEFLAG_NORMAL_FILE: u8 = b'0';

fn write_octal(field: &mut [u8], value: u64, post_terminator: &[u8]) {
    let digits = field.len() - 1 - post_terminator.len();
    let octal = format!("{:0width$o}", value, width = digits);
    debug_assert_eq!(octal.len(), digits);
    field[..digits].copy_from_slice(octal.as_bytes());
    field[digits] = 0;
    field[digits + 1..].copy_from_slice(post_terminator);
}

/// In-place TAR writer over a growing byte vector.
pub struct TarBuilder {
    data: Vec<u8>,
    current_header_offset: Option<usize>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            current_header_offset: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Begin a new file entry. Writes a zeroed header block and records
    /// its offset; the length-dependent fields are patched by
    /// [`finish_file`](Self::finish_file).
    pub fn start_file(&mut self, name: &str, mode: u32, uid: u32, gid: u32) -> Result<(), Error> {
        if self.current_header_offset.is_some() {
            bail!("tar builder already has an open file entry");
        }
        if name.len() >= FILENAME_LENGTH {
            bail!("tar file name too long: {:?}", name);
        }

        let offset = self.data.len();
        self.data.resize(offset + TAR_BLOCK_LENGTH, 0);

        let header = &mut self.data[offset..offset + TAR_BLOCK_LENGTH];
        header[..name.len()].copy_from_slice(name.as_bytes());
        write_octal(&mut header[MODE_OFFSET..MODE_OFFSET + 8], mode as u64, b"");
        write_octal(&mut header[UID_OFFSET..UID_OFFSET + 8], uid as u64, b"");
        write_octal(&mut header[GID_OFFSET..GID_OFFSET + 8], gid as u64, b"");
        header[TYPEFLAG_OFFSET] = TYPEFLAG_NORMAL_FILE;

        self.current_header_offset = Some(offset);
        Ok(())
    }

    /// Append payload bytes to the open file entry.
    pub fn append_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.current_header_offset.is_none() {
            bail!("tar builder has no open file entry");
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Close the open file entry: patch size and mtime, compute the
    /// checksum, pad the data to a block boundary.
    pub fn finish_file(&mut self, mtime: i64) -> Result<(), Error> {
        let header_offset = match self.current_header_offset.take() {
            Some(offset) => offset,
            None => bail!("tar builder has no open file entry"),
        };

        let size = self.data.len() - header_offset - TAR_BLOCK_LENGTH;
        let header = &mut self.data[header_offset..header_offset + TAR_BLOCK_LENGTH];
        write_octal(&mut header[SIZE_OFFSET..SIZE_OFFSET + 12], size as u64, b"");
        write_octal(
            &mut header[MTIME_OFFSET..MTIME_OFFSET + 12],
            mtime.max(0) as u64,
            b"",
        );

        // checksum: sum over the header with the checksum field as spaces
        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].fill(b' ');
        let checksum: u64 = header.iter().map(|&b| b as u64).sum();
        write_octal(
            &mut header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8],
            checksum,
            b" ",
        );

        let trailing = self.data.len() % TAR_BLOCK_LENGTH;
        if trailing != 0 {
            let padding = TAR_BLOCK_LENGTH - trailing;
            self.data.resize(self.data.len() + padding, 0);
        }
        Ok(())
    }

    /// Close the archive with two zero end-of-archive blocks and return
    /// the container bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        if self.current_header_offset.is_some() {
            bail!("tar builder still has an open file entry");
        }
        self.data.resize(self.data.len() + 2 * TAR_BLOCK_LENGTH, 0);
        Ok(self.data)
    }
}

impl Default for TarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_octal(field: &[u8]) -> u64 {
        let end = field.iter().position(|&b| b == 0 || b == b' ').unwrap();
        u64::from_str_radix(std::str::from_utf8(&field[..end]).unwrap(), 8).unwrap()
    }

    #[test]
    fn single_file_layout() {
        let mut builder = TarBuilder::new();
        builder.start_file("payload_0.dat", 0o400, 1000, 1000).unwrap();
        builder.append_data(b"hello tar").unwrap();
        builder.finish_file(1234567).unwrap();
        let data = builder.finish().unwrap();

        // header + padded data + two end blocks
        assert_eq!(data.len(), 512 + 512 + 2 * 512);
        assert_eq!(&data[..13], b"payload_0.dat");
        assert_eq!(read_octal(&data[MODE_OFFSET..MODE_OFFSET + 8]), 0o400);
        assert_eq!(read_octal(&data[UID_OFFSET..UID_OFFSET + 8]), 1000);
        assert_eq!(read_octal(&data[SIZE_OFFSET..SIZE_OFFSET + 12]), 9);
        assert_eq!(read_octal(&data[MTIME_OFFSET..MTIME_OFFSET + 12]), 1234567);
        assert_eq!(data[TYPEFLAG_OFFSET], b'0');
        assert_eq!(&data[512..521], b"hello tar");
        assert!(data[521..1024].iter().all(|&b| b == 0));
        assert!(data[1024..].iter().all(|&b| b == 0));
    }

    #[test]
    fn checksum_matches_definition() {
        let mut builder = TarBuilder::new();
        builder.start_file("f", 0o400, 0, 0).unwrap();
        builder.append_data(b"x").unwrap();
        builder.finish_file(0).unwrap();
        let data = builder.finish().unwrap();

        let stored = read_octal(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8]);
        let mut expected: u64 = 0;
        for (i, &b) in data[..512].iter().enumerate() {
            if (CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8).contains(&i) {
                expected += b' ' as u64;
            } else {
                expected += b as u64;
            }
        }
        assert_eq!(stored, expected);
        // terminator sequence: NUL then space
        assert_eq!(data[CHECKSUM_OFFSET + 6], 0);
        assert_eq!(data[CHECKSUM_OFFSET + 7], b' ');
    }

    #[test]
    fn exact_block_needs_no_padding() {
        let mut builder = TarBuilder::new();
        builder.start_file("block", 0o400, 0, 0).unwrap();
        builder.append_data(&[7u8; 512]).unwrap();
        builder.finish_file(0).unwrap();
        let data = builder.finish().unwrap();
        assert_eq!(data.len(), 512 + 512 + 2 * 512);
    }

    #[test]
    fn rejects_unbalanced_calls() {
        let mut builder = TarBuilder::new();
        assert!(builder.append_data(b"x").is_err());
        assert!(builder.finish_file(0).is_err());
        builder.start_file("a", 0o400, 0, 0).unwrap();
        assert!(builder.start_file("b", 0o400, 0, 0).is_err());
        assert!(builder.finish().is_err());
    }
}
