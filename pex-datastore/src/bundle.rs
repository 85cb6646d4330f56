//! Bundle construction and finalization.
//!
//! A bundle under construction is a TAR container growing in memory, one
//! file entry per payload, plus the manifest tracking which blocks landed
//! in which payload. Finalizing appends `manifest.pbuf` and
//! `manifest_digest.sha1`, closes the container, encrypts it and computes
//! the content digests.
//!
//! The manifest deliberately does not contain the bundle id or the
//! digests of the finished bundle: the id is assigned by the catalog
//! after the bytes are fixed, and the digests obviously cannot hash
//! themselves. They live in [`BundleAnnotations`] and in the spool file
//! name instead.

use anyhow::{bail, Error};
use bytes::Bytes;

use pex_api_types::{
    Block, BundleAnnotations, BundleManifest, BundlePayload, CompressionType,
};
use pex_key_config::KeyingData;

use crate::bundle_hasher::compute_bundle_digests;
use crate::chunker::sha1_hex;
use crate::cryptor::{Cryptor, EncryptionType};
use crate::tar_builder::TarBuilder;

const PAYLOAD_FILENAME_PREFIX: &str = "payload_";
const PAYLOAD_FILENAME_SUFFIX: &str = ".dat";
const MANIFEST_FILENAME: &str = "manifest.pbuf";
const MANIFEST_DIGEST_FILENAME: &str = "manifest_digest.sha1";

// Bundle-internal files are owner-read-only.
const BUNDLE_FILE_MODE: u32 = 0o400;

/// A bundle being built. Not finalized until [`finalize`](Self::finalize).
pub struct Bundle {
    tar: TarBuilder,
    manifest: BundleManifest,
    payload_open: bool,
    next_payload_id: i64,
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            tar: TarBuilder::new(),
            manifest: BundleManifest::default(),
            payload_open: false,
            next_payload_id: 0,
        }
    }

    /// Current container size in bytes. Grows as payload data is
    /// appended; the manifest is not included until finalization.
    pub fn size(&self) -> usize {
        self.tar.len()
    }

    /// A bundle with no payloads has nothing worth finalizing.
    pub fn is_empty(&self) -> bool {
        self.manifest.payloads.is_empty()
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Begin a new payload. All blocks of one payload share a single
    /// compression stream.
    pub fn start_new_payload(
        &mut self,
        compression_type: CompressionType,
        mtime: i64,
    ) -> Result<(), Error> {
        self.end_current_payload(mtime)?;
        let id = self.next_payload_id;
        self.next_payload_id += 1;
        let offset = self.tar.len() as u64;
        self.tar.start_file(
            &format!("{}{}{}", PAYLOAD_FILENAME_PREFIX, id, PAYLOAD_FILENAME_SUFFIX),
            BUNDLE_FILE_MODE,
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )?;
        self.manifest.payloads.push(BundlePayload {
            id,
            offset,
            compression_type: compression_type as i32,
            blocks: Vec::new(),
        });
        self.payload_open = true;
        Ok(())
    }

    /// Record a block in the current payload's manifest entry. The block
    /// must already have a catalog id.
    pub fn add_block_record(&mut self, block: &Block) -> Result<(), Error> {
        if !self.payload_open {
            bail!("bundle has no open payload");
        }
        let id = match block.id {
            Some(id) => id,
            None => bail!("block {} has no catalog id", block.sha1_digest),
        };
        let payload = self.manifest.payloads.last_mut().unwrap();
        payload.blocks.push(pex_api_types::BlockRecord {
            id,
            sha1_digest: block.sha1_digest.clone(),
            length: block.length,
        });
        Ok(())
    }

    /// Append compressed block bytes to the current payload. The bytes
    /// must correspond, in order, to the blocks recorded via
    /// [`add_block_record`](Self::add_block_record).
    pub fn append_block_contents(&mut self, compressed: &[u8]) -> Result<(), Error> {
        if !self.payload_open {
            bail!("bundle has no open payload");
        }
        self.tar.append_data(compressed)
    }

    fn end_current_payload(&mut self, mtime: i64) -> Result<(), Error> {
        if self.payload_open {
            self.tar.finish_file(mtime)?;
            self.payload_open = false;
        }
        Ok(())
    }

    /// Close out the container: serialize the manifest and its digest as
    /// the final two files, finish the TAR stream. Fails on an empty
    /// bundle; callers discard those instead.
    pub fn finalize(mut self, mtime: i64) -> Result<FinalizedBundle, Error> {
        if self.is_empty() {
            bail!("refusing to finalize an empty bundle");
        }
        self.end_current_payload(mtime)?;

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let serialized_manifest = self.manifest.encode_to_vec();
        self.tar
            .start_file(MANIFEST_FILENAME, BUNDLE_FILE_MODE, uid, gid)?;
        self.tar.append_data(&serialized_manifest)?;
        self.tar.finish_file(mtime)?;

        let manifest_digest = sha1_hex(&serialized_manifest);
        self.tar
            .start_file(MANIFEST_DIGEST_FILENAME, BUNDLE_FILE_MODE, uid, gid)?;
        self.tar.append_data(manifest_digest.as_bytes())?;
        self.tar.finish_file(mtime)?;

        Ok(FinalizedBundle {
            container: self.tar.finish()?,
            manifest: self.manifest,
        })
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

/// A closed plaintext container, ready for encryption.
pub struct FinalizedBundle {
    pub container: Vec<u8>,
    pub manifest: BundleManifest,
}

impl FinalizedBundle {
    /// Encrypt the container and compute the content digests, producing
    /// the record handed to the upload stage.
    pub fn seal(
        self,
        encryption_type: EncryptionType,
        keying: &KeyingData,
    ) -> Result<AnnotatedBundleData, Error> {
        let mut cryptor = Cryptor::new(encryption_type, keying)?;
        let mut ciphertext = Vec::with_capacity(self.container.len());
        cryptor.encrypt(&self.container, &mut ciphertext)?;
        let (encryption_headers, mac) = cryptor.finalize(&mut ciphertext)?;

        let (sha256_linear_digest, sha256_tree_digest) =
            compute_bundle_digests(&[&encryption_headers[..], &ciphertext[..], &mac[..]]);
        let length =
            (encryption_headers.len() + ciphertext.len() + mac.len()) as u64;

        Ok(AnnotatedBundleData {
            manifest: self.manifest,
            encryption_headers: Bytes::from(encryption_headers),
            data: Bytes::from(ciphertext),
            mac: Bytes::from(mac),
            annotations: BundleAnnotations {
                sha256_linear_digest,
                sha256_tree_digest,
                length,
                ..Default::default()
            },
        })
    }
}

/// A finished bundle plus everything the rest of the pipeline needs to
/// know about it: the manifest, the three on-wire segments, and the
/// catalog/upload annotations. The segments are cheaply cloneable so the
/// upload stage can stream them without buffering a second copy.
pub struct AnnotatedBundleData {
    pub manifest: BundleManifest,
    pub encryption_headers: Bytes,
    pub data: Bytes,
    pub mac: Bytes,
    pub annotations: BundleAnnotations,
}

impl AnnotatedBundleData {
    /// The actual file contents, as sequential segments. No concatenated
    /// copy is ever made; spooling and uploading both iterate these.
    pub fn file_contents(&self) -> Vec<&[u8]> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(3);
        if !self.encryption_headers.is_empty() {
            parts.push(&self.encryption_headers);
        }
        parts.push(&self.data);
        if !self.mac.is_empty() {
            parts.push(&self.mac);
        }
        parts
    }

    pub fn file_contents_size(&self) -> u64 {
        self.annotations.length
    }

    /// Stable unique name, derived from the content digest. Used for the
    /// spool file and as the upload description.
    pub fn unique_filename(&self) -> String {
        format!("bundle_{}", self.annotations.sha256_linear_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pex_key_config::KeyDerivation;

    fn keying() -> KeyingData {
        KeyingData {
            encryption_key: [3u8; 32],
            mac_key: [4u8; 32],
            derivation: KeyDerivation::None,
        }
    }

    fn block(id: i64, data: &[u8]) -> Block {
        Block {
            id: Some(id),
            sha1_digest: sha1_hex(data),
            length: data.len() as u64,
        }
    }

    #[test]
    fn empty_bundle_refuses_finalize() {
        let bundle = Bundle::new();
        assert!(bundle.is_empty());
        assert!(bundle.finalize(0).is_err());
    }

    #[test]
    fn container_contains_payload_and_manifest_files() {
        let mut bundle = Bundle::new();
        bundle.start_new_payload(CompressionType::None, 7).unwrap();
        bundle.add_block_record(&block(1, b"contents")).unwrap();
        bundle.append_block_contents(b"contents").unwrap();
        let finalized = bundle.finalize(7).unwrap();

        assert_eq!(finalized.manifest.payloads.len(), 1);
        assert_eq!(finalized.manifest.payloads[0].offset, 0);
        assert_eq!(finalized.manifest.block_count(), 1);

        let container = &finalized.container;
        assert_eq!(container.len() % 512, 0);
        assert_eq!(&container[..13], b"payload_0.dat");
        // payload data sits in the block after its header
        assert_eq!(&container[512..520], b"contents");
        // next file entry starts on the following block boundary
        assert_eq!(&container[1024..1024 + 13], b"manifest.pbuf");
    }

    #[test]
    fn annotations_match_file_contents() {
        let mut bundle = Bundle::new();
        bundle.start_new_payload(CompressionType::None, 0).unwrap();
        bundle.add_block_record(&block(1, b"abc")).unwrap();
        bundle.append_block_contents(b"abc").unwrap();
        let sealed = bundle
            .finalize(0)
            .unwrap()
            .seal(EncryptionType::Aes256Gcm, &keying())
            .unwrap();

        let parts = sealed.file_contents();
        assert_eq!(parts.len(), 3);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total as u64, sealed.file_contents_size());

        let (linear, tree) = compute_bundle_digests(&parts);
        assert_eq!(linear, sealed.annotations.sha256_linear_digest);
        assert_eq!(tree, sealed.annotations.sha256_tree_digest);
        assert!(sealed
            .unique_filename()
            .starts_with("bundle_"));
    }

    #[test]
    fn unencrypted_seal_is_bare_container() {
        let mut bundle = Bundle::new();
        bundle.start_new_payload(CompressionType::None, 0).unwrap();
        bundle.add_block_record(&block(1, b"xyz")).unwrap();
        bundle.append_block_contents(b"xyz").unwrap();
        let sealed = bundle
            .finalize(0)
            .unwrap()
            .seal(EncryptionType::None, &keying())
            .unwrap();

        assert!(sealed.encryption_headers.is_empty());
        assert!(sealed.mac.is_empty());
        assert_eq!(sealed.file_contents().len(), 1);
        assert_eq!(&sealed.data[..13], b"payload_0.dat");
    }

    #[test]
    fn second_payload_offset_is_recorded() {
        let mut bundle = Bundle::new();
        bundle.start_new_payload(CompressionType::None, 0).unwrap();
        bundle.add_block_record(&block(1, b"first")).unwrap();
        bundle.append_block_contents(b"first").unwrap();
        bundle.start_new_payload(CompressionType::None, 0).unwrap();
        bundle.add_block_record(&block(2, b"second")).unwrap();
        bundle.append_block_contents(b"second").unwrap();
        let finalized = bundle.finalize(0).unwrap();

        assert_eq!(finalized.manifest.payloads[0].offset, 0);
        // first payload: header block + one padded data block
        assert_eq!(finalized.manifest.payloads[1].offset, 1024);
        assert_eq!(finalized.manifest.payloads[1].id, 1);
    }

    #[test]
    fn block_without_id_is_rejected() {
        let mut bundle = Bundle::new();
        bundle.start_new_payload(CompressionType::None, 0).unwrap();
        let unrecorded = Block {
            id: None,
            sha1_digest: "00".to_string(),
            length: 1,
        };
        assert!(bundle.add_block_record(&unrecorded).is_err());
    }
}
