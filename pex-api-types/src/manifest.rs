//! The bundle manifest, serialized as `manifest.pbuf` inside every bundle
//! container.
//!
//! Wire format is protocol buffers so that a reader in any language can
//! recover the payload layout. The messages are defined with prost derives
//! directly; there is no `.proto` build step.

use prost::Message;

/// Compression applied to a payload stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum CompressionType {
    None = 0,
    Zlib = 1,
}

/// A block as recorded in a payload's manifest entry.
#[derive(Clone, PartialEq, Message)]
pub struct BlockRecord {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Lowercase hex SHA-1 of the block bytes.
    #[prost(string, tag = "2")]
    pub sha1_digest: String,
    #[prost(uint64, tag = "3")]
    pub length: u64,
}

/// One compressed stream of concatenated raw block bytes inside a bundle.
#[derive(Clone, PartialEq, Message)]
pub struct BundlePayload {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Byte offset of the payload's TAR file entry within the container.
    #[prost(uint64, tag = "2")]
    pub offset: u64,
    #[prost(enumeration = "CompressionType", tag = "3")]
    pub compression_type: i32,
    #[prost(message, repeated, tag = "4")]
    pub blocks: Vec<BlockRecord>,
}

/// The full record of what a bundle contains.
#[derive(Clone, PartialEq, Message)]
pub struct BundleManifest {
    #[prost(message, repeated, tag = "1")]
    pub payloads: Vec<BundlePayload>,
}

impl BundleManifest {
    /// Serialize to the bytes stored as `manifest.pbuf`.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        Message::encode_to_vec(self)
    }

    /// Total number of blocks across all payloads.
    pub fn block_count(&self) -> usize {
        self.payloads.iter().map(|p| p.blocks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trip() {
        let manifest = BundleManifest {
            payloads: vec![BundlePayload {
                id: 0,
                offset: 512,
                compression_type: CompressionType::Zlib as i32,
                blocks: vec![BlockRecord {
                    id: 7,
                    sha1_digest: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
                    length: 1048576,
                }],
            }],
        };

        let encoded = manifest.encode_to_vec();
        let decoded = BundleManifest::decode(&encoded[..]).unwrap();
        assert_eq!(manifest, decoded);
        assert_eq!(decoded.block_count(), 1);
    }

    #[test]
    fn empty_manifest_encodes_empty() {
        let manifest = BundleManifest::default();
        assert!(manifest.encode_to_vec().is_empty());
        assert_eq!(manifest.block_count(), 0);
    }
}
