//! Core data model types shared by the Polar Express backup pipeline.
//!
//! These map one to one onto the rows of the metadata catalog. Identifiers
//! are assigned by the catalog on first recording; a `None` id means the
//! entity has not been persisted yet.

use serde::{Deserialize, Serialize};

mod manifest;

pub use manifest::{BlockRecord, BundleManifest, BundlePayload, CompressionType};

/// A file under the backup root, addressed by its root-relative path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: Option<i64>,
    pub path: String,
}

/// Ownership and permission metadata, deduplicated across files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub id: Option<i64>,
    pub owner_user: String,
    pub owner_group: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// A fixed-size span of file bytes, identified by (SHA-1, length).
///
/// Two blocks with equal digest and length are the same block, across all
/// files and snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Option<i64>,
    /// Lowercase hex SHA-1 of the block bytes.
    pub sha1_digest: String,
    pub length: u64,
}

/// The binding of a block to a position in a file at observation time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Option<i64>,
    pub offset: u64,
    pub block: Block,
    pub observation_time: i64,
}

/// One observation of a file: metadata plus the ordered chunk list.
/// Immutable once recorded in the catalog.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Option<i64>,
    pub file: File,
    pub attributes: Attributes,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub is_regular: bool,
    pub is_deleted: bool,
    /// Lowercase hex SHA-1 of the whole file, unset until the file has
    /// been chunk-hashed.
    pub sha1_digest: Option<String>,
    pub length: u64,
    pub observation_time: i64,
    pub chunks: Vec<Chunk>,
}

impl Snapshot {
    /// Whether two snapshots describe identical file contents.
    ///
    /// Digests count as equal when either side has not been hashed yet;
    /// ctime/mtime/length mismatches are treated as content changes.
    pub fn contents_equal(&self, other: &Snapshot) -> bool {
        self.ctime == other.ctime
            && self.mtime == other.mtime
            && self.is_regular == other.is_regular
            && self.is_deleted == other.is_deleted
            && self.length == other.length
            && match (&self.sha1_digest, &other.sha1_digest) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Whether two snapshots agree on every recorded attribute, content
    /// and non-content alike. A snapshot whose metadata all matches the
    /// previous one needs no new record.
    pub fn all_metadata_equal(&self, other: &Snapshot) -> bool {
        self.attributes.owner_user == other.attributes.owner_user
            && self.attributes.owner_group == other.attributes.owner_group
            && self.attributes.uid == other.attributes.uid
            && self.attributes.gid == other.attributes.gid
            && self.attributes.mode == other.attributes.mode
            && self.atime == other.atime
            && self.contents_equal(other)
    }
}

/// Upload state of a bundle on a particular server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            UploadStatus::Pending => 0,
            UploadStatus::Uploaded => 1,
            UploadStatus::Failed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(UploadStatus::Pending),
            1 => Some(UploadStatus::Uploaded),
            2 => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

impl Default for UploadStatus {
    fn default() -> Self {
        UploadStatus::Pending
    }
}

/// Metadata about a finalized bundle that is not stored inside the bundle
/// itself: the local id, the content digests, where the spool file lives,
/// and what the server said about it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BundleAnnotations {
    pub id: Option<i64>,
    /// Lowercase hex SHA-256 of the complete on-wire byte sequence.
    pub sha256_linear_digest: String,
    /// Lowercase hex Glacier-style tree hash of the same bytes.
    pub sha256_tree_digest: String,
    pub length: u64,
    /// Spool file path; cleared once the upload is recorded and the file
    /// deleted.
    pub persistence_file_path: Option<std::path::PathBuf>,
    /// Server-assigned archive id, empty until uploaded.
    pub server_bundle_id: String,
    pub status: UploadStatus,
    pub status_timestamp: i64,
}
