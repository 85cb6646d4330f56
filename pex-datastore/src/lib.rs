//! Bundle storage layer for Polar Express.
//!
//! A *bundle* is the unit of upload: one or more compressed payloads of
//! deduplicated file blocks, packed into a TAR container together with a
//! protobuf manifest, then encrypted and content-addressed by SHA-256
//! linear and tree digests. This crate owns that on-disk format end to
//! end, plus the fixed-size chunker that feeds it and the SQLite metadata
//! catalog that deduplicates blocks across snapshots and runs.

pub mod bundle;
pub mod bundle_hasher;
pub mod catalog;
pub mod chunker;
pub mod compressor;
pub mod cryptor;
pub mod file_formats;
pub mod spool;
pub mod tar_builder;

pub use bundle::{AnnotatedBundleData, Bundle, FinalizedBundle};
pub use catalog::MetadataCatalog;
pub use chunker::{hash_file_chunks, DEFAULT_BLOCK_SIZE};
pub use compressor::Compressor;
pub use cryptor::{Cryptor, EncryptionType};
