//! Polar Express — a client that backs up a local directory tree to a
//! cold-storage archive service.
//!
//! The core is a staged asynchronous pipeline: a filesystem scanner
//! feeds a snapshot stage, which feeds a bundle stage, which feeds an
//! upload stage, with weighted backpressure between stages and a shared
//! metadata catalog for deduplication. See the `pex-datastore`,
//! `pex-client`, `pex-key-config` and `pex-api-types` crates for the
//! storage format, the archive-service protocol, key handling, and the
//! data model.

pub mod backup;
pub mod bundle_stage;
pub mod catalog_client;
pub mod config;
pub mod executor;
pub mod pool;
pub mod scanner;
pub mod snapshot_stage;
pub mod upload_stage;

pub use backup::{BackupCounters, BackupExecutor};
pub use executor::{ResourceClass, Scheduler, Strand};
