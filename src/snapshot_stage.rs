//! The snapshot stage: one state machine per scanned path.
//!
//! Each machine captures a candidate snapshot of the file's metadata,
//! compares it against the latest recorded snapshot, and — when anything
//! changed — chunk-hashes the contents and records a new snapshot. Only
//! regular, non-empty snapshots flow downstream to the bundle stage.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use anyhow::{format_err, Error};
use futures::future::BoxFuture;

use pex_api_types::{Attributes, File, Snapshot};
use pex_datastore::chunker;

use crate::backup::BackupCounters;
use crate::bundle_stage::BundleStage;
use crate::catalog_client::CatalogClient;
use crate::executor::{ResourceClass, Scheduler};
use crate::pool::{OneShotStage, PersistentPool};

pub const DEFAULT_MAX_PENDING_PATHS: u64 = 5000;
pub const DEFAULT_MAX_SIMULTANEOUS_SNAPSHOTS: usize = 20;

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn owner_user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_default()
}

fn owner_group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
        .unwrap_or_default()
}

/// Capture platform metadata for `path` into a candidate snapshot. Runs
/// on the Disk class.
fn generate_candidate_snapshot(root: &Path, path: &Path) -> Result<Snapshot, Error> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| format_err!("path {:?} is outside the backup root", path))?
        .to_string_lossy()
        .into_owned();
    if relative.is_empty() {
        return Err(format_err!("refusing to snapshot the backup root itself"));
    }

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // The file vanished between scan and snapshot.
            return Ok(Snapshot {
                file: File {
                    id: None,
                    path: relative,
                },
                is_deleted: true,
                observation_time: epoch_now(),
                ..Default::default()
            });
        }
        Err(err) => return Err(format_err!("unable to stat {:?} - {}", path, err)),
    };

    let is_regular = metadata.file_type().is_file();
    Ok(Snapshot {
        id: None,
        file: File {
            id: None,
            path: relative,
        },
        attributes: Attributes {
            id: None,
            owner_user: owner_user_name(metadata.uid()),
            owner_group: owner_group_name(metadata.gid()),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode() & 0o7777,
        },
        ctime: metadata.ctime(),
        mtime: metadata.mtime(),
        atime: metadata.atime(),
        is_regular,
        is_deleted: false,
        sha1_digest: None,
        length: if is_regular { metadata.len() } else { 0 },
        observation_time: epoch_now(),
        chunks: Vec::new(),
    })
}

pub struct SnapshotStage {
    scheduler: Arc<Scheduler>,
    catalog: Arc<CatalogClient>,
    counters: Arc<BackupCounters>,
    root: PathBuf,
    block_size: usize,
    max_pending_bundle_bytes: u64,
    next_pool: OnceLock<Arc<PersistentPool<BundleStage>>>,
    need_more_input: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl SnapshotStage {
    pub fn new(
        scheduler: Arc<Scheduler>,
        catalog: Arc<CatalogClient>,
        counters: Arc<BackupCounters>,
        root: PathBuf,
        block_size: usize,
        max_pending_bundle_bytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            catalog,
            counters,
            root,
            block_size,
            max_pending_bundle_bytes,
            next_pool: OnceLock::new(),
            need_more_input: OnceLock::new(),
        })
    }

    pub fn set_next_pool(&self, next: Arc<PersistentPool<BundleStage>>) {
        let _ = self.next_pool.set(next);
    }

    pub fn set_need_more_input_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        let _ = self.need_more_input.set(callback);
    }

    async fn process_path(self: Arc<Self>, path: PathBuf, _size: u64) -> Option<Snapshot> {
        let root = self.root.clone();
        let candidate_path = path.clone();
        let mut candidate = match self
            .scheduler
            .run(ResourceClass::Disk, move || {
                generate_candidate_snapshot(&root, &candidate_path)
            })
            .await
        {
            Ok(Ok(candidate)) => candidate,
            Ok(Err(err)) | Err(err) => {
                log::warn!("snapshot of {:?} failed: {}", path, err);
                return None;
            }
        };

        let previous = match self
            .catalog
            .get_latest_snapshot(candidate.file.path.clone())
            .await
        {
            Ok(previous) => previous,
            Err(err) => {
                log::error!(
                    "catalog lookup for {:?} failed: {}",
                    candidate.file.path,
                    err
                );
                return None;
            }
        };

        if let Some(previous) = &previous {
            if candidate.all_metadata_equal(previous) {
                return None;
            }
        }

        if candidate.is_regular && candidate.length > 0 {
            let file_path = path.clone();
            let block_size = self.block_size;
            let observation_time = candidate.observation_time;
            let hashed = self
                .scheduler
                .run(ResourceClass::Disk, move || {
                    chunker::hash_file_chunks(&file_path, block_size, observation_time)
                })
                .await;
            match hashed {
                Ok(Ok(hashed)) => {
                    candidate.chunks = hashed.chunks;
                    candidate.sha1_digest = Some(hashed.whole_file_sha1);
                }
                Ok(Err(err)) | Err(err) => {
                    log::warn!("chunk hashing of {:?} failed: {}", path, err);
                    return None;
                }
            }
        }

        match self.catalog.record_new_snapshot(candidate).await {
            Ok(recorded) => Some(recorded),
            Err(err) => {
                log::error!("recording snapshot of {:?} failed: {}", path, err);
                None
            }
        }
    }
}

impl OneShotStage for SnapshotStage {
    type Input = (PathBuf, u64);
    type Output = Snapshot;

    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn projected_output_weight(&self, input: &(PathBuf, u64)) -> u64 {
        input.1.max(1).min(self.max_pending_bundle_bytes)
    }

    fn run(self: Arc<Self>, input: (PathBuf, u64)) -> BoxFuture<'static, Option<Snapshot>> {
        let counters = Arc::clone(&self.counters);
        Box::pin(async move {
            let (path, size) = input;
            let snapshot = self.process_path(path, size).await;
            counters.files_processed.fetch_add(1, Ordering::Relaxed);
            counters.files_bytes.fetch_add(size, Ordering::Relaxed);
            snapshot
        })
    }

    fn handle_result(&self, snapshot: Snapshot) {
        // Non-regular and empty files are recorded but never bundled.
        if snapshot.is_regular && snapshot.length > 0 {
            self.counters
                .snapshots_generated
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .snapshots_bytes
                .fetch_add(snapshot.length, Ordering::Relaxed);
            if let Some(next) = self.next_pool.get() {
                let weight = snapshot.length.min(self.max_pending_bundle_bytes);
                next.add_new_input(Arc::new(snapshot), weight);
            }
        }
    }

    fn need_more_input(&self) {
        if let Some(callback) = self.need_more_input.get() {
            callback();
        }
    }
}
