//! The backup executor: wires the scanner and the three pipeline stages
//! together and drives the run.
//!
//! The scanner feeds the snapshot pool in sections; the snapshot pool
//! asks for the next section when its queue drains below half. Snapshots
//! flow to the bundle pool, bundles to the upload pool. Once the scan is
//! exhausted and every pool drains, termination cascades down the chain
//! and the scheduler's master work counter reaches zero.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Error;

use pex_datastore::MetadataCatalog;
use pex_key_config::KeyingData;

use crate::bundle_stage::{BundleStage, BundleStageConfig};
use crate::catalog_client::CatalogClient;
use crate::executor::{ResourceClass, Scheduler, Strand};
use crate::pool::{OneShotPool, PersistentPool, PoolLink};
use crate::scanner::FilesystemScanner;
use crate::snapshot_stage::{
    SnapshotStage, DEFAULT_MAX_PENDING_PATHS, DEFAULT_MAX_SIMULTANEOUS_SNAPSHOTS,
};
use crate::upload_stage::{UploadStage, UploadStageConfig};

/// Run totals, updated by the stages and read after the run completes.
#[derive(Default)]
pub struct BackupCounters {
    pub files_processed: AtomicU64,
    pub files_bytes: AtomicU64,
    pub snapshots_generated: AtomicU64,
    pub snapshots_bytes: AtomicU64,
    pub bundles_generated: AtomicU64,
    pub bundles_bytes: AtomicU64,
    pub bundles_uploaded: AtomicU64,
    pub uploaded_bytes: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    NotStarted,
    InProgress,
    WaitingToContinue,
    Finished,
}

pub struct BackupExecutor {
    state_machine_strand: Strand,
    disk_strand: Strand,
    scanner: Arc<Mutex<FilesystemScanner>>,
    snapshot_pool: Arc<OneShotPool<SnapshotStage>>,
    counters: Arc<BackupCounters>,
    scan_state: Mutex<ScanState>,
    root: PathBuf,
    scan_section_size: usize,
    self_weak: OnceLock<Weak<Self>>,
}

impl BackupExecutor {
    pub fn new(
        scheduler: Arc<Scheduler>,
        catalog: MetadataCatalog,
        keying: KeyingData,
        root: PathBuf,
        block_size: usize,
        bundle_config: BundleStageConfig,
        upload_config: UploadStageConfig,
    ) -> Result<Arc<Self>, Error> {
        let counters = Arc::new(BackupCounters::default());
        let state_machine_strand = scheduler.new_strand(ResourceClass::StateMachine);
        let disk_strand = scheduler.new_strand(ResourceClass::Disk);

        let catalog_client = CatalogClient::new(disk_strand.clone(), catalog);

        let upload_stage = UploadStage::new(
            Arc::clone(&scheduler),
            Arc::clone(&catalog_client),
            Arc::clone(&counters),
            upload_config.clone(),
        );
        let upload_pool = PersistentPool::new(
            upload_stage,
            state_machine_strand.clone(),
            Arc::clone(&scheduler),
            ResourceClass::UplinkNetwork,
            upload_config.max_pending_bundles,
            upload_config.max_simultaneous_uploads,
        );

        let bundle_stage = BundleStage::new(
            Arc::clone(&scheduler),
            Arc::clone(&catalog_client),
            Arc::clone(&counters),
            Arc::new(keying),
            bundle_config.clone(),
            root.clone(),
        );
        bundle_stage.set_next_pool(Arc::clone(&upload_pool));
        let bundle_pool = PersistentPool::new(
            bundle_stage,
            state_machine_strand.clone(),
            Arc::clone(&scheduler),
            ResourceClass::StateMachine,
            bundle_config.max_pending_bundle_bytes,
            bundle_config.max_simultaneous_bundles,
        );

        let snapshot_stage = SnapshotStage::new(
            Arc::clone(&scheduler),
            Arc::clone(&catalog_client),
            Arc::clone(&counters),
            root.clone(),
            block_size,
            bundle_config.max_pending_bundle_bytes,
        );
        snapshot_stage.set_next_pool(Arc::clone(&bundle_pool));
        let snapshot_pool = OneShotPool::new(
            Arc::clone(&snapshot_stage),
            state_machine_strand.clone(),
            Arc::clone(&scheduler),
            ResourceClass::StateMachine,
            DEFAULT_MAX_PENDING_PATHS,
            DEFAULT_MAX_SIMULTANEOUS_SNAPSHOTS,
        );

        snapshot_pool.set_next_pool(Arc::clone(&bundle_pool) as Arc<dyn PoolLink>);
        bundle_pool.set_preceding_pool(&(Arc::clone(&snapshot_pool) as Arc<dyn PoolLink>));
        bundle_pool.set_next_pool(Arc::clone(&upload_pool) as Arc<dyn PoolLink>);
        upload_pool.set_preceding_pool(&(Arc::clone(&bundle_pool) as Arc<dyn PoolLink>));

        let scan_section_size = (DEFAULT_MAX_PENDING_PATHS / 2) as usize;
        let executor = Arc::new(Self {
            state_machine_strand,
            disk_strand,
            scanner: Arc::new(Mutex::new(FilesystemScanner::new())),
            snapshot_pool,
            counters,
            scan_state: Mutex::new(ScanState::NotStarted),
            root,
            scan_section_size,
            self_weak: OnceLock::new(),
        });
        let _ = executor.self_weak.set(Arc::downgrade(&executor));

        let weak = Arc::downgrade(&executor);
        snapshot_stage.set_need_more_input_callback(Box::new(move || {
            if let Some(executor) = weak.upgrade() {
                executor.try_continue_scan();
            }
        }));

        Ok(executor)
    }

    /// Start the backup. Returns immediately; completion is observed via
    /// [`Scheduler::wait_for_finish`].
    pub fn start(&self) {
        {
            let mut state = self.scan_state.lock().unwrap();
            assert!(*state == ScanState::NotStarted, "backup already started");
            *state = ScanState::InProgress;
        }
        log::info!("starting backup of {:?}", self.root);
        self.post_scan(true);
    }

    pub fn counters(&self) -> Arc<BackupCounters> {
        Arc::clone(&self.counters)
    }

    fn post_scan(&self, first: bool) {
        let executor = match self.self_weak.get().and_then(Weak::upgrade) {
            Some(executor) => executor,
            None => return,
        };
        let scanner = Arc::clone(&self.scanner);
        let strand = self.state_machine_strand.clone();
        let root = self.root.clone();
        let section_size = self.scan_section_size;

        self.disk_strand.post(async move {
            let paths = {
                let mut scanner = scanner.lock().unwrap();
                if first {
                    scanner.start_scan(&root, section_size);
                } else {
                    scanner.continue_scan(section_size);
                }
                let paths = scanner.get_paths_with_size().to_vec();
                scanner.clear_paths();
                paths
            };
            strand.post(async move { executor.handle_scan_section(paths) });
        });
    }

    fn handle_scan_section(&self, paths: Vec<(PathBuf, u64)>) {
        if paths.is_empty() {
            log::debug!("filesystem scan finished");
            *self.scan_state.lock().unwrap() = ScanState::Finished;
            self.snapshot_pool.notify_input_finished();
            return;
        }

        log::debug!("scanned a section of {} paths", paths.len());
        *self.scan_state.lock().unwrap() = ScanState::WaitingToContinue;
        for (path, size) in paths {
            self.snapshot_pool.add_new_input((path, size), 1);
        }
    }

    fn try_continue_scan(&self) {
        {
            let mut state = self.scan_state.lock().unwrap();
            if *state != ScanState::WaitingToContinue {
                return;
            }
            *state = ScanState::InProgress;
        }
        self.post_scan(false);
    }
}
