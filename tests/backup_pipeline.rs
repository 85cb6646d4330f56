// Drives the scanner → snapshot → bundle pipeline against a real
// directory and a real catalog, without the upload stage (bundles stop
// at the spool). Covers the dedup and idempotence behavior the catalog
// exists for.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use pex_api_types::UploadStatus;
use pex_datastore::bundle::AnnotatedBundleData;
use pex_datastore::MetadataCatalog;
use pex_key_config::{KeyDerivation, KeyingData};

use polar_express::backup::BackupCounters;
use polar_express::bundle_stage::{BundleStage, BundleStageConfig};
use polar_express::catalog_client::CatalogClient;
use polar_express::executor::{ResourceClass, Scheduler};
use polar_express::pool::{OneShotPool, PersistentPool, PoolLink};
use polar_express::snapshot_stage::SnapshotStage;

const TEST_BLOCK_SIZE: usize = 1024;

fn test_keying() -> KeyingData {
    KeyingData {
        encryption_key: [9u8; 32],
        mac_key: [8u8; 32],
        derivation: KeyDerivation::None,
    }
}

// One full pipeline run over `root`, bundles spooled into `spool_dir`.
fn run_backup(root: &Path, catalog_path: &Path, spool_dir: &Path) -> Arc<BackupCounters> {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let strand = scheduler.new_strand(ResourceClass::StateMachine);
    let disk_strand = scheduler.new_strand(ResourceClass::Disk);

    let catalog = MetadataCatalog::open(catalog_path).unwrap();
    let catalog_client = CatalogClient::new(disk_strand, catalog);
    let counters = Arc::new(BackupCounters::default());

    let bundle_config = BundleStageConfig {
        spool_dir: spool_dir.to_path_buf(),
        ..Default::default()
    };

    let bundle_stage = BundleStage::new(
        Arc::clone(&scheduler),
        Arc::clone(&catalog_client),
        Arc::clone(&counters),
        Arc::new(test_keying()),
        bundle_config.clone(),
        root.to_path_buf(),
    );
    let bundle_pool = PersistentPool::new(
        bundle_stage,
        strand.clone(),
        Arc::clone(&scheduler),
        ResourceClass::StateMachine,
        bundle_config.max_pending_bundle_bytes,
        bundle_config.max_simultaneous_bundles,
    );

    let snapshot_stage = SnapshotStage::new(
        Arc::clone(&scheduler),
        catalog_client,
        Arc::clone(&counters),
        root.to_path_buf(),
        TEST_BLOCK_SIZE,
        bundle_config.max_pending_bundle_bytes,
    );
    snapshot_stage.set_next_pool(Arc::clone(&bundle_pool));
    let snapshot_pool = OneShotPool::new(
        snapshot_stage,
        strand,
        Arc::clone(&scheduler),
        ResourceClass::StateMachine,
        100,
        4,
    );
    snapshot_pool.set_next_pool(Arc::clone(&bundle_pool) as Arc<dyn PoolLink>);
    bundle_pool.set_preceding_pool(&(Arc::clone(&snapshot_pool) as Arc<dyn PoolLink>));

    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let size = entry.metadata().unwrap().len();
            snapshot_pool.add_new_input((entry.into_path(), size), 1);
        }
    }
    snapshot_pool.notify_input_finished();

    scheduler.wait_for_finish();
    counters
}

// Mark the given bundle row as uploaded, the way the upload stage
// records success.
fn mark_uploaded(catalog_path: &Path, bundle_id: i64) {
    let mut catalog = MetadataCatalog::open(catalog_path).unwrap();
    let mut bundle = AnnotatedBundleData {
        manifest: Default::default(),
        encryption_headers: bytes::Bytes::new(),
        data: bytes::Bytes::new(),
        mac: bytes::Bytes::new(),
        annotations: Default::default(),
    };
    bundle.annotations.id = Some(bundle_id);
    bundle.annotations.server_bundle_id = format!("archive-{}", bundle_id);
    bundle.annotations.status = UploadStatus::Uploaded;
    bundle.annotations.status_timestamp = 12345;
    catalog.record_uploaded_bundle(1, &bundle).unwrap();
}

fn spool_files(spool_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(spool_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

#[test]
fn single_small_file_produces_one_bundle() {
    let root = tempfile::tempdir().unwrap();
    let spool = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let catalog_path = state.path().join("metadata.db");

    std::fs::write(root.path().join("hello.txt"), b"Hello, world!\n\n").unwrap();

    let counters = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(counters.files_processed.load(Relaxed), 1);
    assert_eq!(counters.snapshots_generated.load(Relaxed), 1);
    assert_eq!(counters.bundles_generated.load(Relaxed), 1);

    // the recorded snapshot carries length and whole-file digest
    let catalog = MetadataCatalog::open(&catalog_path).unwrap();
    let snapshot = catalog.get_latest_snapshot("hello.txt").unwrap().unwrap();
    assert_eq!(snapshot.length, 15);
    assert_eq!(
        snapshot.sha1_digest.as_deref(),
        Some(pex_datastore::chunker::sha1_hex(b"Hello, world!\n\n").as_str())
    );

    // exactly one spool file, named by its own linear digest
    let files = spool_files(spool.path());
    assert_eq!(files.len(), 1);
    let contents = std::fs::read(&files[0]).unwrap();
    let digest = hex::encode(openssl::sha::sha256(&contents));
    assert_eq!(
        files[0].file_name().unwrap().to_string_lossy(),
        format!("bundle_{}", digest)
    );
}

#[test]
fn unchanged_rerun_generates_nothing() {
    let root = tempfile::tempdir().unwrap();
    let spool = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let catalog_path = state.path().join("metadata.db");

    for i in 0..3 {
        std::fs::write(
            root.path().join(format!("file{}.dat", i)),
            format!("contents of file number {}", i),
        )
        .unwrap();
    }

    let first = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(first.files_processed.load(Relaxed), 3);
    assert_eq!(first.snapshots_generated.load(Relaxed), 3);
    assert!(first.bundles_generated.load(Relaxed) >= 1);

    // second run over the unchanged tree: every file is visited, the
    // content-equal rule suppresses all new snapshots and bundles
    let second = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(second.files_processed.load(Relaxed), 3);
    assert_eq!(second.snapshots_generated.load(Relaxed), 0);
    assert_eq!(second.bundles_generated.load(Relaxed), 0);
}

#[test]
fn touched_file_snapshots_but_dedups_blocks() {
    let root = tempfile::tempdir().unwrap();
    let spool = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let catalog_path = state.path().join("metadata.db");

    let file_path = root.path().join("stable.dat");
    std::fs::write(&file_path, vec![7u8; 2500]).unwrap();

    let first = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(first.bundles_generated.load(Relaxed), 1);
    mark_uploaded(&catalog_path, 1);

    // touch the file: metadata changes, contents do not
    let metadata = std::fs::metadata(&file_path).unwrap();
    use std::os::unix::fs::MetadataExt;
    let mtime = nix::sys::time::TimeVal::new(metadata.mtime(), 0);
    let new_atime = nix::sys::time::TimeVal::new(metadata.atime() + 1000, 0);
    nix::sys::stat::utimes(&file_path, &new_atime, &mtime).unwrap();

    // a new snapshot is recorded (metadata changed) but every block is
    // already in an uploaded bundle, so no new bundle appears
    let second = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(second.snapshots_generated.load(Relaxed), 1);
    assert_eq!(second.bundles_generated.load(Relaxed), 0);
}

#[test]
fn mutated_file_produces_exactly_one_new_bundle() {
    let root = tempfile::tempdir().unwrap();
    let spool = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let catalog_path = state.path().join("metadata.db");

    std::fs::write(root.path().join("a.dat"), vec![1u8; 2000]).unwrap();
    std::fs::write(root.path().join("b.dat"), vec![2u8; 2000]).unwrap();

    let first = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(first.snapshots_generated.load(Relaxed), 2);
    assert_eq!(first.bundles_generated.load(Relaxed), 1);
    mark_uploaded(&catalog_path, 1);

    std::fs::write(root.path().join("a.dat"), vec![3u8; 2000]).unwrap();

    let second = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(second.snapshots_generated.load(Relaxed), 1);
    assert_eq!(second.bundles_generated.load(Relaxed), 1);
}

#[test]
fn empty_file_is_snapshotted_but_not_bundled() {
    let root = tempfile::tempdir().unwrap();
    let spool = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let catalog_path = state.path().join("metadata.db");

    std::fs::write(root.path().join("empty.dat"), b"").unwrap();

    let counters = run_backup(root.path(), &catalog_path, spool.path());
    assert_eq!(counters.files_processed.load(Relaxed), 1);
    // recorded, but zero-length snapshots are not sent downstream
    assert_eq!(counters.snapshots_generated.load(Relaxed), 0);
    assert_eq!(counters.bundles_generated.load(Relaxed), 0);

    let catalog = MetadataCatalog::open(&catalog_path).unwrap();
    let snapshot = catalog.get_latest_snapshot("empty.dat").unwrap().unwrap();
    assert_eq!(snapshot.length, 0);
    assert!(snapshot.is_regular);
}
