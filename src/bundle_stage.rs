//! The bundle stage: persistent machines that pack changed blocks into
//! compressed, encrypted, content-addressed bundles.
//!
//! Each machine builds one bundle at a time. Chunks of an incoming
//! snapshot are queued; each chunk is deduplicated against the catalog
//! and the bundle under construction, read back from disk, verified
//! against its recorded SHA-1, compressed and appended. When the bundle
//! reaches its size cap it is finalized, sealed, spooled and recorded,
//! and leftover chunks are drained before the machine accepts another
//! snapshot.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{format_err, Error};
use futures::future::BoxFuture;

use pex_api_types::{CompressionType, Snapshot};
use pex_datastore::bundle::{AnnotatedBundleData, Bundle};
use pex_datastore::chunker;
use pex_datastore::compressor::Compressor;
use pex_datastore::cryptor::EncryptionType;
use pex_datastore::spool;
use pex_key_config::KeyingData;

use crate::backup::BackupCounters;
use crate::catalog_client::CatalogClient;
use crate::executor::{ResourceClass, Scheduler};
use crate::pool::{InputDoneAction, MachineStep, PersistentPool, PersistentStage, PoolLink};
use crate::upload_stage::UploadStage;

pub const DEFAULT_MAX_BUNDLE_BYTES: usize = 20 * (1 << 20);
pub const DEFAULT_MAX_PENDING_BUNDLE_BYTES: u64 = 40 * (1 << 20);
pub const DEFAULT_MAX_SIMULTANEOUS_BUNDLES: usize = 3;
pub const DEFAULT_MAX_UPSTREAM_IDLE_SECONDS: i64 = 30;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct BundleStageConfig {
    pub max_bundle_bytes: usize,
    pub max_pending_bundle_bytes: u64,
    pub max_simultaneous_bundles: usize,
    pub max_upstream_idle_seconds: i64,
    pub compression_type: CompressionType,
    pub compression_level: u32,
    pub encryption_type: EncryptionType,
    pub spool_dir: PathBuf,
}

impl Default for BundleStageConfig {
    fn default() -> Self {
        Self {
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
            max_pending_bundle_bytes: DEFAULT_MAX_PENDING_BUNDLE_BYTES,
            max_simultaneous_bundles: DEFAULT_MAX_SIMULTANEOUS_BUNDLES,
            max_upstream_idle_seconds: DEFAULT_MAX_UPSTREAM_IDLE_SECONDS,
            compression_type: CompressionType::Zlib,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            encryption_type: EncryptionType::Aes256Gcm,
            spool_dir: spool::default_spool_dir(),
        }
    }
}

// A queued chunk keeps its snapshot alive; the snapshot's reference is
// released when its last chunk leaves the queue.
struct PendingChunk {
    snapshot: Arc<Snapshot>,
    chunk_index: usize,
}

pub struct BundleMachine {
    bundle: Bundle,
    compressor: Option<Compressor>,
    block_ids_in_bundle: HashSet<i64>,
    pending_chunks: VecDeque<PendingChunk>,
}

impl BundleMachine {
    fn has_partial_bundle(&self) -> bool {
        !self.bundle.is_empty()
    }
}

pub struct BundleStage {
    scheduler: Arc<Scheduler>,
    catalog: Arc<CatalogClient>,
    counters: Arc<BackupCounters>,
    keying: Arc<KeyingData>,
    config: BundleStageConfig,
    root: PathBuf,
    next_pool: OnceLock<Arc<PersistentPool<UploadStage>>>,
    last_bundle_generated: AtomicI64,
}

impl BundleStage {
    pub fn new(
        scheduler: Arc<Scheduler>,
        catalog: Arc<CatalogClient>,
        counters: Arc<BackupCounters>,
        keying: Arc<KeyingData>,
        config: BundleStageConfig,
        root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            catalog,
            counters,
            keying,
            config,
            root,
            next_pool: OnceLock::new(),
            last_bundle_generated: AtomicI64::new(0),
        })
    }

    pub fn set_next_pool(&self, next: Arc<PersistentPool<UploadStage>>) {
        let _ = self.next_pool.set(next);
    }

    fn fresh_compressor(&self) -> Compressor {
        Compressor::new(self.config.compression_type, self.config.compression_level)
    }

    // Discard a bundle whose build failed; the machine starts over with
    // a clean container and compression stream.
    fn reset_machine(&self, machine: &mut BundleMachine) {
        machine.bundle = Bundle::new();
        machine.block_ids_in_bundle.clear();
        machine.compressor = Some(self.fresh_compressor());
    }

    async fn should_skip_chunk(&self, block: &pex_api_types::Block) -> bool {
        match self.catalog.get_latest_bundle_for_block(block.clone()).await {
            Ok(Some(existing)) => {
                log::debug!(
                    "block {} already in bundle {:?}; discarding chunk",
                    block.sha1_digest,
                    existing.id
                );
                true
            }
            Ok(None) => false,
            Err(err) => {
                // On a lookup failure we bundle the block anyway; a
                // duplicate upload is harmless, a lost block is not.
                log::error!(
                    "bundle lookup for block {} failed: {}",
                    block.sha1_digest,
                    err
                );
                false
            }
        }
    }

    /// Verify and compress one chunk's bytes on the CPU class. The
    /// compressor travels through the closure so the stream state stays
    /// with the machine.
    async fn verify_and_compress(
        &self,
        compressor: Compressor,
        data: Vec<u8>,
        expected_sha1: String,
    ) -> Result<(Compressor, Option<Vec<u8>>), Error> {
        self.scheduler
            .run(ResourceClass::Cpu, move || {
                if chunker::sha1_hex(&data) != expected_sha1 {
                    return (compressor, None);
                }
                let mut compressor = compressor;
                let mut out = Vec::new();
                match compressor.compress(&data, &mut out) {
                    Ok(()) => (compressor, Some(out)),
                    Err(err) => {
                        log::error!("compression failed: {}", err);
                        (compressor, None)
                    }
                }
            })
            .await
    }

    /// Finalize, seal, spool and record the machine's current bundle.
    /// `Ok(None)` means the bundle was empty and there is nothing to
    /// emit.
    async fn finalize_current_bundle(
        &self,
        machine: &mut BundleMachine,
    ) -> Result<Option<AnnotatedBundleData>, Error> {
        if !machine.has_partial_bundle() {
            return Ok(None);
        }

        let bundle = std::mem::take(&mut machine.bundle);
        let compressor = machine
            .compressor
            .take()
            .ok_or_else(|| format_err!("bundle machine lost its compressor"))?;
        machine.block_ids_in_bundle.clear();

        let keying = Arc::clone(&self.keying);
        let encryption_type = self.config.encryption_type;
        let mtime = epoch_now();
        let sealed = self
            .scheduler
            .run(ResourceClass::Cpu, move || -> Result<_, Error> {
                let mut compressor = compressor;
                let mut bundle = bundle;
                let mut tail = Vec::new();
                compressor.finalize(&mut tail)?;
                bundle.append_block_contents(&tail)?;
                let sealed = bundle.finalize(mtime)?.seal(encryption_type, &keying)?;
                Ok((compressor, sealed))
            })
            .await?;
        let (compressor, mut sealed) = match sealed {
            Ok(result) => result,
            Err(err) => {
                self.reset_machine(machine);
                return Err(err);
            }
        };
        machine.compressor = Some(compressor);

        let spool_dir = self.config.spool_dir.clone();
        let spooled = self
            .scheduler
            .run(ResourceClass::Disk, move || -> Result<_, Error> {
                let path = {
                    let parts = sealed.file_contents();
                    spool::write_spool_file(&spool_dir, &sealed.unique_filename(), &parts)?
                };
                sealed.annotations.persistence_file_path = Some(path);
                Ok(sealed)
            })
            .await??;

        let recorded = self.catalog.record_new_bundle(spooled).await?;
        Ok(Some(recorded))
    }

    async fn process_chunks(
        self: Arc<Self>,
        mut machine: BundleMachine,
        flush_at_end: bool,
    ) -> MachineStep<BundleMachine, AnnotatedBundleData> {
        loop {
            let PendingChunk {
                snapshot,
                chunk_index,
            } = match machine.pending_chunks.pop_front() {
                Some(pending) => pending,
                None => {
                    if flush_at_end {
                        return self.flush(machine).await;
                    }
                    return MachineStep::Idle(machine);
                }
            };

            let chunk = &snapshot.chunks[chunk_index];
            let block = &chunk.block;

            let block_id = match block.id {
                Some(id) => id,
                None => {
                    log::warn!(
                        "chunk at {}+{} of {:?} has an unrecorded block; discarding",
                        chunk.offset,
                        block.length,
                        snapshot.file.path
                    );
                    continue;
                }
            };
            if machine.block_ids_in_bundle.contains(&block_id) {
                continue;
            }
            if self.should_skip_chunk(block).await {
                continue;
            }

            let path = self.root.join(&snapshot.file.path);
            let offset = chunk.offset;
            let length = block.length;
            let read = self
                .scheduler
                .run(ResourceClass::Disk, move || {
                    chunker::read_block_at(&path, offset, length)
                })
                .await;
            let data = match read {
                Ok(Ok(data)) => data,
                Ok(Err(err)) | Err(err) => {
                    log::warn!(
                        "unable to read block at {}+{} of {:?}: {}; discarding chunk",
                        offset,
                        length,
                        snapshot.file.path,
                        err
                    );
                    continue;
                }
            };

            let compressor = match machine.compressor.take() {
                Some(compressor) => compressor,
                None => self.fresh_compressor(),
            };
            let (compressor, compressed) = match self
                .verify_and_compress(compressor, data, block.sha1_digest.clone())
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    log::error!("chunk processing task lost: {}", err);
                    self.reset_machine(&mut machine);
                    continue;
                }
            };
            machine.compressor = Some(compressor);

            let compressed = match compressed {
                Some(compressed) => compressed,
                None => {
                    // The file changed under us; the snapshot is already
                    // recorded and will be re-snapshotted next run.
                    log::warn!(
                        "block at {}+{} of {:?} no longer matches its digest; discarding chunk",
                        offset,
                        length,
                        snapshot.file.path
                    );
                    continue;
                }
            };

            let appended = (|| -> Result<(), Error> {
                if machine.bundle.is_empty() {
                    machine
                        .bundle
                        .start_new_payload(self.config.compression_type, epoch_now())?;
                }
                machine.bundle.add_block_record(block)?;
                machine.bundle.append_block_contents(&compressed)?;
                Ok(())
            })();
            if let Err(err) = appended {
                log::error!("appending block to bundle failed: {}", err);
                self.reset_machine(&mut machine);
                continue;
            }
            machine.block_ids_in_bundle.insert(block_id);

            if machine.bundle.size() >= self.config.max_bundle_bytes {
                match self.finalize_current_bundle(&mut machine).await {
                    Ok(Some(output)) => {
                        let continuable = !machine.pending_chunks.is_empty();
                        return MachineStep::Output {
                            machine,
                            output,
                            continuable,
                        };
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::error!("bundle finalization failed: {}", err);
                        self.reset_machine(&mut machine);
                    }
                }
            }
        }
    }

    async fn flush(
        self: Arc<Self>,
        mut machine: BundleMachine,
    ) -> MachineStep<BundleMachine, AnnotatedBundleData> {
        match self.finalize_current_bundle(&mut machine).await {
            Ok(Some(output)) => MachineStep::Output {
                machine,
                output,
                continuable: false,
            },
            Ok(None) => MachineStep::Idle(machine),
            Err(err) => {
                log::error!("bundle flush failed: {}", err);
                self.reset_machine(&mut machine);
                MachineStep::Idle(machine)
            }
        }
    }
}

impl PersistentStage for BundleStage {
    type Machine = BundleMachine;
    type Input = Arc<Snapshot>;
    type Output = AnnotatedBundleData;

    fn name(&self) -> &'static str {
        "bundle"
    }

    fn create_machine(&self) -> BundleMachine {
        BundleMachine {
            bundle: Bundle::new(),
            compressor: Some(self.fresh_compressor()),
            block_ids_in_bundle: HashSet::new(),
            pending_chunks: VecDeque::new(),
        }
    }

    fn run_input(
        self: Arc<Self>,
        mut machine: BundleMachine,
        snapshot: Arc<Snapshot>,
    ) -> BoxFuture<'static, MachineStep<BundleMachine, AnnotatedBundleData>> {
        for chunk_index in 0..snapshot.chunks.len() {
            machine.pending_chunks.push_back(PendingChunk {
                snapshot: Arc::clone(&snapshot),
                chunk_index,
            });
        }
        Box::pin(self.process_chunks(machine, false))
    }

    fn try_continue(
        self: Arc<Self>,
        machine: BundleMachine,
    ) -> BoxFuture<'static, MachineStep<BundleMachine, AnnotatedBundleData>> {
        Box::pin(self.process_chunks(machine, false))
    }

    fn force_flush(
        self: Arc<Self>,
        machine: BundleMachine,
    ) -> BoxFuture<'static, MachineStep<BundleMachine, AnnotatedBundleData>> {
        Box::pin(self.flush(machine))
    }

    fn finish_and_exit(
        self: Arc<Self>,
        machine: BundleMachine,
    ) -> BoxFuture<'static, MachineStep<BundleMachine, AnnotatedBundleData>> {
        // Drain any leftover chunks, then flush the partial bundle. The
        // pool calls again until the machine comes back empty.
        Box::pin(self.process_chunks(machine, true))
    }

    fn handle_output(&self, output: AnnotatedBundleData) {
        self.counters
            .bundles_generated
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .bundles_bytes
            .fetch_add(output.annotations.length, Ordering::Relaxed);
        self.last_bundle_generated
            .store(epoch_now(), Ordering::Relaxed);

        log::info!(
            "wrote bundle {:?} to {:?} ({} blocks, {} bytes)",
            output.annotations.id,
            output.annotations.persistence_file_path,
            output.manifest.block_count(),
            output.annotations.length
        );

        if let Some(next) = self.next_pool.get() {
            next.add_new_input(output, 1);
        }
    }

    fn input_done_action(&self, machine: &BundleMachine) -> InputDoneAction {
        if machine.has_partial_bundle() {
            let last = self.last_bundle_generated.load(Ordering::Relaxed);
            let idle_for = epoch_now() - last;
            let next_idle = self
                .next_pool
                .get()
                .map(|next| next.is_completely_idle())
                .unwrap_or(true);
            if last > 0 && idle_for > self.config.max_upstream_idle_seconds && next_idle {
                log::debug!("flushing partial bundle after {}s idle", idle_for);
                return InputDoneAction::ForceFlush;
            }
        }
        InputDoneAction::Deactivate
    }
}
