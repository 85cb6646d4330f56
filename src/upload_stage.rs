//! The upload stage: persistent machines that push finished bundles to
//! the archive service.
//!
//! Each machine owns one connection. Before the first upload it probes
//! the destination vault, creating it when missing. Transport failures
//! close the connection and the bundle is retried on a reopened
//! connection, with exponential backoff capped at one minute. After the
//! service confirms receipt the upload is recorded in the catalog and
//! the local spool file deleted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use bytes::Bytes;
use futures::future::BoxFuture;

use pex_api_types::UploadStatus;
use pex_client::GlacierClient;
use pex_datastore::bundle::AnnotatedBundleData;
use pex_datastore::spool;

use crate::backup::BackupCounters;
use crate::catalog_client::CatalogClient;
use crate::executor::{ResourceClass, Scheduler};
use crate::pool::{MachineStep, PersistentStage};

pub const DEFAULT_MAX_PENDING_BUNDLES: u64 = 10;
pub const DEFAULT_MAX_SIMULTANEOUS_UPLOADS: usize = 2;

// The one server the pipeline currently uploads to. The catalog schema
// supports several.
pub const SERVER_ID: i64 = 1;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct UploadStageConfig {
    pub aws_region_name: String,
    pub aws_access_key: String,
    pub aws_secret_key: Vec<u8>,
    pub vault_name: String,
    pub use_ssl: bool,
    pub max_pending_bundles: u64,
    pub max_simultaneous_uploads: usize,
}

pub struct UploadMachine {
    client: GlacierClient,
    vault_verified: bool,
}

pub struct UploadStage {
    scheduler: Arc<Scheduler>,
    catalog: Arc<CatalogClient>,
    counters: Arc<BackupCounters>,
    config: UploadStageConfig,
}

impl UploadStage {
    pub fn new(
        scheduler: Arc<Scheduler>,
        catalog: Arc<CatalogClient>,
        counters: Arc<BackupCounters>,
        config: UploadStageConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            catalog,
            counters,
            config,
        })
    }

    /// One upload attempt: ensure the connection and vault, then push
    /// the bundle. Any error leaves the connection closed.
    async fn try_upload(
        &self,
        machine: &mut UploadMachine,
        bundle: &mut AnnotatedBundleData,
    ) -> Result<(), Error> {
        if !machine.client.is_open() {
            machine.client.open().await?;
        }

        if !machine.vault_verified {
            let vault = self.config.vault_name.as_str();
            match machine.client.describe_vault(vault).await? {
                Some(_) => {}
                None => {
                    log::info!("vault {:?} does not exist; creating it", vault);
                    machine.client.create_vault(vault).await?;
                    if machine.client.describe_vault(vault).await?.is_none() {
                        bail!("vault {:?} still missing after creation", vault);
                    }
                }
            }
            machine.vault_verified = true;
        }

        let mut payload: Vec<Bytes> = Vec::with_capacity(3);
        if !bundle.encryption_headers.is_empty() {
            payload.push(bundle.encryption_headers.clone());
        }
        payload.push(bundle.data.clone());
        if !bundle.mac.is_empty() {
            payload.push(bundle.mac.clone());
        }

        let archive_id = machine
            .client
            .upload_archive(
                &self.config.vault_name,
                payload,
                &bundle.annotations.sha256_linear_digest,
                &bundle.annotations.sha256_tree_digest,
                &bundle.unique_filename(),
            )
            .await?;

        bundle.annotations.server_bundle_id = archive_id;
        bundle.annotations.status = UploadStatus::Uploaded;
        bundle.annotations.status_timestamp = epoch_now();
        Ok(())
    }

    async fn upload_bundle(
        self: Arc<Self>,
        mut machine: UploadMachine,
        mut bundle: AnnotatedBundleData,
    ) -> MachineStep<UploadMachine, ()> {
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match self.try_upload(&mut machine, &mut bundle).await {
                Ok(()) => break,
                Err(err) => {
                    log::warn!(
                        "upload of bundle {:?} failed: {}; retrying in {:?}",
                        bundle.annotations.id,
                        err,
                        delay
                    );
                    machine.client.close();
                    machine.vault_verified = false;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }

        log::info!(
            "uploaded bundle {:?} as archive {}",
            bundle.annotations.id,
            bundle.annotations.server_bundle_id
        );

        let spool_path = bundle.annotations.persistence_file_path.take();
        let length = bundle.annotations.length;
        let bundle = Arc::new(bundle);
        match self
            .catalog
            .record_uploaded_bundle(SERVER_ID, Arc::clone(&bundle))
            .await
        {
            Ok(()) => {
                if let Some(path) = spool_path {
                    let removed = self
                        .scheduler
                        .run(ResourceClass::Disk, move || {
                            spool::remove_spool_file(&path)
                        })
                        .await;
                    if let Ok(Err(err)) | Err(err) = removed {
                        log::warn!("unable to delete spool file: {}", err);
                    }
                }
                self.counters
                    .bundles_uploaded
                    .fetch_add(1, Ordering::Relaxed);
                self.counters
                    .uploaded_bytes
                    .fetch_add(length, Ordering::Relaxed);
            }
            Err(err) => {
                // The upload itself succeeded; keep the spool file so
                // the bundle is not lost if this record never lands.
                log::error!(
                    "recording upload of bundle {:?} failed: {}",
                    bundle.annotations.id,
                    err
                );
            }
        }

        MachineStep::Idle(machine)
    }
}

impl PersistentStage for UploadStage {
    type Machine = UploadMachine;
    type Input = AnnotatedBundleData;
    type Output = ();

    fn name(&self) -> &'static str {
        "upload"
    }

    fn create_machine(&self) -> UploadMachine {
        UploadMachine {
            client: GlacierClient::new(
                self.config.aws_region_name.clone(),
                self.config.aws_access_key.clone(),
                self.config.aws_secret_key.clone(),
                self.config.use_ssl,
            ),
            vault_verified: false,
        }
    }

    fn run_input(
        self: Arc<Self>,
        machine: UploadMachine,
        bundle: AnnotatedBundleData,
    ) -> BoxFuture<'static, MachineStep<UploadMachine, ()>> {
        Box::pin(self.upload_bundle(machine, bundle))
    }

    fn try_continue(
        self: Arc<Self>,
        machine: UploadMachine,
    ) -> BoxFuture<'static, MachineStep<UploadMachine, ()>> {
        Box::pin(async move { MachineStep::Idle(machine) })
    }

    fn force_flush(
        self: Arc<Self>,
        machine: UploadMachine,
    ) -> BoxFuture<'static, MachineStep<UploadMachine, ()>> {
        Box::pin(async move { MachineStep::Idle(machine) })
    }

    fn finish_and_exit(
        self: Arc<Self>,
        mut machine: UploadMachine,
    ) -> BoxFuture<'static, MachineStep<UploadMachine, ()>> {
        Box::pin(async move {
            machine.client.close();
            MachineStep::Idle(machine)
        })
    }

    fn handle_output(&self, _output: ()) {}
}
