//! Disk-strand access to the metadata catalog.
//!
//! Every catalog invocation from any pipeline stage funnels through one
//! strand bound to the Disk class, so the catalog never sees concurrent
//! writers and at most one request is in flight at a time.

use std::sync::{Arc, Mutex};

use anyhow::Error;

use pex_api_types::{Block, BundleAnnotations, Snapshot};
use pex_datastore::{AnnotatedBundleData, MetadataCatalog};

use crate::executor::Strand;

pub struct CatalogClient {
    strand: Strand,
    catalog: Arc<Mutex<MetadataCatalog>>,
}

impl CatalogClient {
    pub fn new(strand: Strand, catalog: MetadataCatalog) -> Arc<Self> {
        Arc::new(Self {
            strand,
            catalog: Arc::new(Mutex::new(catalog)),
        })
    }

    pub async fn get_latest_snapshot(&self, path: String) -> Result<Option<Snapshot>, Error> {
        let catalog = Arc::clone(&self.catalog);
        self.strand
            .run(move || catalog.lock().unwrap().get_latest_snapshot(&path))
            .await?
    }

    /// Record the snapshot; returns it with all ids assigned.
    pub async fn record_new_snapshot(&self, mut snapshot: Snapshot) -> Result<Snapshot, Error> {
        let catalog = Arc::clone(&self.catalog);
        self.strand
            .run(move || {
                catalog
                    .lock()
                    .unwrap()
                    .record_new_snapshot(&mut snapshot)
                    .map(|_| snapshot)
            })
            .await?
    }

    pub async fn get_latest_bundle_for_block(
        &self,
        block: Block,
    ) -> Result<Option<BundleAnnotations>, Error> {
        let catalog = Arc::clone(&self.catalog);
        self.strand
            .run(move || catalog.lock().unwrap().get_latest_bundle_for_block(&block))
            .await?
    }

    /// Record the bundle; returns it with the local id assigned.
    pub async fn record_new_bundle(
        &self,
        mut bundle: AnnotatedBundleData,
    ) -> Result<AnnotatedBundleData, Error> {
        let catalog = Arc::clone(&self.catalog);
        self.strand
            .run(move || {
                catalog
                    .lock()
                    .unwrap()
                    .record_new_bundle(&mut bundle)
                    .map(|_| bundle)
            })
            .await?
    }

    pub async fn record_uploaded_bundle(
        &self,
        server_id: i64,
        bundle: Arc<AnnotatedBundleData>,
    ) -> Result<(), Error> {
        let catalog = Arc::clone(&self.catalog);
        self.strand
            .run(move || {
                catalog
                    .lock()
                    .unwrap()
                    .record_uploaded_bundle(server_id, &bundle)
            })
            .await?
    }
}
