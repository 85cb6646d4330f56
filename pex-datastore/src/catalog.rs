//! The metadata catalog: a SQLite database that deduplicates blocks
//! across snapshots and records which bundles hold them and where those
//! bundles were uploaded.
//!
//! The catalog runs in WAL mode with `synchronous = NORMAL`: consistent
//! after a crash, but the most recent writes may be lost. Losing them is
//! harmless here — the worst case is redundantly re-backing-up blocks the
//! catalog forgot about on the next run — and the speedup over full
//! synchronous mode is considerable.
//!
//! Callers must serialize access (the pipeline funnels every call through
//! one Disk strand); the catalog itself performs no locking beyond the
//! transactions below.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{format_err, Error};
use rusqlite::{named_params, Connection, OptionalExtension};

use pex_api_types::{Attributes, Block, BundleAnnotations, File, Snapshot, UploadStatus};

use crate::bundle::AnnotatedBundleData;

/// Default catalog file name, created in the working directory.
pub const DEFAULT_CATALOG_FILENAME: &str = "metadata.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS attributes (
    id INTEGER PRIMARY KEY,
    owner_user TEXT NOT NULL,
    owner_group TEXT NOT NULL,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    mode INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS attributes_natural_key
    ON attributes (owner_user, owner_group, uid, gid, mode);
CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY,
    sha1_digest TEXT NOT NULL,
    length INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS blocks_natural_key
    ON blocks (sha1_digest, length);
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files (id),
    attributes_id INTEGER NOT NULL REFERENCES attributes (id),
    ctime INTEGER,
    mtime INTEGER NOT NULL,
    atime INTEGER,
    is_regular INTEGER NOT NULL,
    is_deleted INTEGER NOT NULL,
    sha1_digest TEXT,
    length INTEGER NOT NULL,
    observation_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS snapshots_by_file
    ON snapshots (file_id, observation_time DESC);
CREATE TABLE IF NOT EXISTS files_to_blocks (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files (id),
    block_id INTEGER NOT NULL REFERENCES blocks (id),
    \"offset\" INTEGER NOT NULL,
    observation_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS files_to_blocks_by_block
    ON files_to_blocks (block_id);
CREATE TABLE IF NOT EXISTS latest_chunks_cache (
    snapshot_id INTEGER NOT NULL,
    files_to_blocks_id INTEGER NOT NULL REFERENCES files_to_blocks (id)
);
CREATE INDEX IF NOT EXISTS latest_chunks_cache_by_snapshot
    ON latest_chunks_cache (snapshot_id);
CREATE TABLE IF NOT EXISTS local_bundles (
    id INTEGER PRIMARY KEY,
    sha256_linear_digest TEXT NOT NULL,
    sha256_tree_digest TEXT NOT NULL,
    length INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS local_blocks_to_bundles (
    block_id INTEGER NOT NULL REFERENCES blocks (id),
    bundle_id INTEGER NOT NULL REFERENCES local_bundles (id)
);
CREATE INDEX IF NOT EXISTS local_blocks_to_bundles_by_block
    ON local_blocks_to_bundles (block_id);
CREATE TABLE IF NOT EXISTS local_bundles_to_servers (
    bundle_id INTEGER NOT NULL REFERENCES local_bundles (id),
    server_id INTEGER NOT NULL,
    server_bundle_id TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_timestamp INTEGER NOT NULL,
    PRIMARY KEY (bundle_id, server_id)
);
";

pub struct MetadataCatalog {
    conn: Connection,
}

impl MetadataCatalog {
    /// Open (or create) the catalog at `path` and apply the journaling
    /// pragmas.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|err| format_err!("unable to open catalog {:?} - {}", path, err))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// The newest recorded snapshot of the file at `path` (joined with
    /// its attributes), or `None`. Chunk lists are not materialized; the
    /// snapshot row carries everything the comparison rules need.
    pub fn get_latest_snapshot(&self, path: &str) -> Result<Option<Snapshot>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT snapshots.id, snapshots.ctime, snapshots.mtime, snapshots.atime, \
                    snapshots.is_regular, snapshots.is_deleted, snapshots.sha1_digest, \
                    snapshots.length, snapshots.observation_time, \
                    files.id, \
                    attributes.id, attributes.owner_user, attributes.owner_group, \
                    attributes.uid, attributes.gid, attributes.mode \
             FROM snapshots \
             JOIN files ON snapshots.file_id = files.id \
             JOIN attributes ON snapshots.attributes_id = attributes.id \
             WHERE files.path = :path \
             ORDER BY snapshots.observation_time DESC, snapshots.id DESC \
             LIMIT 1",
        )?;

        let snapshot = stmt
            .query_row(named_params! { ":path": path }, |row| {
                Ok(Snapshot {
                    id: Some(row.get(0)?),
                    ctime: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    mtime: row.get(2)?,
                    atime: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    is_regular: row.get(4)?,
                    is_deleted: row.get(5)?,
                    sha1_digest: row.get(6)?,
                    length: row.get::<_, i64>(7)? as u64,
                    observation_time: row.get(8)?,
                    file: File {
                        id: Some(row.get(9)?),
                        path: path.to_string(),
                    },
                    attributes: Attributes {
                        id: Some(row.get(10)?),
                        owner_user: row.get(11)?,
                        owner_group: row.get(12)?,
                        uid: row.get::<_, i64>(13)? as u32,
                        gid: row.get::<_, i64>(14)? as u32,
                        mode: row.get::<_, i64>(15)? as u32,
                    },
                    chunks: Vec::new(),
                })
            })
            .optional()?;
        Ok(snapshot)
    }

    /// Record a new snapshot in one transaction: assign ids to the file,
    /// attributes, blocks and chunks that lack one (looking up existing
    /// rows by natural key first), insert the snapshot row, and rewrite
    /// the latest-chunks cache for this file.
    pub fn record_new_snapshot(&mut self, snapshot: &mut Snapshot) -> Result<(), Error> {
        if snapshot.file.id.is_none() {
            snapshot.file.id = self.find_file_id(&snapshot.file.path)?;
        }
        let previous_snapshot_id = match snapshot.file.id {
            Some(file_id) => self.latest_snapshot_id(file_id)?,
            None => None,
        };
        if snapshot.attributes.id.is_none() {
            snapshot.attributes.id = self.find_attributes_id(&snapshot.attributes)?;
        }
        for chunk in &mut snapshot.chunks {
            if chunk.block.id.is_none() {
                chunk.block.id = self.find_block_id(&chunk.block)?;
            }
        }
        if let Some(previous_id) = previous_snapshot_id {
            self.reuse_chunk_ids(previous_id, snapshot)?;
        }

        let tx = self.conn.transaction()?;

        if snapshot.file.id.is_none() {
            tx.prepare_cached("INSERT INTO files (path) VALUES (:path)")?
                .execute(named_params! { ":path": snapshot.file.path })?;
            snapshot.file.id = Some(tx.last_insert_rowid());
        }
        let file_id = snapshot.file.id.unwrap();

        if snapshot.attributes.id.is_none() {
            let attributes = &snapshot.attributes;
            tx.prepare_cached(
                "INSERT INTO attributes (owner_user, owner_group, uid, gid, mode) \
                 VALUES (:owner_user, :owner_group, :uid, :gid, :mode)",
            )?
            .execute(named_params! {
                ":owner_user": attributes.owner_user,
                ":owner_group": attributes.owner_group,
                ":uid": attributes.uid as i64,
                ":gid": attributes.gid as i64,
                ":mode": attributes.mode as i64,
            })?;
            snapshot.attributes.id = Some(tx.last_insert_rowid());
        }

        for chunk in &mut snapshot.chunks {
            if chunk.block.id.is_none() {
                tx.prepare_cached(
                    "INSERT INTO blocks (sha1_digest, length) VALUES (:sha1_digest, :length)",
                )?
                .execute(named_params! {
                    ":sha1_digest": chunk.block.sha1_digest,
                    ":length": chunk.block.length as i64,
                })?;
                chunk.block.id = Some(tx.last_insert_rowid());
            }
        }

        for chunk in &mut snapshot.chunks {
            if chunk.id.is_none() {
                tx.prepare_cached(
                    "INSERT INTO files_to_blocks (file_id, block_id, \"offset\", observation_time) \
                     VALUES (:file_id, :block_id, :offset, :observation_time)",
                )?
                .execute(named_params! {
                    ":file_id": file_id,
                    ":block_id": chunk.block.id.unwrap(),
                    ":offset": chunk.offset as i64,
                    ":observation_time": chunk.observation_time,
                })?;
                chunk.id = Some(tx.last_insert_rowid());
            }
        }

        tx.prepare_cached(
            "INSERT INTO snapshots (file_id, attributes_id, ctime, mtime, atime, \
                                    is_regular, is_deleted, sha1_digest, length, \
                                    observation_time) \
             VALUES (:file_id, :attributes_id, :ctime, :mtime, :atime, \
                     :is_regular, :is_deleted, :sha1_digest, :length, :observation_time)",
        )?
        .execute(named_params! {
            ":file_id": file_id,
            ":attributes_id": snapshot.attributes.id.unwrap(),
            ":ctime": snapshot.ctime,
            ":mtime": snapshot.mtime,
            ":atime": snapshot.atime,
            ":is_regular": snapshot.is_regular,
            ":is_deleted": snapshot.is_deleted,
            ":sha1_digest": snapshot.sha1_digest,
            ":length": snapshot.length as i64,
            ":observation_time": snapshot.observation_time,
        })?;
        snapshot.id = Some(tx.last_insert_rowid());

        if let Some(previous_id) = previous_snapshot_id {
            tx.prepare_cached("DELETE FROM latest_chunks_cache WHERE snapshot_id = :snapshot_id")?
                .execute(named_params! { ":snapshot_id": previous_id })?;
        }
        for chunk in &snapshot.chunks {
            tx.prepare_cached(
                "INSERT INTO latest_chunks_cache (snapshot_id, files_to_blocks_id) \
                 VALUES (:snapshot_id, :files_to_blocks_id)",
            )?
            .execute(named_params! {
                ":snapshot_id": snapshot.id.unwrap(),
                ":files_to_blocks_id": chunk.id.unwrap(),
            })?;
        }

        tx.commit()?;
        Ok(())
    }

    /// The most recently uploaded bundle containing this block, if any.
    /// A bundle counts only once it has a server mapping in `Uploaded`
    /// state — a `Pending` or `Failed` row must not suppress re-bundling
    /// of its blocks. Ordering is by upload status timestamp, then
    /// bundle id, both descending.
    pub fn get_latest_bundle_for_block(
        &self,
        block: &Block,
    ) -> Result<Option<BundleAnnotations>, Error> {
        let block_id = match block.id {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut stmt = self.conn.prepare_cached(
            "SELECT local_bundles.id, local_bundles.sha256_linear_digest, \
                    local_bundles.sha256_tree_digest, local_bundles.length, \
                    local_bundles_to_servers.server_bundle_id, \
                    local_bundles_to_servers.status, \
                    local_bundles_to_servers.status_timestamp \
             FROM local_blocks_to_bundles \
             JOIN local_bundles \
                  ON local_blocks_to_bundles.bundle_id = local_bundles.id \
             JOIN local_bundles_to_servers \
                  ON local_bundles.id = local_bundles_to_servers.bundle_id \
             WHERE local_blocks_to_bundles.block_id = :block_id \
               AND local_bundles_to_servers.status = :uploaded \
             ORDER BY local_bundles_to_servers.status_timestamp DESC, \
                      local_bundles.id DESC \
             LIMIT 1",
        )?;

        let annotations = stmt
            .query_row(
                named_params! {
                    ":block_id": block_id,
                    ":uploaded": UploadStatus::Uploaded.as_i64(),
                },
                |row| {
                    Ok(BundleAnnotations {
                        id: Some(row.get(0)?),
                        sha256_linear_digest: row.get(1)?,
                        sha256_tree_digest: row.get(2)?,
                        length: row.get::<_, i64>(3)? as u64,
                        persistence_file_path: None,
                        server_bundle_id: row.get(4)?,
                        status: UploadStatus::from_i64(row.get(5)?)
                            .unwrap_or(UploadStatus::Pending),
                        status_timestamp: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(annotations)
    }

    /// Record a freshly spooled bundle and its block memberships in one
    /// transaction, assigning the local bundle id.
    pub fn record_new_bundle(&mut self, bundle: &mut AnnotatedBundleData) -> Result<(), Error> {
        let tx = self.conn.transaction()?;

        tx.prepare_cached(
            "INSERT INTO local_bundles (sha256_linear_digest, sha256_tree_digest, length) \
             VALUES (:sha256_linear_digest, :sha256_tree_digest, :length)",
        )?
        .execute(named_params! {
            ":sha256_linear_digest": bundle.annotations.sha256_linear_digest,
            ":sha256_tree_digest": bundle.annotations.sha256_tree_digest,
            ":length": bundle.annotations.length as i64,
        })?;
        bundle.annotations.id = Some(tx.last_insert_rowid());

        for payload in &bundle.manifest.payloads {
            for block in &payload.blocks {
                tx.prepare_cached(
                    "INSERT INTO local_blocks_to_bundles (block_id, bundle_id) \
                     VALUES (:block_id, :bundle_id)",
                )?
                .execute(named_params! {
                    ":block_id": block.id,
                    ":bundle_id": bundle.annotations.id.unwrap(),
                })?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Record (or update) the upload state of a bundle on a server.
    pub fn record_uploaded_bundle(
        &mut self,
        server_id: i64,
        bundle: &AnnotatedBundleData,
    ) -> Result<(), Error> {
        let bundle_id = bundle
            .annotations
            .id
            .ok_or_else(|| format_err!("bundle has no catalog id"))?;
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO local_bundles_to_servers \
                 (bundle_id, server_id, server_bundle_id, status, status_timestamp) \
                 VALUES (:bundle_id, :server_id, :server_bundle_id, :status, :status_timestamp)",
            )?
            .execute(named_params! {
                ":bundle_id": bundle_id,
                ":server_id": server_id,
                ":server_bundle_id": bundle.annotations.server_bundle_id,
                ":status": bundle.annotations.status.as_i64(),
                ":status_timestamp": bundle.annotations.status_timestamp,
            })?;
        Ok(())
    }

    fn find_file_id(&self, path: &str) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .prepare_cached("SELECT id FROM files WHERE path = :path")?
            .query_row(named_params! { ":path": path }, |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn latest_snapshot_id(&self, file_id: i64) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .prepare_cached(
                "SELECT id FROM snapshots WHERE file_id = :file_id \
                 ORDER BY observation_time DESC, id DESC LIMIT 1",
            )?
            .query_row(named_params! { ":file_id": file_id }, |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn find_attributes_id(&self, attributes: &Attributes) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .prepare_cached(
                "SELECT id FROM attributes \
                 WHERE owner_user = :owner_user AND owner_group = :owner_group \
                   AND uid = :uid AND gid = :gid AND mode = :mode",
            )?
            .query_row(
                named_params! {
                    ":owner_user": attributes.owner_user,
                    ":owner_group": attributes.owner_group,
                    ":uid": attributes.uid as i64,
                    ":gid": attributes.gid as i64,
                    ":mode": attributes.mode as i64,
                },
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn find_block_id(&self, block: &Block) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .prepare_cached(
                "SELECT id FROM blocks WHERE sha1_digest = :sha1_digest AND length = :length",
            )?
            .query_row(
                named_params! {
                    ":sha1_digest": block.sha1_digest,
                    ":length": block.length as i64,
                },
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // A chunk of the new snapshot that sits at the same offset as a chunk
    // of the previous snapshot and refers to the same block is the same
    // chunk; reuse its files_to_blocks row instead of inserting another.
    fn reuse_chunk_ids(
        &self,
        previous_snapshot_id: i64,
        snapshot: &mut Snapshot,
    ) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT files_to_blocks.id, files_to_blocks.block_id, \
                    files_to_blocks.\"offset\", files_to_blocks.observation_time \
             FROM files_to_blocks \
             JOIN latest_chunks_cache \
                  ON files_to_blocks.id = latest_chunks_cache.files_to_blocks_id \
             WHERE latest_chunks_cache.snapshot_id = :snapshot_id",
        )?;

        let mut previous_by_offset: HashMap<u64, (i64, i64, i64)> = HashMap::new();
        let rows = stmt.query_map(named_params! { ":snapshot_id": previous_snapshot_id }, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (chunk_id, block_id, offset, observation_time) = row?;
            previous_by_offset.insert(offset as u64, (chunk_id, block_id, observation_time));
        }

        for chunk in &mut snapshot.chunks {
            if chunk.id.is_some() {
                continue;
            }
            if let (Some(block_id), Some(&(prev_chunk_id, prev_block_id, prev_time))) =
                (chunk.block.id, previous_by_offset.get(&chunk.offset))
            {
                if block_id == prev_block_id {
                    chunk.id = Some(prev_chunk_id);
                    chunk.observation_time = prev_time;
                }
            }
        }
        Ok(())
    }
}
