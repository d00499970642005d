use super::locking::Locking;
use crate::{
    Block, BlockUid, Error, Result, Version, VersionFilter, VersionStatistic, VersionUid,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;
/// `set_block` calls buffered before they are written out.
const FLUSH_EVERY: usize = 1000;
/// Tombstones examined per garbage collection batch.
const DELETE_CANDIDATES_BATCH: usize = 250;

const BLOCK_COLUMNS: &str = "id, version_uid, uid_left, uid_right, checksum, size, valid, date";
const VERSION_COLUMNS: &str = "uid, date, name, snapshot_name, size, block_size, valid, protected";

pub struct MetadataStore {
    conn: Connection,
    path: PathBuf,
    locking: Arc<Locking>,
    pending: Vec<PendingBlock>,
}

/// A `set_block` call not yet written to the database.
#[derive(Debug, Clone)]
struct PendingBlock {
    block: Block,
    upsert: bool,
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn timestamp(date: DateTime<Utc>) -> i64 {
    date.timestamp()
}

pub(crate) fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    Ok(Block {
        id: row.get::<_, i64>(0)? as u64,
        version_uid: VersionUid::new(row.get(1)?),
        uid: BlockUid::from_sql(row.get(2)?, row.get(3)?),
        checksum: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        valid: row.get(6)?,
        date: from_timestamp(row.get(7)?),
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        uid: VersionUid::new(row.get(0)?),
        date: from_timestamp(row.get(1)?),
        name: row.get(2)?,
        snapshot_name: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        block_size: row.get::<_, i64>(5)? as u64,
        valid: row.get(6)?,
        protected: row.get(7)?,
        tags: Vec::new(),
    })
}

fn row_to_stat(row: &Row<'_>) -> rusqlite::Result<VersionStatistic> {
    Ok(VersionStatistic {
        uid: VersionUid::new(row.get(0)?),
        base_uid: row.get::<_, Option<i64>>(1)?.map(VersionUid::new),
        hints_supplied: row.get(2)?,
        date: from_timestamp(row.get(3)?),
        name: row.get(4)?,
        snapshot_name: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        block_size: row.get::<_, i64>(7)? as u64,
        bytes_read: row.get::<_, i64>(8)? as u64,
        bytes_written: row.get::<_, i64>(9)? as u64,
        bytes_dedup: row.get::<_, i64>(10)? as u64,
        bytes_sparse: row.get::<_, i64>(11)? as u64,
        duration_seconds: row.get::<_, i64>(12)? as u64,
    })
}

impl MetadataStore {
    /// Opens the database at `path`. With `create` the schema is initialised,
    /// otherwise an uninitialised database is an error.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !create && !path.exists() {
            return Err(Error::not_found("metadata database", path.display()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(&path)?;
        Self::init_schema(&conn, create)?;
        let locking = Arc::new(Locking::open(&path)?);
        debug!(path = %path.display(), "Opened metadata store");

        Ok(Self {
            conn,
            path,
            locking,
            pending: Vec::new(),
        })
    }

    fn init_schema(conn: &Connection, create: bool) -> Result<()> {
        let initialised: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta')",
            [],
            |row| row.get(0),
        )?;

        if !initialised {
            if !create {
                return Err(Error::Usage("Metadata database is not initialised".to_string()));
            }
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS versions (
                    uid INTEGER PRIMARY KEY AUTOINCREMENT,
                    date INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    snapshot_name TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    block_size INTEGER NOT NULL,
                    valid INTEGER NOT NULL,
                    protected INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_versions_name ON versions(name);
                CREATE TABLE IF NOT EXISTS blocks (
                    version_uid INTEGER NOT NULL,
                    id INTEGER NOT NULL,
                    uid_left INTEGER,
                    uid_right INTEGER,
                    checksum TEXT,
                    size INTEGER NOT NULL,
                    valid INTEGER NOT NULL,
                    date INTEGER NOT NULL,
                    PRIMARY KEY(version_uid, id),
                    FOREIGN KEY(version_uid) REFERENCES versions(uid) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_blocks_checksum ON blocks(checksum);
                CREATE INDEX IF NOT EXISTS idx_blocks_uid ON blocks(uid_left, uid_right);
                CREATE TABLE IF NOT EXISTS tags (
                    version_uid INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    PRIMARY KEY(version_uid, name),
                    FOREIGN KEY(version_uid) REFERENCES versions(uid) ON DELETE CASCADE
                );
                CREATE TABLE IF NOT EXISTS deleted_blocks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uid_left INTEGER NOT NULL,
                    uid_right INTEGER NOT NULL,
                    date INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_deleted_blocks_uid ON deleted_blocks(uid_left, uid_right);
                CREATE TABLE IF NOT EXISTS stats (
                    uid INTEGER NOT NULL,
                    base_uid INTEGER,
                    hints_supplied INTEGER NOT NULL,
                    date INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    snapshot_name TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    block_size INTEGER NOT NULL,
                    bytes_read INTEGER NOT NULL,
                    bytes_written INTEGER NOT NULL,
                    bytes_dedup INTEGER NOT NULL,
                    bytes_sparse INTEGER NOT NULL,
                    duration INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS locks (
                    lock_name TEXT PRIMARY KEY,
                    host TEXT NOT NULL,
                    process_id TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    date INTEGER NOT NULL
                );
                "#,
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
            info!("Initialised metadata schema version {}", SCHEMA_VERSION);
            return Ok(());
        }

        let version: String = conn.query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))?;
        if version != SCHEMA_VERSION.to_string() {
            return Err(Error::Configuration(format!(
                "Metadata schema version {} is not supported (expected {})",
                version, SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locking(&self) -> Arc<Locking> {
        Arc::clone(&self.locking)
    }

    /// Writes the buffered `set_block` calls in one short transaction.
    ///
    /// The database write lock is only held for the duration of this call,
    /// so other processes can take locks and create versions while a long
    /// backup is buffering blocks.
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for PendingBlock { block, upsert } in &pending {
            let (left, right) = block.uid.to_sql();
            let sql = if *upsert {
                "INSERT INTO blocks(version_uid, id, uid_left, uid_right, checksum, size, valid, date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(version_uid, id) DO UPDATE SET
                    uid_left = excluded.uid_left, uid_right = excluded.uid_right,
                    checksum = excluded.checksum, size = excluded.size,
                    valid = excluded.valid, date = excluded.date"
            } else {
                "INSERT INTO blocks(version_uid, id, uid_left, uid_right, checksum, size, valid, date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            };
            tx.execute(
                sql,
                params![
                    block.version_uid.as_i64(),
                    block.id as i64,
                    left,
                    right,
                    block.checksum,
                    block.size as i64,
                    block.valid,
                    timestamp(block.date)
                ],
            )?;
        }
        tx.commit()?;
        debug!(blocks = pending.len(), "Committed metadata batch");
        Ok(())
    }

    /// Discards the buffered `set_block` calls.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!(blocks = self.pending.len(), "Rolled back metadata batch");
            self.pending.clear();
        }
        Ok(())
    }

    /// Runs `f` in its own transaction after flushing any open batch.
    fn with_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        self.commit()?;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn create_version(
        &mut self,
        name: &str,
        snapshot_name: &str,
        size: u64,
        block_size: u64,
        valid: bool,
        protected: bool,
    ) -> Result<Version> {
        if block_size == 0 {
            return Err(Error::Usage("Block size must not be zero".to_string()));
        }
        let date = Utc::now();
        let uid = self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO versions(date, name, snapshot_name, size, block_size, valid, protected)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![timestamp(date), name, snapshot_name, size as i64, block_size as i64, valid, protected],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        let version = self.get_version(VersionUid::new(uid))?;
        debug!(version = %version.uid, name, size, block_size, "Created version");
        Ok(version)
    }

    pub fn set_version(&mut self, uid: VersionUid, valid: Option<bool>, protected: Option<bool>) -> Result<()> {
        self.with_transaction(|tx| {
            let exists = tx
                .query_row("SELECT 1 FROM versions WHERE uid = ?1", params![uid.as_i64()], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(Error::not_found("version", uid));
            }
            if let Some(valid) = valid {
                tx.execute("UPDATE versions SET valid = ?1 WHERE uid = ?2", params![valid, uid.as_i64()])?;
            }
            if let Some(protected) = protected {
                tx.execute("UPDATE versions SET protected = ?1 WHERE uid = ?2", params![protected, uid.as_i64()])?;
            }
            Ok(())
        })
    }

    pub fn get_version(&self, uid: VersionUid) -> Result<Version> {
        let mut version = self
            .conn
            .query_row(
                &format!("SELECT {} FROM versions WHERE uid = ?1", VERSION_COLUMNS),
                params![uid.as_i64()],
                row_to_version,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("version", uid))?;
        version.tags = self.get_tags(uid)?;
        Ok(version)
    }

    pub fn version_exists(&self, uid: VersionUid) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM versions WHERE uid = ?1", params![uid.as_i64()], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Versions matching `filter`, oldest first.
    pub fn get_versions(&self, filter: &VersionFilter) -> Result<Vec<Version>> {
        let mut sql = format!("SELECT {} FROM versions WHERE 1 = 1", VERSION_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if let Some(uid) = filter.uid {
            values.push(Value::Integer(uid.as_i64()));
            sql.push_str(&format!(" AND uid = ?{}", values.len()));
        }
        if let Some(name) = &filter.name {
            values.push(Value::Text(name.clone()));
            sql.push_str(&format!(" AND name = ?{}", values.len()));
        }
        if let Some(snapshot_name) = &filter.snapshot_name {
            values.push(Value::Text(snapshot_name.clone()));
            sql.push_str(&format!(" AND snapshot_name = ?{}", values.len()));
        }
        if let Some(tag) = &filter.tag {
            values.push(Value::Text(tag.clone()));
            sql.push_str(&format!(
                " AND uid IN (SELECT version_uid FROM tags WHERE name = ?{})",
                values.len()
            ));
        }
        if let Some(valid) = filter.valid {
            values.push(Value::Integer(valid as i64));
            sql.push_str(&format!(" AND valid = ?{}", values.len()));
        }
        if let Some(protected) = filter.protected {
            values.push(Value::Integer(protected as i64));
            sql.push_str(&format!(" AND protected = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY date, uid");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut versions = stmt
            .query_map(params_from_iter(values), row_to_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for version in &mut versions {
            version.tags = self.get_tags(version.uid)?;
        }
        Ok(versions)
    }

    /// Inserts or, with `upsert`, overwrites the block at `(version_uid, id)`.
    /// Calls are batched; the caller must finish with [`MetadataStore::commit`].
    #[allow(clippy::too_many_arguments)]
    pub fn set_block(
        &mut self,
        id: u64,
        version_uid: VersionUid,
        block_uid: BlockUid,
        checksum: Option<&str>,
        size: u64,
        valid: bool,
        upsert: bool,
    ) -> Result<()> {
        if block_uid.is_sparse() != checksum.is_none() {
            return Err(Error::Internal(format!(
                "Block {} of {} must have both uid and checksum or neither",
                id, version_uid
            )));
        }
        if !upsert && self.block_exists(version_uid, id)? {
            return Err(Error::Internal(format!("Block {} of {} is already set", id, version_uid)));
        }

        self.pending.push(PendingBlock {
            block: Block {
                id,
                version_uid,
                uid: block_uid,
                checksum: checksum.map(str::to_string),
                size,
                valid,
                date: Utc::now(),
            },
            upsert,
        });
        if self.pending.len() >= FLUSH_EVERY {
            self.commit()?;
        }
        Ok(())
    }

    fn block_exists(&self, version_uid: VersionUid, id: u64) -> Result<bool> {
        if self.pending.iter().any(|p| p.block.version_uid == version_uid && p.block.id == id) {
            return Ok(true);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM blocks WHERE version_uid = ?1 AND id = ?2",
                params![version_uid.as_i64(), id as i64],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn get_block(&self, version_uid: VersionUid, id: u64) -> Result<Option<Block>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM blocks WHERE version_uid = ?1 AND id = ?2", BLOCK_COLUMNS),
                params![version_uid.as_i64(), id as i64],
                row_to_block,
            )
            .optional()?)
    }

    /// All blocks of a version in index order.
    pub fn get_blocks_by_version(&self, version_uid: VersionUid) -> Result<Vec<Block>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM blocks WHERE version_uid = ?1 ORDER BY id",
            BLOCK_COLUMNS
        ))?;
        let blocks = stmt
            .query_map(params![version_uid.as_i64()], row_to_block)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    /// Deduplication lookup: any valid, stored block with this checksum,
    /// including blocks still buffered by `set_block`.
    pub fn get_block_by_checksum(&self, checksum: &str) -> Result<Option<Block>> {
        let buffered = self
            .pending
            .iter()
            .rev()
            .map(|p| &p.block)
            .find(|b| b.valid && !b.uid.is_sparse() && b.checksum.as_deref() == Some(checksum));
        if let Some(block) = buffered {
            return Ok(Some(block.clone()));
        }
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM blocks WHERE checksum = ?1 AND valid = 1 AND uid_left IS NOT NULL LIMIT 1",
                    BLOCK_COLUMNS
                ),
                params![checksum],
                row_to_block,
            )
            .optional()?)
    }

    /// Marks every block stored under `block_uid` invalid in all versions and
    /// invalidates those versions. Returns the affected version uids.
    pub fn set_blocks_invalid(&mut self, block_uid: BlockUid) -> Result<Vec<VersionUid>> {
        let (left, right) = block_uid.to_sql();
        let affected = self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT version_uid FROM blocks WHERE uid_left = ?1 AND uid_right = ?2 ORDER BY version_uid",
            )?;
            let affected = stmt
                .query_map(params![left, right], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            tx.execute(
                "UPDATE blocks SET valid = 0 WHERE uid_left = ?1 AND uid_right = ?2",
                params![left, right],
            )?;
            for uid in &affected {
                tx.execute("UPDATE versions SET valid = 0 WHERE uid = ?1", params![uid])?;
            }
            Ok(affected.into_iter().map(VersionUid::new).collect::<Vec<_>>())
        })?;

        for uid in &affected {
            tracing::error!(block = %block_uid, version = %uid, "Marked block invalid, version is now invalid");
        }
        Ok(affected)
    }

    /// Removes a version and its blocks, tombstoning every distinct stored uid.
    /// Returns the number of removed blocks.
    pub fn rm_version(&mut self, uid: VersionUid) -> Result<u64> {
        let now = timestamp(Utc::now());
        self.with_transaction(|tx| {
            let exists = tx
                .query_row("SELECT 1 FROM versions WHERE uid = ?1", params![uid.as_i64()], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(Error::not_found("version", uid));
            }
            let tombstones = tx.execute(
                "INSERT INTO deleted_blocks(uid_left, uid_right, date)
                 SELECT DISTINCT uid_left, uid_right, ?1 FROM blocks
                 WHERE version_uid = ?2 AND uid_left IS NOT NULL AND uid_right IS NOT NULL",
                params![now, uid.as_i64()],
            )?;
            let blocks = tx.execute("DELETE FROM blocks WHERE version_uid = ?1", params![uid.as_i64()])?;
            tx.execute("DELETE FROM tags WHERE version_uid = ?1", params![uid.as_i64()])?;
            tx.execute("DELETE FROM versions WHERE uid = ?1", params![uid.as_i64()])?;
            debug!(version = %uid, blocks, tombstones, "Removed version metadata");
            Ok(blocks as u64)
        })
    }

    /// Streams tombstones older than `min_age` in bounded batches, yielding
    /// only uids no live block references any more. Consumed tombstones are
    /// removed whether or not they were false positives.
    pub fn get_delete_candidates(&mut self, min_age: Duration) -> DeleteCandidates<'_> {
        let cutoff = timestamp(Utc::now()) - min_age.as_secs() as i64;
        DeleteCandidates {
            store: self,
            cutoff,
            last_id: 0,
            done: false,
        }
    }

    fn next_delete_candidates(&mut self, cutoff: i64, last_id: &mut i64) -> Result<Option<Vec<BlockUid>>> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, uid_left, uid_right FROM deleted_blocks
                 WHERE date <= ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )?;
            let tombstones = stmt
                .query_map(params![cutoff, *last_id, DELETE_CANDIDATES_BATCH as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if tombstones.is_empty() {
                return Ok(None);
            }

            let batch_end = tombstones.last().map(|(id, _, _)| *id).unwrap_or(*last_id);
            *last_id = batch_end;

            let mut hits = Vec::new();
            let mut seen = HashSet::new();
            let mut false_positives = 0usize;
            for (_, left, right) in &tombstones {
                if !seen.insert((*left, *right)) {
                    continue;
                }
                let referenced = tx
                    .query_row(
                        "SELECT 1 FROM blocks WHERE uid_left = ?1 AND uid_right = ?2 LIMIT 1",
                        params![left, right],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if referenced {
                    // Still in use; only the tombstones seen so far are stale.
                    false_positives += 1;
                    tx.execute(
                        "DELETE FROM deleted_blocks WHERE uid_left = ?1 AND uid_right = ?2 AND id <= ?3",
                        params![left, right, batch_end],
                    )?;
                } else {
                    hits.push(BlockUid::from_sql(Some(*left), Some(*right)));
                    tx.execute(
                        "DELETE FROM deleted_blocks WHERE uid_left = ?1 AND uid_right = ?2",
                        params![left, right],
                    )?;
                }
            }
            debug!(tombstones = tombstones.len(), hits = hits.len(), false_positives, "Processed tombstone batch");
            Ok(Some(hits))
        })
    }

    pub fn count_tombstones(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM deleted_blocks", [], |row| row.get::<_, i64>(0))? as u64)
    }

    /// Every distinct uid referenced by a block.
    pub fn get_all_block_uids(&self) -> Result<HashSet<BlockUid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT uid_left, uid_right FROM blocks WHERE uid_left IS NOT NULL")?;
        let uids = stmt
            .query_map([], |row| Ok(BlockUid::from_sql(row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(uids)
    }

    pub fn get_tags(&self, uid: VersionUid) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM tags WHERE version_uid = ?1 ORDER BY name")?;
        let tags = stmt
            .query_map(params![uid.as_i64()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    pub fn add_tag(&mut self, uid: VersionUid, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Usage("Tag names must not be empty".to_string()));
        }
        self.with_transaction(|tx| {
            let exists = tx
                .query_row("SELECT 1 FROM versions WHERE uid = ?1", params![uid.as_i64()], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(Error::not_found("version", uid));
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO tags(version_uid, name) VALUES (?1, ?2)",
                params![uid.as_i64(), name],
            )?;
            if inserted == 0 {
                return Err(Error::already_exists("tag", format!("{} on {}", name, uid)));
            }
            Ok(())
        })
    }

    pub fn rm_tag(&mut self, uid: VersionUid, name: &str) -> Result<()> {
        self.with_transaction(|tx| {
            let removed = tx.execute(
                "DELETE FROM tags WHERE version_uid = ?1 AND name = ?2",
                params![uid.as_i64(), name],
            )?;
            if removed == 0 {
                return Err(Error::not_found("tag", format!("{} on {}", name, uid)));
            }
            Ok(())
        })
    }

    pub fn set_stats(&mut self, stat: &VersionStatistic) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO stats(uid, base_uid, hints_supplied, date, name, snapshot_name, size, block_size,
                                   bytes_read, bytes_written, bytes_dedup, bytes_sparse, duration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    stat.uid.as_i64(),
                    stat.base_uid.map(|uid| uid.as_i64()),
                    stat.hints_supplied,
                    timestamp(stat.date),
                    stat.name,
                    stat.snapshot_name,
                    stat.size as i64,
                    stat.block_size as i64,
                    stat.bytes_read as i64,
                    stat.bytes_written as i64,
                    stat.bytes_dedup as i64,
                    stat.bytes_sparse as i64,
                    stat.duration_seconds as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Statistics, newest first.
    pub fn get_stats(&self, uid: Option<VersionUid>, limit: Option<usize>) -> Result<Vec<VersionStatistic>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, base_uid, hints_supplied, date, name, snapshot_name, size, block_size,
                    bytes_read, bytes_written, bytes_dedup, bytes_sparse, duration
             FROM stats WHERE (?1 IS NULL OR uid = ?1) ORDER BY date DESC, rowid DESC LIMIT ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let stats = stmt
            .query_map(params![uid.map(|u| u.as_i64()), limit], row_to_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    pub(crate) fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        self.with_transaction(f)
    }

    /// Releases every lock still held by this process. Holding any at this
    /// point means an operation did not clean up after itself.
    pub fn close(mut self) -> Result<()> {
        self.rollback()?;
        self.locking.unlock_all()?;
        Ok(())
    }
}

/// Iterator returned by [`MetadataStore::get_delete_candidates`].
pub struct DeleteCandidates<'a> {
    store: &'a mut MetadataStore,
    cutoff: i64,
    last_id: i64,
    done: bool,
}

impl Iterator for DeleteCandidates<'_> {
    type Item = Result<Vec<BlockUid>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.next_delete_candidates(self.cutoff, &mut self.last_id) {
            Ok(Some(hits)) => Some(Ok(hits)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        (dir, store)
    }

    fn checksum(n: u8) -> String {
        format!("{:064x}", n)
    }

    #[test]
    fn test_open_requires_initialised_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite");
        assert!(matches!(MetadataStore::open(&path, false), Err(Error::NotFound { .. })));
        MetadataStore::open(&path, true).unwrap().close().unwrap();
        MetadataStore::open(&path, false).unwrap().close().unwrap();
    }

    #[test]
    fn test_version_uids_are_monotonic() {
        let (_dir, mut store) = store();
        let a = store.create_version("vm", "s1", 8192, 4096, false, false).unwrap();
        store.rm_version(a.uid).unwrap();
        let b = store.create_version("vm", "s2", 8192, 4096, false, true).unwrap();
        assert!(b.uid > a.uid);
        assert!(!b.valid);
        assert!(b.protected);
        assert_eq!(b.blocks_count(), 2);
    }

    #[test]
    fn test_set_version_partial_update() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096, 4096, false, false).unwrap();
        store.set_version(version.uid, Some(true), None).unwrap();
        let version = store.get_version(version.uid).unwrap();
        assert!(version.valid);
        assert!(!version.protected);
        assert!(matches!(
            store.set_version(VersionUid::new(999), Some(true), None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_set_block_upsert_and_batches() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096 * 3, 4096, false, false).unwrap();
        for id in 0..3 {
            store.set_block(id, version.uid, BlockUid::sparse(), None, 4096, true, false).unwrap();
        }
        let uid = BlockUid::new(1, 2);
        store
            .set_block(1, version.uid, uid, Some(&checksum(1)), 4096, true, true)
            .unwrap();
        assert!(
            store
                .set_block(2, version.uid, BlockUid::sparse(), None, 4096, true, false)
                .is_err()
        );
        store.commit().unwrap();

        let blocks = store.get_blocks_by_version(version.uid).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].uid, uid);
        assert!(blocks[0].is_sparse());
    }

    #[test]
    fn test_rollback_discards_batch() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096, 4096, false, false).unwrap();
        store.set_block(0, version.uid, BlockUid::sparse(), None, 4096, true, false).unwrap();
        store.rollback().unwrap();
        assert!(store.get_blocks_by_version(version.uid).unwrap().is_empty());
    }

    #[test]
    fn test_buffered_blocks_do_not_block_other_stores() {
        let (dir, mut first) = store();
        let version = first.create_version("vm", "", 8192, 4096, false, false).unwrap();
        first
            .set_block(0, version.uid, BlockUid::new(3, 4), Some(&checksum(3)), 4096, true, false)
            .unwrap();

        let mut second = MetadataStore::open(dir.path().join("meta.sqlite"), false).unwrap();
        let started = std::time::Instant::now();
        let other = second.create_version("other", "", 4096, 4096, false, false).unwrap();
        let _guard = second.locking().lock(&other.uid.lock_name(), "restore").unwrap();
        second.add_tag(other.uid, "daily").unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(second.get_blocks_by_version(version.uid).unwrap().is_empty());

        first.commit().unwrap();
        assert_eq!(second.get_blocks_by_version(version.uid).unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_uid_consistency_enforced() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096, 4096, false, false).unwrap();
        assert!(matches!(
            store.set_block(0, version.uid, BlockUid::new(1, 1), None, 4096, true, false),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_dedup_lookup_only_returns_valid_blocks() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 8192, 4096, false, false).unwrap();
        store
            .set_block(0, version.uid, BlockUid::new(5, 5), Some(&checksum(9)), 4096, true, false)
            .unwrap();
        assert_eq!(store.get_block_by_checksum(&checksum(9)).unwrap().unwrap().uid, BlockUid::new(5, 5));

        store.set_blocks_invalid(BlockUid::new(5, 5)).unwrap();
        assert!(store.get_block_by_checksum(&checksum(9)).unwrap().is_none());
    }

    #[test]
    fn test_set_blocks_invalid_cascades_to_versions() {
        let (_dir, mut store) = store();
        let shared = BlockUid::new(7, 7);
        let mut uids = Vec::new();
        for _ in 0..2 {
            let version = store.create_version("vm", "", 4096, 4096, true, false).unwrap();
            store
                .set_block(0, version.uid, shared, Some(&checksum(1)), 4096, true, false)
                .unwrap();
            uids.push(version.uid);
        }
        let other = store.create_version("vm", "", 4096, 4096, true, false).unwrap();
        store.commit().unwrap();

        let affected = store.set_blocks_invalid(shared).unwrap();
        assert_eq!(affected, uids);
        for uid in uids {
            assert!(!store.get_version(uid).unwrap().valid);
        }
        assert!(store.get_version(other.uid).unwrap().valid);
    }

    #[test]
    fn test_rm_version_tombstones_and_gc_candidates() {
        let (_dir, mut store) = store();
        let shared = BlockUid::new(1, 1);
        let unique = BlockUid::new(2, 2);

        let a = store.create_version("vm", "", 4096 * 3, 4096, true, false).unwrap();
        store.set_block(0, a.uid, shared, Some(&checksum(1)), 4096, true, false).unwrap();
        store.set_block(1, a.uid, unique, Some(&checksum(2)), 4096, true, false).unwrap();
        store.set_block(2, a.uid, BlockUid::sparse(), None, 4096, true, false).unwrap();
        let b = store.create_version("vm", "", 4096, 4096, true, false).unwrap();
        store.set_block(0, b.uid, shared, Some(&checksum(1)), 4096, true, false).unwrap();
        store.commit().unwrap();

        assert_eq!(store.rm_version(a.uid).unwrap(), 3);
        assert_eq!(store.count_tombstones().unwrap(), 2);
        assert!(matches!(store.get_version(a.uid), Err(Error::NotFound { .. })));

        let hits: Vec<BlockUid> = store
            .get_delete_candidates(Duration::ZERO)
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(hits, vec![unique]);
        assert_eq!(store.count_tombstones().unwrap(), 0);
    }

    #[test]
    fn test_delete_candidates_respect_min_age() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096, 4096, true, false).unwrap();
        store
            .set_block(0, version.uid, BlockUid::new(3, 3), Some(&checksum(3)), 4096, true, false)
            .unwrap();
        store.commit().unwrap();
        store.rm_version(version.uid).unwrap();

        let young: Vec<_> = store
            .get_delete_candidates(Duration::from_secs(3600))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(young.is_empty());
        assert_eq!(store.count_tombstones().unwrap(), 1);
    }

    #[test]
    fn test_delete_candidates_stream_in_batches() {
        let (_dir, mut store) = store();
        let count = DELETE_CANDIDATES_BATCH as u64 + 10;
        let version = store.create_version("vm", "", 4096 * count, 4096, true, false).unwrap();
        for id in 0..count {
            store
                .set_block(id, version.uid, BlockUid::new(id + 1, 1), Some(&checksum(1)), 4096, true, false)
                .unwrap();
        }
        store.commit().unwrap();
        store.rm_version(version.uid).unwrap();

        let batches: Vec<Vec<BlockUid>> = store
            .get_delete_candidates(Duration::ZERO)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), DELETE_CANDIDATES_BATCH);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>() as u64, count);
    }

    #[test]
    fn test_tags_and_filters() {
        let (_dir, mut store) = store();
        let a = store.create_version("vm1", "daily", 4096, 4096, true, false).unwrap();
        let b = store.create_version("vm2", "daily", 4096, 4096, true, false).unwrap();
        store.add_tag(a.uid, "keep").unwrap();
        assert!(matches!(store.add_tag(a.uid, "keep"), Err(Error::AlreadyExists { .. })));
        assert!(matches!(store.rm_tag(b.uid, "keep"), Err(Error::NotFound { .. })));

        let tagged = store.get_versions(&VersionFilter::default().with_tag("keep")).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].tags, vec!["keep".to_string()]);

        let named = store.get_versions(&VersionFilter::default().with_name("vm2")).unwrap();
        assert_eq!(named[0].uid, b.uid);
        assert_eq!(store.get_versions(&VersionFilter::default()).unwrap().len(), 2);

        store.rm_tag(a.uid, "keep").unwrap();
        assert!(store.get_version(a.uid).unwrap().tags.is_empty());
    }

    #[test]
    fn test_stats_survive_version_removal() {
        let (_dir, mut store) = store();
        let version = store.create_version("vm", "", 4096, 4096, true, false).unwrap();
        store
            .set_stats(&VersionStatistic {
                uid: version.uid,
                base_uid: None,
                hints_supplied: false,
                date: version.date,
                name: version.name.clone(),
                snapshot_name: String::new(),
                size: 4096,
                block_size: 4096,
                bytes_read: 4096,
                bytes_written: 4096,
                bytes_dedup: 0,
                bytes_sparse: 0,
                duration_seconds: 1,
            })
            .unwrap();
        store.rm_version(version.uid).unwrap();
        let stats = store.get_stats(Some(version.uid), None).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].bytes_written, 4096);
        assert_eq!(store.get_stats(None, Some(10)).unwrap().len(), 1);
    }
}
