use super::store::{open_connection, timestamp};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lock taken by operations that must not overlap with any version operation.
pub const GLOBAL_LOCK: &str = "global";

/// Named advisory locks stored in the metadata database.
///
/// A lock is identified by `(host, process_id, name)`. The process id is a
/// random uuid, so two stores opened in the same process do not share locks.
pub struct Locking {
    conn: Mutex<Connection>,
    host: String,
    process_id: String,
}

impl Locking {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
            host,
            process_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    fn holder_of(conn: &Connection, name: &str) -> Result<Option<(String, String, String)>> {
        Ok(conn
            .query_row(
                "SELECT host, process_id, reason FROM locks WHERE lock_name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    /// Takes lock `name`; it is released when the returned guard drops.
    pub fn lock(self: &Arc<Self>, name: &str, reason: &str) -> Result<LockGuard> {
        let conn = self.conn.lock();
        if let Some((host, process_id, held_for)) = Self::holder_of(&conn, name)? {
            if host == self.host && process_id == self.process_id {
                return Err(Error::Internal(format!("Lock {} is already held by this process", name)));
            }
            return Err(Error::AlreadyLocked {
                name: name.to_string(),
                holder: format!("{} ({}) for {}", host, process_id, held_for),
            });
        }

        // A racing locker makes the insert fail on the primary key.
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO locks(lock_name, host, process_id, reason, date) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, self.host, self.process_id, reason, timestamp(Utc::now())],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyLocked {
                name: name.to_string(),
                holder: "another process".to_string(),
            });
        }

        debug!(lock = name, reason, "Acquired lock");
        Ok(LockGuard {
            locking: Arc::clone(self),
            name: name.to_string(),
        })
    }

    pub fn is_locked(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT 1 FROM locks WHERE lock_name = ?1", params![name], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Fails with `AlreadyLocked`, naming the holder, while anyone holds `name`.
    pub fn ensure_unlocked(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        match Self::holder_of(&conn, name)? {
            Some((host, process_id, held_for)) => Err(Error::AlreadyLocked {
                name: name.to_string(),
                holder: format!("{} ({}) for {}", host, process_id, held_for),
            }),
            None => Ok(()),
        }
    }

    /// Names of all locks currently held by anyone.
    pub fn held(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT lock_name FROM locks ORDER BY lock_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Releases lock `name`, which must be held by this instance.
    pub fn unlock(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM locks WHERE lock_name = ?1 AND host = ?2 AND process_id = ?3",
            params![name, self.host, self.process_id],
        )?;
        if removed == 0 {
            return Err(Error::Internal(format!("Lock {} is not held by this process", name)));
        }
        debug!(lock = name, "Released lock");
        Ok(())
    }

    /// Releases everything this instance still holds and reports how much
    /// that was. Anything left over is a leak.
    pub fn unlock_all(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM locks WHERE host = ?1 AND process_id = ?2",
            params![self.host, self.process_id],
        )?;
        if removed > 0 {
            error!(count = removed, "Released locks that were still held");
        }
        Ok(removed)
    }
}

impl Drop for Locking {
    fn drop(&mut self) {
        if let Err(e) = self.unlock_all() {
            warn!("Failed to release locks: {}", e);
        }
    }
}

/// Releases its lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    locking: Arc<Locking>,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.locking.unlock(&self.name) {
            error!(lock = %self.name, "Failed to release lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;

    #[test]
    fn test_lock_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        let locking = store.locking();

        let guard = locking.lock("V0000000001", "backup").unwrap();
        assert!(locking.is_locked("V0000000001").unwrap());
        assert!(matches!(locking.lock("V0000000001", "again"), Err(Error::Internal(_))));
        drop(guard);
        assert!(!locking.is_locked("V0000000001").unwrap());
        assert!(locking.unlock("V0000000001").is_err());
    }

    #[test]
    fn test_other_process_sees_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite");
        let first = MetadataStore::open(&path, true).unwrap();
        let second = MetadataStore::open(&path, false).unwrap();

        let _guard = first.locking().lock(GLOBAL_LOCK, "cleanup").unwrap();
        match second.locking().lock(GLOBAL_LOCK, "cleanup") {
            Err(Error::AlreadyLocked { name, holder }) => {
                assert_eq!(name, GLOBAL_LOCK);
                assert!(holder.contains("cleanup"));
            }
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|g| g.name().to_string())),
        }
        assert!(second.locking().is_locked(GLOBAL_LOCK).unwrap());
        assert_eq!(second.locking().held().unwrap(), vec![GLOBAL_LOCK.to_string()]);

        match second.locking().ensure_unlocked(GLOBAL_LOCK) {
            Err(Error::AlreadyLocked { holder, .. }) => {
                assert!(holder.contains(first.locking().process_id()));
                assert!(holder.contains("cleanup"));
            }
            other => panic!("expected AlreadyLocked, got {:?}", other),
        }
        assert!(second.locking().ensure_unlocked("V0000000001").is_ok());
    }

    #[test]
    fn test_unlock_all_reports_leaks() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.sqlite"), true).unwrap();
        let locking = store.locking();
        let a = locking.lock("a", "test").unwrap();
        let b = locking.lock("b", "test").unwrap();
        assert_eq!(locking.unlock_all().unwrap(), 2);
        // Guards now find nothing to release and only log.
        drop(a);
        drop(b);
        assert_eq!(locking.unlock_all().unwrap(), 0);
    }
}
