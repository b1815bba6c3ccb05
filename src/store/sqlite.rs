//! SQLite-backed record store.
//!
//! Tables:
//! - `records`: id, payload (JSON text), device_id, created_at, updated_at, deleted
//! - `devices`: device_id, device_name, created_at, last_sync_at, is_local
//! - `sync_log`: one row per sync attempt with a remote device

use super::{Device, Record, RecordStore, RecordVersion, SyncDirection, SyncLogEntry, SyncStatus};
use crate::util::epoch_millis;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;

pub struct SqliteRecordStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the record database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = rusqlite::Connection::open(db_path)
            .with_context(|| format!("Failed to open record database {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                device_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at);

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                device_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_sync_at INTEGER,
                is_local INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                remote_device_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                sent_count INTEGER NOT NULL,
                received_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_log_started ON sync_log(started_at);",
        )?;
        Ok(())
    }

    // ── Devices ─────────────────────────────────────────────────────

    /// Return this store's own device, creating it on first use.
    ///
    /// The generated id is a UUID; the name defaults to the host name.
    pub fn local_device(&self) -> Result<Device> {
        let conn = self.conn.lock();
        let existing = conn.query_row(
            "SELECT device_id, device_name, created_at, last_sync_at
             FROM devices WHERE is_local = 1 LIMIT 1",
            [],
            row_to_device,
        );
        match existing {
            Ok(device) => return Ok(device),
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(e.into()),
        }

        let device = Device {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
            created_at: epoch_millis(),
            last_sync_at: None,
        };
        conn.execute(
            "INSERT INTO devices (device_id, device_name, created_at, last_sync_at, is_local)
             VALUES (?1, ?2, ?3, NULL, 1)",
            rusqlite::params![device.device_id, device.device_name, device.created_at],
        )?;
        tracing::info!(
            device_id = %device.device_id,
            name = %device.device_name,
            "Created local device identity"
        );
        Ok(device)
    }

    /// Rename the local device.
    pub fn rename_local_device(&self, name: &str) -> Result<()> {
        self.local_device()?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET device_name = ?1 WHERE is_local = 1",
            rusqlite::params![name.trim()],
        )?;
        Ok(())
    }

    /// Look up a device by id.
    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT device_id, device_name, created_at, last_sync_at
             FROM devices WHERE device_id = ?1",
            rusqlite::params![device_id],
            row_to_device,
        );
        match row {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Records ─────────────────────────────────────────────────────

    /// All records ordered by creation time.
    pub fn list_records(&self, include_deleted: bool) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, device_id, created_at, updated_at, deleted
             FROM records WHERE deleted = 0 OR ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![include_deleted], row_to_raw)?;
        let records = rows
            .map(|r| r?.into_record())
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    // ── Sync history ────────────────────────────────────────────────

    /// Most recent sync attempts, newest first.
    pub fn sync_history(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, remote_device_id, direction, sent_count, received_count,
                    status, started_at, completed_at, error
             FROM sync_log ORDER BY started_at DESC, id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(rusqlite::params![limit], |row| {
            let direction: String = row.get(2)?;
            let status: String = row.get(5)?;
            Ok(SyncLogEntry {
                session_id: row.get(0)?,
                remote_device_id: row.get(1)?,
                direction: SyncDirection::parse(&direction).unwrap_or(SyncDirection::Neither),
                sent_count: row.get::<_, i64>(3)?.max(0) as u64,
                received_count: row.get::<_, i64>(4)?.max(0) as u64,
                status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Failed),
                started_at: row.get(6)?,
                completed_at: row.get(7)?,
                error: row.get(8)?,
            })
        })?;
        let history = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, payload, device_id, created_at, updated_at, deleted
             FROM records WHERE id = ?1",
            rusqlite::params![id],
            row_to_raw,
        );
        match row {
            Ok(raw) => Ok(Some(raw.into_record()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (id, payload, device_id, created_at, updated_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                device_id = excluded.device_id,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted",
            rusqlite::params![
                record.id,
                payload,
                record.device_id,
                record.created_at,
                record.updated_at,
                record.deleted
            ],
        )?;
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM records ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    fn list_changed_since(&self, since: i64) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, device_id, created_at, updated_at, deleted
             FROM records WHERE updated_at > ?1 ORDER BY updated_at, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![since], row_to_raw)?;
        let records = rows
            .map(|r| r?.into_record())
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_versions(&self) -> Result<Vec<(String, RecordVersion)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, updated_at, device_id, deleted FROM records ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RecordVersion {
                    updated_at: row.get(1)?,
                    device_id: row.get(2)?,
                    deleted: row.get(3)?,
                },
            ))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_synced(&self, device_id: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (device_id, device_name, created_at, last_sync_at, is_local)
             VALUES (?1, ?1, ?2, ?2, 0)
             ON CONFLICT(device_id) DO UPDATE SET last_sync_at = excluded.last_sync_at",
            rusqlite::params![device_id, at],
        )?;
        Ok(())
    }

    fn log_sync(&self, entry: &SyncLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_log (session_id, remote_device_id, direction, sent_count,
                                   received_count, status, started_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                entry.session_id,
                entry.remote_device_id,
                entry.direction.as_str(),
                i64::try_from(entry.sent_count).unwrap_or(i64::MAX),
                i64::try_from(entry.received_count).unwrap_or(i64::MAX),
                entry.status.as_str(),
                entry.started_at,
                entry.completed_at,
                entry.error
            ],
        )?;
        Ok(())
    }
}

/// Row shape before the payload JSON is parsed.
struct RawRecord {
    id: String,
    payload: String,
    device_id: String,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
}

impl RawRecord {
    fn into_record(self) -> Result<Record> {
        let payload = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for record {}", self.id))?;
        Ok(Record {
            id: self.id,
            payload,
            device_id: self.device_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted: self.deleted,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        payload: row.get(1)?,
        device_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        deleted: row.get(5)?,
    })
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        device_name: row.get(1)?,
        created_at: row.get(2)?,
        last_sync_at: row.get(3)?,
    })
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unnamed-device".into())
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteRecordStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteRecordStore::open(&tmp.path().join("records.db")).unwrap();
        (tmp, store)
    }

    fn record(id: &str, updated_at: i64, deleted: bool) -> Record {
        Record {
            id: id.into(),
            payload: json!({"title": id}),
            device_id: "dev-a".into(),
            created_at: 1,
            updated_at,
            deleted,
        }
    }

    #[test]
    fn upsert_and_get() {
        let (_tmp, store) = test_store();
        let r = record("a", 10, false);
        store.upsert(&r).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(r));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn upsert_replaces_existing() {
        let (_tmp, store) = test_store();
        store.upsert(&record("a", 10, false)).unwrap();
        let mut newer = record("a", 20, true);
        newer.payload = json!({"title": "changed"});
        store.upsert(&newer).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(newer));
        assert_eq!(store.list_ids().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn list_ids_includes_tombstones() {
        let (_tmp, store) = test_store();
        store.upsert(&record("a", 10, false)).unwrap();
        store.upsert(&record("b", 10, true)).unwrap();
        assert_eq!(store.list_ids().unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_records(false).unwrap().len(), 1);
        assert_eq!(store.list_records(true).unwrap().len(), 2);
    }

    #[test]
    fn list_changed_since_filters_and_orders() {
        let (_tmp, store) = test_store();
        store.upsert(&record("a", 30, false)).unwrap();
        store.upsert(&record("b", 10, false)).unwrap();
        store.upsert(&record("c", 20, true)).unwrap();
        let changed: Vec<String> = store
            .list_changed_since(15)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(changed, vec!["c", "a"]);
    }

    #[test]
    fn get_many_skips_unknown_ids() {
        let (_tmp, store) = test_store();
        store.upsert(&record("a", 10, false)).unwrap();
        let got = store
            .get_many(&["a".to_string(), "zzz".to_string()])
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "a");
    }

    #[test]
    fn list_versions_reports_ordering_fields() {
        let (_tmp, store) = test_store();
        store.upsert(&record("a", 10, true)).unwrap();
        let versions = store.list_versions().unwrap();
        assert_eq!(
            versions,
            vec![(
                "a".to_string(),
                RecordVersion {
                    updated_at: 10,
                    device_id: "dev-a".into(),
                    deleted: true,
                }
            )]
        );
    }

    #[test]
    fn local_device_is_stable() {
        let (tmp, store) = test_store();
        let first = store.local_device().unwrap();
        let second = store.local_device().unwrap();
        assert_eq!(first, second);
        drop(store);

        let reopened = SqliteRecordStore::open(&tmp.path().join("records.db")).unwrap();
        assert_eq!(reopened.local_device().unwrap().device_id, first.device_id);
    }

    #[test]
    fn rename_local_device() {
        let (_tmp, store) = test_store();
        store.rename_local_device("  laptop ").unwrap();
        assert_eq!(store.local_device().unwrap().device_name, "laptop");
    }

    #[test]
    fn mark_synced_registers_remote_device() {
        let (_tmp, store) = test_store();
        store.mark_synced("remote-1", 500).unwrap();
        let device = store.get_device("remote-1").unwrap().unwrap();
        assert_eq!(device.last_sync_at, Some(500));

        store.mark_synced("remote-1", 900).unwrap();
        let device = store.get_device("remote-1").unwrap().unwrap();
        assert_eq!(device.last_sync_at, Some(900));
        assert_eq!(device.created_at, 500);
    }

    #[test]
    fn sync_log_newest_first() {
        let (_tmp, store) = test_store();
        for (i, status) in [SyncStatus::Complete, SyncStatus::Partial].iter().enumerate() {
            store
                .log_sync(&SyncLogEntry {
                    session_id: format!("s{i}"),
                    remote_device_id: "remote".into(),
                    direction: SyncDirection::from_counts(3, i as u64),
                    sent_count: 3,
                    received_count: i as u64,
                    status: *status,
                    started_at: 100 + i as i64,
                    completed_at: 200 + i as i64,
                    error: None,
                })
                .unwrap();
        }
        let history = store.sync_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].session_id, "s1");
        assert_eq!(history[0].status, SyncStatus::Partial);
        assert_eq!(history[0].direction, SyncDirection::Both);
        assert_eq!(history[1].direction, SyncDirection::Push);
        assert_eq!(store.sync_history(1).unwrap().len(), 1);
    }

    #[test]
    fn in_memory_store_works() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.upsert(&record("a", 1, false)).unwrap();
        assert_eq!(store.list_ids().unwrap().len(), 1);
    }
}
