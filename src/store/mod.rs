//! Device-local record storage.
//!
//! The sync engine only talks to [`RecordStore`]; [`SqliteRecordStore`] is
//! the implementation the CLI uses.

pub mod sqlite;

pub use sqlite::SqliteRecordStore;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A versioned application record.
///
/// `updated_at` strictly increases on every local mutation and is the only
/// cross-device ordering signal. Tombstones (`deleted = true`) are never
/// purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub payload: serde_json::Value,
    /// Device that created the record. Never changes.
    pub device_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a new record owned by `device_id`.
    ///
    /// The id has the form `{device_id}-{created_at}-{suffix}`.
    pub fn new(device_id: &str, payload: serde_json::Value, now: i64) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{device_id}-{now}-{}", &suffix[..8]),
            payload,
            device_id: device_id.to_string(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Replace the payload, bumping `updated_at` past its previous value even
    /// if the wall clock has not moved.
    pub fn edit(&mut self, payload: serde_json::Value, now: i64) {
        self.payload = payload;
        self.touch(now);
    }

    /// Turn the record into a tombstone.
    pub fn tombstone(&mut self, now: i64) {
        self.deleted = true;
        self.touch(now);
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now.max(self.updated_at.saturating_add(1));
    }

    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            updated_at: self.updated_at,
            device_id: self.device_id.clone(),
            deleted: self.deleted,
        }
    }
}

/// The ordering-relevant part of a record, exchanged in metadata so peers
/// can tell which side holds the newer copy of a shared id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub updated_at: i64,
    pub device_id: String,
    #[serde(default)]
    pub deleted: bool,
}

/// A known device (the local one or a past sync partner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub device_name: String,
    pub created_at: i64,
    pub last_sync_at: Option<i64>,
}

/// Outcome of a sync with one remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Complete,
    /// Some records were merged before the exchange was cut short.
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which way records moved during one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Nothing moved; the replicas already matched.
    Neither,
    Push,
    Pull,
    Both,
}

impl SyncDirection {
    pub fn from_counts(sent: u64, received: u64) -> Self {
        match (sent > 0, received > 0) {
            (false, false) => Self::Neither,
            (true, false) => Self::Push,
            (false, true) => Self::Pull,
            (true, true) => Self::Both,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neither => "none",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::Neither),
            "push" => Some(Self::Push),
            "pull" => Some(Self::Pull),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// One row of the local sync history.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogEntry {
    pub session_id: String,
    pub remote_device_id: String,
    pub direction: SyncDirection,
    pub sent_count: u64,
    pub received_count: u64,
    pub status: SyncStatus,
    pub started_at: i64,
    pub completed_at: i64,
    pub error: Option<String>,
}

/// Storage interface consumed by the sync engine.
///
/// Implementations must be safe to share across tasks. Calls are expected to
/// be short (local disk), so the interface is synchronous.
pub trait RecordStore: Send + Sync {
    /// Fetch one record, tombstones included.
    fn get(&self, id: &str) -> Result<Option<Record>>;

    /// Fetch several records; ids that do not exist are skipped.
    fn get_many(&self, ids: &[String]) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Insert or fully replace a record.
    fn upsert(&self, record: &Record) -> Result<()>;

    /// All ids, tombstones included.
    fn list_ids(&self) -> Result<Vec<String>>;

    /// Records with `updated_at > since`, oldest first.
    fn list_changed_since(&self, since: i64) -> Result<Vec<Record>>;

    /// `(id, version)` for every record, tombstones included.
    fn list_versions(&self) -> Result<Vec<(String, RecordVersion)>>;

    /// Record that a sync with `device_id` completed at `at`, registering the
    /// device if it is new.
    fn mark_synced(&self, device_id: &str, at: i64) -> Result<()>;

    /// Append to the sync history.
    fn log_sync(&self, entry: &SyncLogEntry) -> Result<()>;
}
