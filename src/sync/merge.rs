//! Last-write-wins record merge.
//!
//! Two replicas that apply the same set of incoming records converge to the
//! same content regardless of arrival order:
//!
//!   1. **Higher `updated_at` wins** (numeric comparison, no clock sync).
//!   2. **On a tie**: the lexicographically smaller `device_id` wins.
//!   3. **Still tied**: a tombstone beats a live record.
//!   4. **Still tied**: the smaller canonical payload JSON wins.
//!
//! Merging never changes `created_at` or `device_id` on an existing record;
//! only `payload`, `updated_at` and `deleted` are taken from the winner.

use crate::store::{Record, RecordStore, RecordVersion};
use anyhow::Result;
use std::cmp::Ordering;

/// Order two versions by the first three rules. `Greater` means `a` wins.
fn compare_versions(a: &RecordVersion, b: &RecordVersion) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| b.device_id.cmp(&a.device_id))
        .then_with(|| a.deleted.cmp(&b.deleted))
}

/// True if `candidate` strictly beats `current` on the ordering fields.
///
/// Used when planning an exchange from metadata, where payloads are not
/// available.
pub fn version_wins(candidate: &RecordVersion, current: &RecordVersion) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Returns `true` if `incoming` should overwrite `local`.
pub fn lww_resolve(local: &Record, incoming: &Record) -> bool {
    match compare_versions(&incoming.version(), &local.version()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => canonical_payload(&incoming.payload) < canonical_payload(&local.payload),
    }
}

fn canonical_payload(payload: &serde_json::Value) -> String {
    // serde_json's default map is ordered, so this is key-order independent.
    payload.to_string()
}

/// What a single merge did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Inserted,
    Updated,
    Unchanged,
}

/// Merge one incoming record against the local copy.
///
/// Returns the record to store (if any) and what happened.
pub fn merge_record(local: Option<&Record>, incoming: &Record) -> (Option<Record>, MergeAction) {
    match local {
        None => (Some(incoming.clone()), MergeAction::Inserted),
        Some(existing) if lww_resolve(existing, incoming) => {
            let mut merged = existing.clone();
            merged.payload = incoming.payload.clone();
            merged.updated_at = incoming.updated_at;
            merged.deleted = incoming.deleted;
            (Some(merged), MergeAction::Updated)
        }
        Some(_) => (None, MergeAction::Unchanged),
    }
}

/// Totals for a batch of merged records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Records whose `updated_at` was outside the clock-skew tolerance.
    /// They are merged normally.
    pub skewed: u64,
}

impl MergeReport {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }

    pub fn add(&mut self, other: MergeReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skewed += other.skewed;
    }
}

/// Merge `records` into `store`.
///
/// `now` and `skew_tolerance` (both milliseconds) only drive the clock-skew
/// warning; they never change the outcome.
pub fn merge_into_store(
    store: &dyn RecordStore,
    records: &[Record],
    now: i64,
    skew_tolerance: i64,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    for incoming in records {
        if incoming.updated_at.abs_diff(now) > skew_tolerance.unsigned_abs() {
            report.skewed += 1;
            tracing::warn!(
                id = %incoming.id,
                device_id = %incoming.device_id,
                updated_at = incoming.updated_at,
                now,
                "Clock skew: incoming record timestamp far from local clock"
            );
        }

        let local = store.get(&incoming.id)?;
        let (to_store, action) = merge_record(local.as_ref(), incoming);
        if let Some(record) = to_store {
            store.upsert(&record)?;
        }
        match action {
            MergeAction::Inserted => report.inserted += 1,
            MergeAction::Updated => report.updated += 1,
            MergeAction::Unchanged => report.unchanged += 1,
        }
    }
    Ok(report)
}

// ── Tests ───────────────────────────────────────────────────────
