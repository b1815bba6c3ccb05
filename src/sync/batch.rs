//! Chunked record transfer.
//!
//! Senders split a record set into SYNC_DATA chunks of bounded size, each
//! tagged with `batch_index`/`total_batches` and a shared `batch_id`.
//! Receivers merge every chunk as it arrives (merging is idempotent) and use
//! [`BatchAssembler`] to know when a whole transfer has landed.

use crate::store::Record;
use crate::sync::protocol::{MessageType, ProtocolError, SyncDataPayload};
use std::collections::{BTreeSet, HashMap};

/// Split `records` into chunks of at most `chunk_size`.
///
/// An empty input yields no chunks. A `chunk_size` of 0 is treated as 1.
pub fn split_into_batches(records: Vec<Record>, chunk_size: usize) -> Vec<SyncDataPayload> {
    if records.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let batch_id = uuid::Uuid::new_v4().to_string();
    let total = records.len().div_ceil(chunk_size);
    let total_batches = u32::try_from(total).unwrap_or(u32::MAX);

    let mut batches = Vec::with_capacity(total);
    let mut iter = records.into_iter().peekable();
    let mut index: u32 = 0;
    while iter.peek().is_some() {
        let chunk: Vec<Record> = iter.by_ref().take(chunk_size).collect();
        batches.push(SyncDataPayload {
            batch_id: batch_id.clone(),
            batch_index: index,
            total_batches,
            records: chunk,
        });
        index = index.saturating_add(1);
    }
    batches
}

/// Reassembly state for one inbound transfer.
#[derive(Debug)]
struct BatchState {
    total_batches: u32,
    seen: BTreeSet<u32>,
    records: u64,
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress {
    /// More chunks of this transfer are outstanding.
    Partial { received: u32, total: u32 },
    /// Every chunk has arrived; `records` is the transfer's total.
    Complete { records: u64 },
    /// This chunk index was already seen.
    Duplicate,
}

/// Tracks inbound transfers keyed by `(session_id, from_device, batch_id)`.
#[derive(Debug, Default)]
pub struct BatchAssembler {
    pending: HashMap<(String, String, String), BatchState>,
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chunk. Completed transfers are forgotten.
    pub fn accept(
        &mut self,
        session_id: &str,
        from_device: &str,
        chunk: &SyncDataPayload,
    ) -> Result<BatchProgress, ProtocolError> {
        if chunk.total_batches == 0 || chunk.batch_index >= chunk.total_batches {
            return Err(invalid(format!(
                "batch_index {} out of range for total_batches {}",
                chunk.batch_index, chunk.total_batches
            )));
        }

        let key = (
            session_id.to_string(),
            from_device.to_string(),
            chunk.batch_id.clone(),
        );
        let state = self.pending.entry(key.clone()).or_insert_with(|| BatchState {
            total_batches: chunk.total_batches,
            seen: BTreeSet::new(),
            records: 0,
        });
        if state.total_batches != chunk.total_batches {
            return Err(invalid(format!(
                "total_batches changed from {} to {} within batch {}",
                state.total_batches, chunk.total_batches, chunk.batch_id
            )));
        }
        if !state.seen.insert(chunk.batch_index) {
            return Ok(BatchProgress::Duplicate);
        }
        state.records += chunk.records.len() as u64;

        let received = u32::try_from(state.seen.len()).unwrap_or(u32::MAX);
        if received == state.total_batches {
            let records = state.records;
            self.pending.remove(&key);
            Ok(BatchProgress::Complete { records })
        } else {
            Ok(BatchProgress::Partial {
                received,
                total: state.total_batches,
            })
        }
    }

    /// Transfers still waiting for chunks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop partial state for one peer (e.g. after it re-joined).
    pub fn forget_peer(&mut self, session_id: &str, from_device: &str) {
        self.pending
            .retain(|(s, d, _), _| !(s == session_id && d == from_device));
    }
}

fn invalid(reason: String) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: MessageType::SyncData,
        reason,
    }
}

// ── Tests ───────────────────────────────────────────────────────
