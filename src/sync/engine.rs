//! Sync Engine: the per-device state machine that reconciles a local store
//! with every peer in a relay session.
//!
//! The engine performs no I/O of its own. The transport feeds it inbound
//! [`SyncMessage`]s and sends whatever it returns, in order.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──JOIN sent──▶ Joined ──metadata sent──▶ MetadataSent
//!      ──peer metadata──▶ Reconciling ──all peers done──▶ Complete
//! any non-terminal state ──disconnect / ERROR──▶ Failed
//! ```
//!
//! ## Per-peer exchange
//!
//! - On a peer's METADATA_EXCHANGE: compute a [`SyncPlan`], send
//!   REQUEST_SYNC for what we lack and push what the peer lacks as SYNC_DATA.
//! - On REQUEST_SYNC: answer with SYNC_DATA (tombstones included), minus
//!   anything already pushed to that peer.
//! - On SYNC_DATA: merge with last-write-wins.
//! - Once our requests are satisfied, send SYNC_COMPLETE. A peer is done when
//!   completions have gone both ways.
//! - A peer's JOIN restarts the exchange with that peer: we (re)send our
//!   metadata addressed to it.

use crate::store::{RecordStore, SyncDirection, SyncLogEntry, SyncStatus};
use crate::sync::batch::{split_into_batches, BatchAssembler, BatchProgress};
use crate::sync::error::SyncError;
use crate::sync::merge::{merge_into_store, MergeReport};
use crate::sync::protocol::{
    ErrorPayload, JoinPayload, MessageType, MetadataPayload, RequestSyncPayload,
    SyncCompletePayload, SyncDataPayload, SyncMessage, SyncPlan,
};
use crate::util::epoch_millis;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ── State Machine ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Joined,
    MetadataSent,
    Reconciling,
    Complete,
    Failed { reason: String },
}

impl SyncState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joined => "joined",
            Self::MetadataSent => "metadata_sent",
            Self::Reconciling => "reconciling",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }
}

/// Tuning knobs for one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Records per SYNC_DATA chunk.
    pub chunk_size: usize,
    /// Clock-skew warning threshold, milliseconds.
    pub skew_tolerance_ms: i64,
    /// Number of peers that must finish before the engine completes.
    pub expected_peers: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::schema::DEFAULT_CHUNK_SIZE,
            skew_tolerance_ms: 24 * 3600 * 1000,
            expected_peers: 1,
        }
    }
}

/// Exchange bookkeeping for one remote device.
#[derive(Debug)]
struct PeerProgress {
    metadata_seen: bool,
    /// Requested ids not yet received.
    awaiting: HashSet<String>,
    /// Ids already sent, so a later REQUEST_SYNC does not resend them.
    pushed: HashSet<String>,
    sent: u64,
    received: u64,
    complete_sent: bool,
    complete_received: Option<SyncCompletePayload>,
    started_at: i64,
}

impl PeerProgress {
    fn new(now: i64) -> Self {
        Self {
            metadata_seen: false,
            awaiting: HashSet::new(),
            pushed: HashSet::new(),
            sent: 0,
            received: 0,
            complete_sent: false,
            complete_received: None,
            started_at: now,
        }
    }

    fn is_done(&self) -> bool {
        self.complete_sent && self.complete_received.is_some()
    }
}

/// Snapshot for progress display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub state: &'static str,
    pub peers: usize,
    pub peers_done: usize,
    pub sent: u64,
    pub received: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skewed: u64,
}

pub struct SyncEngine {
    store: Arc<dyn RecordStore>,
    device_id: String,
    session_id: String,
    options: EngineOptions,
    state: SyncState,
    peers: BTreeMap<String, PeerProgress>,
    assembler: BatchAssembler,
    merged: MergeReport,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            session_id: session_id.into(),
            options,
            state: SyncState::Idle,
            peers: BTreeMap::new(),
            assembler: BatchAssembler::new(),
            merged: MergeReport::default(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SyncState::Complete
    }

    pub fn progress(&self) -> SyncProgress {
        SyncProgress {
            state: self.state.name(),
            peers: self.peers.len(),
            peers_done: self.peers.values().filter(|p| p.is_done()).count(),
            sent: self.peers.values().map(|p| p.sent).sum(),
            received: self.peers.values().map(|p| p.received).sum(),
            inserted: self.merged.inserted,
            updated: self.merged.updated,
            skewed: self.merged.skewed,
        }
    }

    // ── Outbound ────────────────────────────────────────────────

    /// The JOIN frame that admits this device into the session.
    pub fn join_message(&self, device_name: Option<&str>) -> Result<SyncMessage, SyncError> {
        self.message(
            MessageType::Join,
            &JoinPayload {
                device_name: device_name.map(String::from),
            },
        )
    }

    /// Call once the JOIN has been sent. Returns the metadata broadcast.
    pub fn on_joined(&mut self) -> Result<Vec<SyncMessage>, SyncError> {
        if self.state != SyncState::Idle {
            tracing::debug!(state = self.state.name(), "on_joined ignored outside Idle");
            return Ok(Vec::new());
        }
        self.state = SyncState::Joined;
        let metadata = self.metadata_message(None)?;
        self.state = SyncState::MetadataSent;
        tracing::info!(
            session_id = %self.session_id,
            device_id = %self.device_id,
            "Joined session; metadata sent"
        );
        Ok(vec![metadata])
    }

    fn message<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
    ) -> Result<SyncMessage, SyncError> {
        Ok(SyncMessage::with_payload(
            kind,
            &self.session_id,
            &self.device_id,
            payload,
        )?)
    }

    fn local_metadata(&self) -> Result<MetadataPayload, SyncError> {
        Ok(MetadataPayload::from_versions(self.store.list_versions()?))
    }

    fn metadata_message(&self, to: Option<&str>) -> Result<SyncMessage, SyncError> {
        let msg = self.message(MessageType::MetadataExchange, &self.local_metadata()?)?;
        Ok(match to {
            Some(peer) => msg.to(peer),
            None => msg,
        })
    }

    /// Fetch `ids` and wrap them as SYNC_DATA chunks addressed to `peer`.
    fn data_messages(&mut self, peer: &str, ids: &[String]) -> Result<Vec<SyncMessage>, SyncError> {
        let progress = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerProgress::new(epoch_millis()));
        let fresh: Vec<String> = ids
            .iter()
            .filter(|id| !progress.pushed.contains(*id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.store.get_many(&fresh)?;
        if records.len() < fresh.len() {
            tracing::debug!(
                peer,
                missing = fresh.len() - records.len(),
                "Requested records not found locally; skipped"
            );
        }
        progress.sent += records.len() as u64;
        progress.pushed.extend(records.iter().map(|r| r.id.clone()));

        let mut out = Vec::new();
        for chunk in split_into_batches(records, self.options.chunk_size) {
            out.push(
                SyncMessage::with_payload(
                    MessageType::SyncData,
                    &self.session_id,
                    &self.device_id,
                    &chunk,
                )?
                .to(peer),
            );
        }
        Ok(out)
    }

    // ── Inbound Message Dispatch ────────────────────────────────

    /// Handle one inbound frame. Returns frames to send, in order.
    ///
    /// Any error moves the engine to `Failed`.
    pub fn handle(&mut self, msg: &SyncMessage) -> Result<Vec<SyncMessage>, SyncError> {
        if self.state.is_terminal() {
            tracing::debug!(
                kind = %msg.kind,
                from = %msg.from_device,
                "Engine finished; frame ignored"
            );
            return Ok(Vec::new());
        }
        if msg.from_device == self.device_id || msg.is_addressed_elsewhere(&self.device_id) {
            return Ok(Vec::new());
        }
        if msg.session_id != self.session_id {
            tracing::warn!(
                expected = %self.session_id,
                got = %msg.session_id,
                "Frame for another session ignored"
            );
            return Ok(Vec::new());
        }

        match self.dispatch(msg) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn dispatch(&mut self, msg: &SyncMessage) -> Result<Vec<SyncMessage>, SyncError> {
        let peer = msg.from_device.as_str();
        match msg.kind {
            MessageType::Join => self.handle_peer_join(peer),
            MessageType::MetadataExchange => {
                let remote: MetadataPayload = msg.payload_as()?;
                self.handle_metadata(peer, &remote)
            }
            MessageType::RequestSync => {
                let request: RequestSyncPayload = msg.payload_as()?;
                self.handle_request(peer, &request)
            }
            MessageType::SyncData => {
                let chunk: SyncDataPayload = msg.payload_as()?;
                self.handle_data(peer, &chunk)
            }
            MessageType::SyncComplete => {
                let complete: SyncCompletePayload = msg.payload_as()?;
                self.handle_complete(peer, complete)
            }
            MessageType::Error => {
                let error: ErrorPayload = msg.payload_as().unwrap_or_else(|_| ErrorPayload {
                    code: "unknown".into(),
                    message: msg.payload.to_string(),
                });
                Err(SyncError::Remote {
                    from: peer.to_string(),
                    code: error.code,
                    message: error.message,
                })
            }
            MessageType::Ping | MessageType::Pong => Ok(Vec::new()),
        }
    }

    fn handle_peer_join(&mut self, peer: &str) -> Result<Vec<SyncMessage>, SyncError> {
        if matches!(self.state, SyncState::Idle | SyncState::Joined) {
            return Ok(Vec::new());
        }
        if self.peers.contains_key(peer) {
            tracing::info!(peer, "Peer re-joined; restarting exchange with it");
        } else {
            tracing::info!(peer, "Peer joined session");
        }
        self.peers
            .insert(peer.to_string(), PeerProgress::new(epoch_millis()));
        self.assembler.forget_peer(&self.session_id, peer);
        Ok(vec![self.metadata_message(Some(peer))?])
    }

    fn handle_metadata(
        &mut self,
        peer: &str,
        remote: &MetadataPayload,
    ) -> Result<Vec<SyncMessage>, SyncError> {
        let local = self.local_metadata()?;
        let progress = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerProgress::new(epoch_millis()));
        if progress.metadata_seen {
            tracing::debug!(peer, "Duplicate metadata ignored");
            return Ok(Vec::new());
        }
        progress.metadata_seen = true;

        let plan = SyncPlan::compute(&local, remote);
        tracing::info!(
            peer,
            remote_records = remote.record_count,
            need = plan.need_from_remote.len(),
            offer = plan.remote_needs.len(),
            "Planned exchange"
        );
        self.state = SyncState::Reconciling;

        let mut out = Vec::new();
        if !plan.need_from_remote.is_empty() {
            progress
                .awaiting
                .extend(plan.need_from_remote.iter().cloned());
            out.push(
                self.message(
                    MessageType::RequestSync,
                    &RequestSyncPayload {
                        ids: plan.need_from_remote.clone(),
                    },
                )?
                .to(peer),
            );
        }
        out.extend(self.data_messages(peer, &plan.remote_needs)?);
        out.extend(self.check_peer_done(peer)?);
        Ok(out)
    }

    fn handle_request(
        &mut self,
        peer: &str,
        request: &RequestSyncPayload,
    ) -> Result<Vec<SyncMessage>, SyncError> {
        let out = self.data_messages(peer, &request.ids)?;
        tracing::debug!(
            peer,
            requested = request.ids.len(),
            chunks = out.len(),
            "Answered record request"
        );
        Ok(out)
    }

    fn handle_data(
        &mut self,
        peer: &str,
        chunk: &SyncDataPayload,
    ) -> Result<Vec<SyncMessage>, SyncError> {
        let progress = self.assembler.accept(&self.session_id, peer, chunk)?;
        if progress == BatchProgress::Duplicate {
            tracing::debug!(peer, batch_index = chunk.batch_index, "Duplicate chunk skipped");
            return Ok(Vec::new());
        }

        let report = merge_into_store(
            self.store.as_ref(),
            &chunk.records,
            epoch_millis(),
            self.options.skew_tolerance_ms,
        )?;
        self.merged.add(report);

        let peer_progress = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerProgress::new(epoch_millis()));
        peer_progress.received += chunk.records.len() as u64;
        for record in &chunk.records {
            peer_progress.awaiting.remove(&record.id);
        }

        if let BatchProgress::Complete { records } = progress {
            tracing::debug!(peer, records, batch_id = %chunk.batch_id, "Transfer complete");
        }
        tracing::debug!(
            peer,
            batch_index = chunk.batch_index,
            total_batches = chunk.total_batches,
            inserted = report.inserted,
            updated = report.updated,
            "Merged chunk"
        );
        self.check_peer_done(peer)
    }

    fn handle_complete(
        &mut self,
        peer: &str,
        complete: SyncCompletePayload,
    ) -> Result<Vec<SyncMessage>, SyncError> {
        let progress = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerProgress::new(epoch_millis()));
        progress.complete_received = Some(complete);
        tracing::debug!(
            peer,
            peer_sent = complete.sent_count,
            peer_received = complete.received_count,
            "Peer reported completion"
        );
        self.check_peer_done(peer)
    }

    /// Send SYNC_COMPLETE to `peer` once our side of its exchange is
    /// finished, then check whether the whole session is.
    fn check_peer_done(&mut self, peer: &str) -> Result<Vec<SyncMessage>, SyncError> {
        let mut out = Vec::new();
        let Some(progress) = self.peers.get_mut(peer) else {
            return Ok(out);
        };
        if progress.metadata_seen && progress.awaiting.is_empty() && !progress.complete_sent {
            progress.complete_sent = true;
            let payload = SyncCompletePayload {
                sent_count: progress.sent,
                received_count: progress.received,
            };
            out.push(self.message(MessageType::SyncComplete, &payload)?.to(peer));
        }
        self.check_all_done()?;
        Ok(out)
    }

    fn check_all_done(&mut self) -> Result<(), SyncError> {
        if self.state != SyncState::Reconciling {
            return Ok(());
        }
        let done = self.peers.values().filter(|p| p.is_done()).count();
        if done < self.options.expected_peers.max(1) || done < self.peers.len() {
            return Ok(());
        }

        let now = epoch_millis();
        for (peer, progress) in &self.peers {
            self.store.mark_synced(peer, now)?;
            self.store
                .log_sync(&self.log_entry(peer, progress, SyncStatus::Complete, now, None))?;
        }
        self.state = SyncState::Complete;
        tracing::info!(
            session_id = %self.session_id,
            peers = done,
            inserted = self.merged.inserted,
            updated = self.merged.updated,
            "Sync complete"
        );
        Ok(())
    }

    fn log_entry(
        &self,
        peer: &str,
        progress: &PeerProgress,
        status: SyncStatus,
        now: i64,
        error: Option<String>,
    ) -> SyncLogEntry {
        SyncLogEntry {
            session_id: self.session_id.clone(),
            remote_device_id: peer.to_string(),
            direction: SyncDirection::from_counts(progress.sent, progress.received),
            sent_count: progress.sent,
            received_count: progress.received,
            status,
            started_at: progress.started_at,
            completed_at: now,
            error,
        }
    }

    // ── Failure ─────────────────────────────────────────────────

    /// Abort the sync. Records merged so far stay; each peer's exchange is
    /// logged as `partial` if anything arrived from it, else `failed`.
    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        let now = epoch_millis();
        for (peer, progress) in &self.peers {
            let status = if progress.received > 0 {
                SyncStatus::Partial
            } else {
                SyncStatus::Failed
            };
            let entry = self.log_entry(peer, progress, status, now, Some(reason.to_string()));
            if let Err(e) = self.store.log_sync(&entry) {
                tracing::warn!(peer = %peer, "Failed to record sync log: {e}");
            }
        }
        tracing::warn!(
            session_id = %self.session_id,
            state = self.state.name(),
            received = self.merged.total(),
            "Sync failed: {reason}"
        );
        self.state = SyncState::Failed {
            reason: reason.to_string(),
        };
    }

    /// The transport closed. Fails unless the engine already completed.
    pub fn on_disconnect(&mut self) {
        self.fail("connection closed before sync completed");
    }

    /// The error to report for a run that did not complete.
    pub fn outcome(&self) -> Result<(), SyncError> {
        match &self.state {
            SyncState::Complete => Ok(()),
            SyncState::Failed { reason } => Err(SyncError::PartialSync {
                reason: reason.clone(),
                received: self.merged.inserted + self.merged.updated,
            }),
            other => Err(SyncError::PartialSync {
                reason: format!("stopped in state {}", other.name()),
                received: self.merged.inserted + self.merged.updated,
            }),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
