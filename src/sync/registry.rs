//! In-memory registry of ephemeral sync sessions.
//!
//! A session exists only while devices are connected to it. It is created by
//! the first JOIN for an unseen id, deleted as soon as its last participant
//! leaves, and force-evicted by [`SessionRegistry::sweep`] once it outlives
//! the TTL. Nothing is written to disk.
//!
//! ## Locking
//!
//! - The session map has its own `RwLock`; each session guards its
//!   participant set with its own `Mutex`, so traffic in one session never
//!   waits on another.
//! - Lock order is always map → session. Removal of an empty session marks
//!   it closed under the session lock, releases that lock, then removes the
//!   map entry only if it still points at the same session. A join that
//!   finds a closed session replaces it with a fresh one.
//! - Locks are held only for map/set mutation and non-blocking sends; no
//!   lock is held across an `.await`.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A serialized frame queued for one participant.
pub type Outbound = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {session_id} is full ({max} participants)")]
    SessionFull { session_id: String, max: usize },
}

struct Participant {
    /// Distinguishes a device's current connection from a replaced one.
    conn_id: u64,
    tx: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct Participants {
    by_device: HashMap<String, Participant>,
    /// Set once the session is being removed; joins must not land here.
    closed: bool,
}

/// One live session. Never persisted.
pub struct SyncSession {
    session_id: String,
    created_at: Instant,
    participants: Mutex<Participants>,
}

impl SyncSession {
    fn new(session_id: &str, created_at: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at,
            participants: Mutex::new(Participants::default()),
        }
    }

    fn is_closed(&self) -> bool {
        self.participants.lock().closed
    }
}

/// Delivery totals for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub participants: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SyncSession>>>,
    ttl: Duration,
    /// 0 = unlimited.
    max_participants: usize,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(ttl: Duration, max_participants: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            max_participants,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Add `device_id` to `session_id`, creating the session if needed.
    ///
    /// A device that joins again replaces its earlier channel; the earlier
    /// channel's sender is dropped, which ends that connection's outbound
    /// stream. The returned handle removes this participant when dropped.
    pub fn join(
        self: &Arc<Self>,
        session_id: &str,
        device_id: &str,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<SessionHandle, RegistryError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        loop {
            let session = self.session_for_join(session_id);
            let mut participants = session.participants.lock();
            if participants.closed {
                // Lost a race with removal; the next lookup replaces it.
                continue;
            }
            if self.max_participants > 0
                && !participants.by_device.contains_key(device_id)
                && participants.by_device.len() >= self.max_participants
            {
                return Err(RegistryError::SessionFull {
                    session_id: session_id.to_string(),
                    max: self.max_participants,
                });
            }

            let replaced = participants
                .by_device
                .insert(device_id.to_string(), Participant { conn_id, tx })
                .is_some();
            let count = participants.by_device.len();
            drop(participants);

            if replaced {
                tracing::info!(
                    session_id,
                    device_id,
                    "Device re-joined; replaced earlier connection"
                );
            }
            tracing::debug!(session_id, device_id, participants = count, "Device joined session");
            return Ok(SessionHandle {
                registry: Arc::clone(self),
                session_id: session_id.to_string(),
                device_id: device_id.to_string(),
                conn_id,
                left: false,
            });
        }
    }

    fn session_for_join(&self, session_id: &str) -> Arc<SyncSession> {
        if let Some(session) = self.sessions.read().get(session_id) {
            if !session.is_closed() {
                return Arc::clone(session);
            }
        }
        let mut sessions = self.sessions.write();
        match sessions.get(session_id) {
            Some(session) if !session.is_closed() => Arc::clone(session),
            _ => {
                let session = Arc::new(SyncSession::new(session_id, Instant::now()));
                sessions.insert(session_id.to_string(), Arc::clone(&session));
                tracing::info!(session_id, "Created sync session");
                session
            }
        }
    }

    /// Remove `device_id` from `session_id`, deleting the session if it is
    /// now empty. Returns whether the device was present.
    pub fn leave(&self, session_id: &str, device_id: &str) -> bool {
        self.remove_participant(session_id, device_id, None)
    }

    fn remove_participant(&self, session_id: &str, device_id: &str, conn_id: Option<u64>) -> bool {
        let Some(session) = self.sessions.read().get(session_id).cloned() else {
            return false;
        };

        let now_empty = {
            let mut participants = session.participants.lock();
            let matches = participants
                .by_device
                .get(device_id)
                .is_some_and(|p| conn_id.is_none_or(|id| p.conn_id == id));
            if !matches {
                return false;
            }
            participants.by_device.remove(device_id);
            if participants.by_device.is_empty() {
                participants.closed = true;
            }
            participants.closed
        };
        tracing::debug!(session_id, device_id, "Device left session");

        if now_empty {
            let mut sessions = self.sessions.write();
            if sessions
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(session_id);
                tracing::info!(session_id, "Removed empty sync session");
            }
        }
        true
    }

    /// Queue `message` for every participant of `session_id` except
    /// `from_device`.
    ///
    /// Delivery is non-blocking. A participant whose queue is full or closed
    /// is logged and skipped; the remaining participants still receive the
    /// frame.
    pub fn broadcast_except(
        &self,
        session_id: &str,
        from_device: &str,
        message: &Outbound,
    ) -> Result<BroadcastReport, RegistryError> {
        let session = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

        let participants = session.participants.lock();
        if participants.closed {
            return Err(RegistryError::SessionNotFound(session_id.to_string()));
        }

        let mut report = BroadcastReport::default();
        for (device_id, participant) in &participants.by_device {
            if device_id == from_device {
                continue;
            }
            match participant.tx.try_send(Arc::clone(message)) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.failed += 1;
                    tracing::warn!(
                        session_id,
                        to = %device_id,
                        "Outbound queue full; dropped frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.failed += 1;
                    tracing::debug!(
                        session_id,
                        to = %device_id,
                        "Outbound queue closed; dropped frame"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Evict sessions older than the TTL. Call periodically.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock.
    ///
    /// Dropping each participant's sender closes its channel, which ends
    /// the owning connection.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let mut removed = 0;
        sessions.retain(|session_id, session| {
            if now.saturating_duration_since(session.created_at) <= self.ttl {
                return true;
            }
            let mut participants = session.participants.lock();
            let closed_channels = participants.by_device.len();
            participants.by_device.clear();
            participants.closed = true;
            removed += 1;
            tracing::info!(
                session_id = %session_id,
                closed_channels,
                "Swept expired sync session"
            );
            false
        });
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Device ids currently in `session_id` (sorted; empty if unknown).
    pub fn participants(&self, session_id: &str) -> Vec<String> {
        let Some(session) = self.sessions.read().get(session_id).cloned() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = session
            .participants
            .lock()
            .by_device
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Counts for diagnostics.
    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        RegistryStats {
            sessions: sessions.len(),
            participants: sessions
                .values()
                .map(|s| s.participants.lock().by_device.len())
                .sum(),
        }
    }
}

/// Membership of one connection in one session.
///
/// Leaves the session exactly once: on [`leave`](Self::leave) or, failing
/// that, on drop. A handle whose participant was replaced by a newer
/// connection of the same device leaves nothing behind.
pub struct SessionHandle {
    registry: Arc<SessionRegistry>,
    session_id: String,
    device_id: String,
    conn_id: u64,
    left: bool,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn leave(mut self) {
        self.leave_once();
    }

    fn leave_once(&mut self) {
        if !self.left {
            self.left = true;
            self.registry
                .remove_participant(&self.session_id, &self.device_id, Some(self.conn_id));
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.leave_once();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────
