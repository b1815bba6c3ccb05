//! Pairing payloads: the out-of-band handoff that points a second device at
//! the same relay session.
//!
//! The initiating device generates a fresh session id, summarizes its store,
//! and encodes everything as a compact code (URL-safe base64 of JSON) that
//! can be shown as text or a QR code. The joining device decodes it and
//! checks `expires_at` locally before touching the network.
//!
//! ## Security
//! - A payload is only a rendezvous hint; it carries no credentials
//! - Payloads expire after the configured TTL (default 5 minutes)

use crate::sync::error::SyncError;
use crate::sync::protocol::MetadataPayload;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub session_id: String,
    /// Initiating device.
    pub device_id: String,
    pub top_id: Option<String>,
    pub last_modified: Option<i64>,
    pub record_count: u64,
    pub relay_url: String,
    /// Unix milliseconds after which the payload must be rejected.
    pub expires_at: i64,
}

impl PairingPayload {
    /// Build a payload for a brand-new session.
    pub fn create(
        device_id: &str,
        metadata: &MetadataPayload,
        relay_url: &str,
        ttl: Duration,
        now: i64,
    ) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            top_id: metadata.top_id.clone(),
            last_modified: metadata.last_modified,
            record_count: metadata.record_count,
            relay_url: relay_url.to_string(),
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Reject an expired payload. Must run before connecting to the relay.
    pub fn validate(&self, now: i64) -> Result<(), SyncError> {
        if self.is_expired(now) {
            return Err(SyncError::ExpiredPairing {
                expires_at: self.expires_at,
                now,
            });
        }
        if self.session_id.trim().is_empty() {
            return Err(SyncError::InvalidPairing("empty session id".into()));
        }
        if self.relay_url.trim().is_empty() {
            return Err(SyncError::InvalidPairing("empty relay url".into()));
        }
        Ok(())
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self, now: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.expires_at.saturating_sub(now)).unwrap_or(0))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(code: &str) -> Result<Self, SyncError> {
        let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = URL_SAFE_NO_PAD
            .decode(compact.as_bytes())
            .map_err(|e| SyncError::InvalidPairing(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::InvalidPairing(e.to_string()))
    }
}
