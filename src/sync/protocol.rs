//! Sync wire protocol: the JSON envelope relayed between devices, its
//! payload shapes, and the metadata comparison that plans an exchange.
//!
//! Every frame on `/sync` is one [`SyncMessage`] encoded as a JSON text
//! frame. The relay only inspects the envelope fields; payloads are opaque
//! to it and interpreted by the sync engine on each device.

use crate::store::{Record, RecordVersion};
use crate::sync::merge::version_wins;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Device id used on frames the relay itself originates (PONG, ERROR).
pub const RELAY_DEVICE_ID: &str = "relay";

// ── Errors ──────────────────────────────────────────────────────

/// A frame that violates the envelope rules.
///
/// The relay answers these with an ERROR frame and keeps the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("message identity ({session_id}/{device_id}) does not match this connection")]
    IdentityMismatch { session_id: String, device_id: String },
    #[error("connection has not joined a session")]
    NotJoined,
    #[error("connection already joined session {0}")]
    AlreadyJoined(String),
}

impl ProtocolError {
    /// Stable machine-readable code carried in ERROR payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownType(_) => "unknown_type",
            Self::MissingField(_) => "missing_field",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined(_) => "already_joined",
        }
    }
}

// ── Envelope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Join,
    MetadataExchange,
    RequestSync,
    SyncData,
    SyncComplete,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::MetadataExchange => "METADATA_EXCHANGE",
            Self::RequestSync => "REQUEST_SYNC",
            Self::SyncData => "SYNC_DATA",
            Self::SyncComplete => "SYNC_COMPLETE",
            Self::Error => "ERROR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "JOIN" => Self::Join,
            "METADATA_EXCHANGE" => Self::MetadataExchange,
            "REQUEST_SYNC" => Self::RequestSync,
            "SYNC_DATA" => Self::SyncData,
            "SYNC_COMPLETE" => Self::SyncComplete,
            "ERROR" => Self::Error,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            _ => return None,
        })
    }

    /// Types the relay forwards verbatim to the other participants.
    pub fn is_relayed(self) -> bool {
        matches!(
            self,
            Self::MetadataExchange
                | Self::RequestSync
                | Self::SyncData
                | Self::SyncComplete
                | Self::Error
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: String,
    pub from_device: String,
    /// Set when a frame is meant for one participant. The relay still
    /// broadcasts it; other receivers ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_device: Option<String>,
    /// Sender's wall clock, unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SyncMessage {
    pub fn new(
        kind: MessageType,
        session_id: impl Into<String>,
        from_device: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            from_device: from_device.into(),
            to_device: None,
            timestamp: crate::util::epoch_millis(),
            payload,
        }
    }

    /// Build a message with a typed payload.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        session_id: impl Into<String>,
        from_device: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            kind,
            session_id,
            from_device,
            serde_json::to_value(payload)?,
        ))
    }

    #[must_use]
    pub fn to(mut self, device_id: impl Into<String>) -> Self {
        self.to_device = Some(device_id.into());
        self
    }

    /// Parse and validate a text frame.
    ///
    /// Field-by-field so that each failure maps to a precise
    /// [`ProtocolError`] rather than a generic serde message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("expected a JSON object".into()))?;

        let kind_str = obj
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?;
        let kind = MessageType::parse(kind_str)
            .ok_or_else(|| ProtocolError::UnknownType(kind_str.to_string()))?;

        let session_id = non_empty_str(obj, "session_id")?;
        let from_device = non_empty_str(obj, "from_device")?;
        let to_device = match obj.get("to_device") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(ProtocolError::Malformed("to_device must be a string".into())),
        };
        let timestamp = match obj.get("timestamp") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| ProtocolError::Malformed("timestamp must be an integer".into()))?,
        };
        let payload = obj.get("payload").cloned().unwrap_or_default();

        Ok(Self {
            kind,
            session_id,
            from_device,
            to_device,
            timestamp,
            payload,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the payload into its typed shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    /// True if the frame is addressed to someone other than `device_id`.
    pub fn is_addressed_elsewhere(&self, device_id: &str) -> bool {
        self.to_device.as_deref().is_some_and(|to| to != device_id)
    }
}

fn non_empty_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<String, ProtocolError> {
    obj.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or(ProtocolError::MissingField(field))
}

// ── Payloads ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Summary of a device's records, exchanged right after joining.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    /// Largest id held, tombstones included.
    pub top_id: Option<String>,
    /// Highest `updated_at` over live records.
    pub last_modified: Option<i64>,
    /// Number of live records.
    pub record_count: u64,
    /// Every id held, tombstones included.
    pub full_id_list: Vec<String>,
    /// Ordering fields per id, used to detect diverged copies of shared ids.
    #[serde(default)]
    pub versions: BTreeMap<String, RecordVersion>,
}

impl MetadataPayload {
    /// Summarize a store's `(id, version)` listing.
    pub fn from_versions(versions: Vec<(String, RecordVersion)>) -> Self {
        let live = versions.iter().filter(|(_, v)| !v.deleted);
        let record_count = live.clone().count() as u64;
        let last_modified = live.map(|(_, v)| v.updated_at).max();

        let mut full_id_list: Vec<String> = versions.iter().map(|(id, _)| id.clone()).collect();
        full_id_list.sort();
        Self {
            top_id: full_id_list.last().cloned(),
            last_modified,
            record_count,
            full_id_list,
            versions: versions.into_iter().collect(),
        }
    }
}

/// Ask a peer for specific records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSyncPayload {
    pub ids: Vec<String>,
}

/// One chunk of a record transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDataPayload {
    /// Groups the chunks of one transfer.
    pub batch_id: String,
    pub batch_index: u32,
    pub total_batches: u32,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCompletePayload {
    pub sent_count: u64,
    pub received_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub server_time: i64,
}

// ── Exchange Planning ───────────────────────────────────────────

/// What to pull from and push to one peer, derived from both metadata
/// summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Ids the peer holds that we lack, or hold an older copy of.
    pub need_from_remote: Vec<String>,
    /// Ids we hold that the peer lacks, or holds an older copy of.
    pub remote_needs: Vec<String>,
}

impl SyncPlan {
    pub fn compute(local: &MetadataPayload, remote: &MetadataPayload) -> Self {
        let local_ids: HashSet<&str> = local.full_id_list.iter().map(String::as_str).collect();
        let remote_ids: HashSet<&str> = remote.full_id_list.iter().map(String::as_str).collect();

        let mut need_from_remote: Vec<String> = remote_ids
            .difference(&local_ids)
            .map(|s| (*s).to_string())
            .collect();
        let mut remote_needs: Vec<String> = local_ids
            .difference(&remote_ids)
            .map(|s| (*s).to_string())
            .collect();

        for id in local_ids.intersection(&remote_ids) {
            let (Some(ours), Some(theirs)) = (local.versions.get(*id), remote.versions.get(*id))
            else {
                continue;
            };
            if version_wins(theirs, ours) {
                need_from_remote.push((*id).to_string());
            } else if version_wins(ours, theirs) {
                remote_needs.push((*id).to_string());
            }
        }

        need_from_remote.sort();
        remote_needs.sort();
        Self {
            need_from_remote,
            remote_needs,
        }
    }

    /// True if there is nothing to sync in either direction.
    pub fn is_empty(&self) -> bool {
        self.need_from_remote.is_empty() && self.remote_needs.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version(updated_at: i64, device_id: &str) -> RecordVersion {
        RecordVersion {
            updated_at,
            device_id: device_id.into(),
            deleted: false,
        }
    }

    fn meta(entries: &[(&str, i64)]) -> MetadataPayload {
        MetadataPayload::from_versions(
            entries
                .iter()
                .map(|(id, ts)| ((*id).to_string(), version(*ts, "dev")))
                .collect(),
        )
    }

    #[test]
    fn message_type_wire_names() {
        let msg = SyncMessage::new(MessageType::MetadataExchange, "s1", "dev-a", json!({}));
        let text = msg.to_json().unwrap();
        assert!(text.contains("\"type\":\"METADATA_EXCHANGE\""));
        assert!(!text.contains("to_device"));
        assert_eq!(SyncMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(matches!(
            SyncMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SyncMessage::parse("[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = SyncMessage::parse(r#"{"type":"HELLO","session_id":"s","from_device":"d"}"#)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("HELLO".into()));
        assert_eq!(err.code(), "unknown_type");
    }

    #[test]
    fn parse_requires_session_id() {
        let err = SyncMessage::parse(r#"{"type":"PING","from_device":"d"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("session_id"));
        let err = SyncMessage::parse(r#"{"type":"PING","session_id":"  ","from_device":"d"}"#)
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("session_id"));
    }

    #[test]
    fn parse_requires_from_device() {
        let err = SyncMessage::parse(r#"{"type":"JOIN","session_id":"s"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("from_device"));
    }

    #[test]
    fn parse_defaults_optional_fields() {
        let msg = SyncMessage::parse(r#"{"type":"PING","session_id":"s","from_device":"d"}"#)
            .unwrap();
        assert_eq!(msg.timestamp, 0);
        assert_eq!(msg.payload, serde_json::Value::Null);
        assert_eq!(msg.to_device, None);
    }

    #[test]
    fn addressed_elsewhere() {
        let msg = SyncMessage::new(MessageType::RequestSync, "s", "a", json!({})).to("b");
        assert!(msg.is_addressed_elsewhere("c"));
        assert!(!msg.is_addressed_elsewhere("b"));
        let broadcast = SyncMessage::new(MessageType::RequestSync, "s", "a", json!({}));
        assert!(!broadcast.is_addressed_elsewhere("c"));
    }

    #[test]
    fn payload_as_reports_kind() {
        let msg = SyncMessage::new(MessageType::RequestSync, "s", "a", json!({"ids": 5}));
        let err = msg.payload_as::<RequestSyncPayload>().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: MessageType::RequestSync,
                ..
            }
        ));
    }

    #[test]
    fn only_data_frames_are_relayed() {
        assert!(MessageType::SyncData.is_relayed());
        assert!(MessageType::Error.is_relayed());
        assert!(!MessageType::Join.is_relayed());
        assert!(!MessageType::Ping.is_relayed());
        assert!(!MessageType::Pong.is_relayed());
    }

    #[test]
    fn error_payload_carries_stable_code() {
        let payload = ErrorPayload::from(&ProtocolError::MissingField("session_id"));
        assert_eq!(payload.code, "missing_field");
        assert_eq!(payload.message, "missing or empty field: session_id");
    }

    #[test]
    fn metadata_summary_ignores_tombstones_for_counts() {
        let mut deleted = version(99, "dev");
        deleted.deleted = true;
        let meta = MetadataPayload::from_versions(vec![
            ("b".into(), version(20, "dev")),
            ("a".into(), version(10, "dev")),
            ("z".into(), deleted),
        ]);
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.last_modified, Some(20));
        assert_eq!(meta.top_id.as_deref(), Some("z"));
        assert_eq!(meta.full_id_list, vec!["a", "b", "z"]);
        assert_eq!(meta.versions.len(), 3);
    }

    #[test]
    fn top_id_is_largest_id_not_latest_update() {
        let meta = meta(&[("a", 99), ("z", 1)]);
        assert_eq!(meta.top_id.as_deref(), Some("z"));
        assert_eq!(meta.last_modified, Some(99));
    }

    #[test]
    fn metadata_of_empty_store() {
        let meta = MetadataPayload::from_versions(Vec::new());
        assert_eq!(meta.record_count, 0);
        assert_eq!(meta.top_id, None);
        assert_eq!(meta.last_modified, None);
    }

    #[test]
    fn plan_is_set_difference_both_ways() {
        let x = meta(&[("a", 10), ("b", 20)]);
        let y = meta(&[("b", 20), ("c", 30)]);
        let plan = SyncPlan::compute(&x, &y);
        assert_eq!(plan.need_from_remote, vec!["c"]);
        assert_eq!(plan.remote_needs, vec!["a"]);

        let reverse = SyncPlan::compute(&y, &x);
        assert_eq!(reverse.need_from_remote, vec!["a"]);
        assert_eq!(reverse.remote_needs, vec!["c"]);
    }

    #[test]
    fn plan_pushes_newer_copy_of_shared_id() {
        let x = meta(&[("a", 10), ("b", 20)]);
        let y = meta(&[("b", 15), ("c", 30)]);
        let plan = SyncPlan::compute(&x, &y);
        assert_eq!(plan.need_from_remote, vec!["c"]);
        assert_eq!(plan.remote_needs, vec!["a", "b"]);
    }

    #[test]
    fn plan_empty_when_identical() {
        let x = meta(&[("a", 10)]);
        assert!(SyncPlan::compute(&x, &x.clone()).is_empty());
    }

    #[test]
    fn plan_without_versions_falls_back_to_ids() {
        let mut x = meta(&[("a", 10)]);
        let mut y = meta(&[("a", 50)]);
        x.versions.clear();
        y.versions.clear();
        assert!(SyncPlan::compute(&x, &y).is_empty());
    }
}
