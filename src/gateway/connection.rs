//! One relay WebSocket connection.
//!
//! A connection starts unjoined. Its first JOIN fixes `(session_id,
//! device_id)` for the rest of its life. Afterwards every relayable frame
//! must carry that identity and is forwarded byte-for-byte to the other
//! participants. PING is answered directly and never relayed.
//!
//! The connection ends on close, read error, missing JOIN within the grace
//! period, idle timeout, or when the registry drops its outbound channel
//! (session swept or device re-joined elsewhere). Its [`SessionHandle`] is
//! dropped on every exit path, which leaves the session exactly once.

use super::AppState;
use crate::sync::protocol::{
    ErrorPayload, MessageType, PongPayload, ProtocolError, SyncMessage, RELAY_DEVICE_ID,
};
use crate::sync::registry::{Outbound, RegistryError, SessionHandle, SessionRegistry};
use crate::util::{epoch_millis, truncate_with_ellipsis};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Session id placed on relay errors sent before a JOIN.
const UNJOINED_SESSION: &str = "unjoined";

/// Protocol state of one connection, independent of the socket so it can be
/// exercised directly.
pub struct RelayConnection {
    registry: Arc<SessionRegistry>,
    channel_capacity: usize,
    handle: Option<SessionHandle>,
    /// Receiver created by a successful JOIN, collected by the socket loop.
    joined_rx: Option<mpsc::Receiver<Outbound>>,
}

impl RelayConnection {
    pub fn new(registry: Arc<SessionRegistry>, channel_capacity: usize) -> Self {
        Self {
            registry,
            channel_capacity: channel_capacity.max(1),
            handle: None,
            joined_rx: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.handle.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.handle.as_ref().map(SessionHandle::session_id)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.handle.as_ref().map(SessionHandle::device_id)
    }

    /// Outbound stream for this connection, available once after JOIN.
    pub fn take_joined_receiver(&mut self) -> Option<mpsc::Receiver<Outbound>> {
        self.joined_rx.take()
    }

    /// Handle one inbound text frame. Returns frames to send straight back
    /// to this connection (PONG, ERROR).
    pub fn on_text(&mut self, text: &str) -> Vec<String> {
        let msg = match SyncMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    frame = %truncate_with_ellipsis(text, 120),
                    "Rejected malformed frame"
                );
                return vec![self.error_frame(ErrorPayload::from(&e))];
            }
        };

        match msg.kind {
            MessageType::Ping => vec![self.pong_frame(&msg)],
            MessageType::Join => self.on_join(&msg, text),
            kind if kind.is_relayed() => self.on_relayed(&msg, text),
            _ => Vec::new(),
        }
    }

    fn on_join(&mut self, msg: &SyncMessage, text: &str) -> Vec<String> {
        if let Some(handle) = &self.handle {
            let e = ProtocolError::AlreadyJoined(handle.session_id().to_string());
            return vec![self.error_frame(ErrorPayload::from(&e))];
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let handle = match self.registry.join(&msg.session_id, &msg.from_device, tx) {
            Ok(handle) => handle,
            Err(e @ RegistryError::SessionFull { .. }) => {
                tracing::warn!(session_id = %msg.session_id, device_id = %msg.from_device, "{e}");
                return vec![self.error_frame(ErrorPayload {
                    code: "session_full".into(),
                    message: e.to_string(),
                })];
            }
            Err(e) => {
                tracing::warn!(session_id = %msg.session_id, "JOIN failed: {e}");
                return vec![self.error_frame(ErrorPayload {
                    code: "join_failed".into(),
                    message: e.to_string(),
                })];
            }
        };
        tracing::info!(
            session_id = %msg.session_id,
            device_id = %msg.from_device,
            "Device joined"
        );

        self.forward(&msg.session_id, &msg.from_device, text);
        self.handle = Some(handle);
        self.joined_rx = Some(rx);
        Vec::new()
    }

    fn on_relayed(&mut self, msg: &SyncMessage, text: &str) -> Vec<String> {
        let Some(handle) = &self.handle else {
            let e = ProtocolError::NotJoined;
            return vec![self.error_frame(ErrorPayload::from(&e))];
        };
        if msg.session_id != handle.session_id() || msg.from_device != handle.device_id() {
            let e = ProtocolError::IdentityMismatch {
                session_id: msg.session_id.clone(),
                device_id: msg.from_device.clone(),
            };
            tracing::warn!(
                session_id = %handle.session_id(),
                device_id = %handle.device_id(),
                "{e}"
            );
            return vec![self.error_frame(ErrorPayload::from(&e))];
        }

        self.forward(handle.session_id(), handle.device_id(), text);
        Vec::new()
    }

    fn forward(&self, session_id: &str, from_device: &str, text: &str) {
        let frame: Outbound = Arc::from(text);
        match self.registry.broadcast_except(session_id, from_device, &frame) {
            Ok(report) => tracing::trace!(
                session_id,
                from = from_device,
                delivered = report.delivered,
                failed = report.failed,
                "Relayed frame"
            ),
            Err(e) => tracing::warn!(session_id, from = from_device, "Dropped frame: {e}"),
        }
    }

    fn pong_frame(&self, ping: &SyncMessage) -> String {
        let pong = SyncMessage::with_payload(
            MessageType::Pong,
            ping.session_id.clone(),
            RELAY_DEVICE_ID,
            &PongPayload {
                server_time: epoch_millis(),
            },
        )
        .map(|m| m.to(ping.from_device.clone()));
        encode_or_fallback(pong)
    }

    fn error_frame(&self, payload: ErrorPayload) -> String {
        let session_id = self.session_id().unwrap_or(UNJOINED_SESSION).to_string();
        let mut error =
            SyncMessage::with_payload(MessageType::Error, session_id, RELAY_DEVICE_ID, &payload);
        if let (Ok(msg), Some(device_id)) = (&mut error, self.device_id()) {
            msg.to_device = Some(device_id.to_string());
        }
        encode_or_fallback(error)
    }
}

fn encode_or_fallback(msg: Result<SyncMessage, serde_json::Error>) -> String {
    msg.and_then(|m| m.to_json()).unwrap_or_else(|e| {
        tracing::error!("Failed to encode relay frame: {e}");
        String::from(concat!(
            r#"{"type":"ERROR","session_id":"unjoined","from_device":"relay","#,
            r#""payload":{"code":"internal","message":"encode failure"}}"#,
        ))
    })
}

/// Outbound frames for this connection; pending forever before JOIN.
async fn next_outbound(rx: &mut Option<mpsc::Receiver<Outbound>>) -> Option<Outbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Why a connection ended (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    JoinTimeout,
    IdleTimeout,
    Evicted,
}

/// Drive one upgraded WebSocket until it ends.
pub async fn run(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut conn = RelayConnection::new(Arc::clone(&state.registry), state.config.channel_capacity);
    let mut outbound: Option<mpsc::Receiver<Outbound>> = None;

    let join_deadline = Instant::now() + state.config.join_timeout();
    let idle_timeout = state.config.idle_timeout();
    let mut idle_deadline = Instant::now() + idle_timeout;

    let reason = loop {
        let deadline = if conn.is_joined() {
            idle_deadline
        } else {
            join_deadline.min(idle_deadline)
        };

        tokio::select! {
            frame = ws_receiver.next() => {
                idle_deadline = Instant::now() + idle_timeout;
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let replies = conn.on_text(text.as_str());
                        if let Some(rx) = conn.take_joined_receiver() {
                            outbound = Some(rx);
                        }
                        let mut failed = false;
                        for reply in replies {
                            if ws_sender.send(Message::Text(reply.into())).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break CloseReason::WriteError;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let e = ProtocolError::Malformed("binary frames are not supported".into());
                        let reply = conn.error_frame(ErrorPayload::from(&e));
                        if ws_sender.send(Message::Text(reply.into())).await.is_err() {
                            break CloseReason::WriteError;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket read error: {e}");
                        break CloseReason::ReadError;
                    }
                }
            }
            frame = next_outbound(&mut outbound) => match frame {
                Some(frame) => {
                    if ws_sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break CloseReason::WriteError;
                    }
                }
                None => break CloseReason::Evicted,
            },
            () = tokio::time::sleep_until(deadline) => {
                if conn.is_joined() || Instant::now() < join_deadline {
                    break CloseReason::IdleTimeout;
                }
                break CloseReason::JoinTimeout;
            }
        }
    };

    match reason {
        CloseReason::JoinTimeout => {
            tracing::info!("Closing connection: no JOIN within grace period");
        }
        CloseReason::IdleTimeout => tracing::info!(
            session_id = conn.session_id().unwrap_or(UNJOINED_SESSION),
            device_id = conn.device_id().unwrap_or(""),
            "Closing idle connection"
        ),
        other => tracing::debug!(
            reason = ?other,
            session_id = conn.session_id().unwrap_or(UNJOINED_SESSION),
            device_id = conn.device_id().unwrap_or(""),
            "Connection closed"
        ),
    }

    if !matches!(
        reason,
        CloseReason::PeerClosed | CloseReason::ReadError | CloseReason::WriteError
    ) {
        let _ = ws_sender.send(Message::Close(None)).await;
    }
    // Dropping `conn` drops its SessionHandle, which leaves the session.
    drop(conn);
}

// ── Tests ───────────────────────────────────────────────────────
