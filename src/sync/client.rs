//! Device side of the relay: drives a [`SyncEngine`] over one WebSocket.
//!
//! The client owns no sync logic. It sends the engine's JOIN, feeds every
//! inbound text frame to [`SyncEngine::handle`], and writes whatever comes
//! back. It also keeps the connection alive with PING, paces SYNC_DATA
//! chunks, and gives up after the sync timeout.

use crate::config::SyncConfig;
use crate::sync::engine::{SyncEngine, SyncProgress};
use crate::sync::error::SyncError;
use crate::sync::protocol::{MessageType, SyncMessage};
use futures_util::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub ping_interval: Duration,
    pub sync_timeout: Duration,
    /// Pause between consecutive SYNC_DATA frames.
    pub chunk_delay: Duration,
    pub device_name: Option<String>,
}

impl ClientOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            sync_timeout: config.sync_timeout(),
            chunk_delay: config.chunk_delay(),
            device_name: None,
        }
    }

    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Connect to `relay_url` and run `engine` until it completes, fails, the
/// relay closes the connection, or the sync timeout elapses.
///
/// Records merged before a failure are kept; the engine has already logged
/// the attempt as `partial` or `failed` by the time this returns an error.
pub async fn run_sync(
    engine: &mut SyncEngine,
    relay_url: &str,
    options: &ClientOptions,
) -> Result<SyncProgress, SyncError> {
    let (ws_stream, _response) = match tokio_tungstenite::connect_async(relay_url).await {
        Ok(conn) => conn,
        Err(e) => {
            let reason = format!("failed to connect to {relay_url}: {e}");
            engine.fail(&reason);
            return Err(SyncError::Transport(reason));
        }
    };
    tracing::info!(
        relay = relay_url,
        session_id = %engine.session_id(),
        device_id = %engine.device_id(),
        "Connected to relay"
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut first = vec![engine.join_message(options.device_name.as_deref())?];
    first.extend(engine.on_joined()?);
    if let Err(e) = send_all(&mut ws_sender, first, options.chunk_delay).await {
        engine.fail(&e.to_string());
        return Err(e);
    }

    let deadline = Instant::now() + options.sync_timeout;
    let ping_every = options.ping_interval.max(Duration::from_secs(1));
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);

    let result: Result<(), SyncError> = loop {
        if engine.is_complete() {
            break Ok(());
        }

        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg = match SyncMessage::parse(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!("Ignoring unparseable frame from relay: {e}");
                            continue;
                        }
                    };
                    let outbound = match engine.handle(&msg) {
                        Ok(outbound) => outbound,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = send_all(&mut ws_sender, outbound, options.chunk_delay).await {
                        engine.fail(&e.to_string());
                        break Err(e);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    engine.on_disconnect();
                    break Err(SyncError::Transport("relay closed the connection".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let reason = format!("relay connection error: {e}");
                    engine.fail(&reason);
                    break Err(SyncError::Transport(reason));
                }
            },
            _ = ping.tick() => {
                let msg = SyncMessage::new(
                    MessageType::Ping,
                    engine.session_id(),
                    engine.device_id(),
                    serde_json::Value::Null,
                );
                if let Err(e) = send_all(&mut ws_sender, vec![msg], Duration::ZERO).await {
                    engine.fail(&e.to_string());
                    break Err(e);
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                let e = SyncError::Timeout(options.sync_timeout.as_secs());
                engine.fail(&e.to_string());
                break Err(e);
            }
        }
    };

    // Best effort: the relay treats a dropped socket the same way.
    let _ = ws_sender.send(WsMessage::Close(None)).await;

    result?;
    let progress = engine.progress();
    tracing::info!(
        session_id = %engine.session_id(),
        sent = progress.sent,
        received = progress.received,
        "Disconnected after sync"
    );
    Ok(progress)
}

/// Write frames in order, sleeping `chunk_delay` between SYNC_DATA frames.
async fn send_all<S>(
    sink: &mut S,
    messages: Vec<SyncMessage>,
    chunk_delay: Duration,
) -> Result<(), SyncError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut previous_was_data = false;
    for msg in messages {
        let is_data = msg.kind == MessageType::SyncData;
        if is_data && previous_was_data && !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
        previous_was_data = is_data;

        let text = msg.to_json()?;
        sink.send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| SyncError::Transport(format!("send {} failed: {e}", msg.kind)))?;
    }
    Ok(())
}
