use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sessions older than this are evicted by the sweep (15 minutes).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;

/// How often the relay sweeps expired sessions (10 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10 * 60;

/// Records per SYNC_DATA chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Incoming timestamps further than this from the local clock are flagged.
pub const DEFAULT_CLOCK_SKEW_TOLERANCE_SECS: u64 = 24 * 3600;

// ── Relay ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address for the relay server.
    pub host: String,
    /// Bind port. `PORT` in the environment takes precedence.
    pub port: u16,
    /// A connection that has not sent JOIN within this window is closed.
    pub join_timeout_secs: u64,
    /// A connection that sends nothing (not even PING) for this long is closed.
    pub idle_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Upper bound on devices per session (0 = unlimited).
    pub max_participants: usize,
    /// Outbound frames buffered per connection before frames are dropped.
    pub channel_capacity: usize,
    /// Largest accepted WebSocket frame.
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 80,
            join_timeout_secs: 10,
            idle_timeout_secs: 60,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_participants: 8,
            channel_capacity: 1024,
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Sync ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Path of the local record database. Supports `~` expansion.
    pub database_path: String,
    /// WebSocket URL of the relay's `/sync` endpoint.
    pub relay_url: String,
    pub chunk_size: usize,
    /// Pause between consecutive SYNC_DATA chunks (0 = no pacing).
    pub chunk_delay_ms: u64,
    /// Keep-alive PING cadence while connected to the relay.
    pub ping_interval_secs: u64,
    /// The whole exchange fails if it has not completed within this window.
    pub sync_timeout_secs: u64,
    /// Lifetime of a freshly generated pairing payload.
    pub pairing_ttl_secs: u64,
    pub clock_skew_tolerance_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            relay_url: "ws://127.0.0.1:80/sync".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: 0,
            ping_interval_secs: 20,
            sync_timeout_secs: 300,
            pairing_ttl_secs: 300,
            clock_skew_tolerance_secs: DEFAULT_CLOCK_SKEW_TOLERANCE_SECS,
        }
    }
}

impl SyncConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Tolerance in the same unit as record timestamps (milliseconds).
    pub fn clock_skew_tolerance_ms(&self) -> i64 {
        i64::try_from(self.clock_skew_tolerance_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

fn default_database_path() -> String {
    directories::ProjectDirs::from("dev", "pairsync", "pairsync")
        .map(|dirs| dirs.data_dir().join("records.db").display().to_string())
        .unwrap_or_else(|| "~/.pairsync/records.db".into())
}

// ── Root ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub sync: SyncConfig,
}
