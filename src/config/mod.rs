//! Configuration loading.
//!
//! Values come from (lowest to highest precedence): built-in defaults, a
//! TOML file, then environment variables. The relay honours `PORT` so it
//! drops into container platforms unchanged.

pub mod schema;

pub use schema::{Config, RelayConfig, SyncConfig};

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";

impl Config {
    /// Load configuration from `path`, or from the default location if it
    /// exists, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Takes the lookup as a closure so tests do not have to mutate the
    /// process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
            self.relay.port = port;
        }
        if let Some(host) = lookup("PAIRSYNC_HOST").filter(|v| !v.trim().is_empty()) {
            self.relay.host = host.trim().to_string();
        }
        if let Some(url) = lookup("PAIRSYNC_RELAY_URL").filter(|v| !v.trim().is_empty()) {
            self.sync.relay_url = url.trim().to_string();
        }
        if let Some(db) = lookup("PAIRSYNC_DB").filter(|v| !v.trim().is_empty()) {
            self.sync.database_path = db.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.chunk_size == 0 {
            bail!("sync.chunk_size must be at least 1");
        }
        if self.relay.sweep_interval_secs == 0 {
            bail!("relay.sweep_interval_secs must be at least 1");
        }
        if self.relay.channel_capacity == 0 {
            bail!("relay.channel_capacity must be at least 1");
        }
        if self.relay.join_timeout_secs == 0 || self.relay.idle_timeout_secs == 0 {
            bail!("relay join and idle timeouts must be at least 1 second");
        }
        if self.sync.ping_interval_secs == 0 {
            bail!("sync.ping_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// The record database path with `~` and env vars expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.sync.database_path).into_owned())
    }
}

/// `<config dir>/pairsync/config.toml` for the current platform.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "pairsync", "pairsync")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_relay_windows() {
        let config = Config::default();
        assert_eq!(config.relay.session_ttl_secs, 900);
        assert_eq!(config.relay.sweep_interval_secs, 600);
        assert_eq!(config.sync.chunk_size, 100);
        assert_eq!(config.relay.port, 80);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [relay]
            port = 4000

            [sync]
            chunk_size = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.port, 4000);
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.sync.chunk_size, 25);
        assert_eq!(config.sync.ping_interval_secs, 20);
    }

    #[test]
    fn env_port_overrides_file() {
        let mut config = Config::from_toml("[relay]\nport = 4000\n").unwrap();
        let env: HashMap<&str, &str> = [("PORT", "8080"), ("PAIRSYNC_HOST", "0.0.0.0")].into();
        config.apply_env_overrides(|k| env.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.host, "0.0.0.0");
    }

    #[test]
    fn invalid_env_port_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|k| (k == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.relay.port, 80);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config = Config::from_toml("[sync]\nchunk_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sync]\nrelay_url = \"ws://relay.test/sync\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.relay_url, "ws://relay.test/sync");
    }

    #[test]
    fn database_path_expands_tilde() {
        let mut config = Config::default();
        config.sync.database_path = "~/records.db".into();
        assert!(!config.database_path().to_string_lossy().starts_with('~'));
    }
}
