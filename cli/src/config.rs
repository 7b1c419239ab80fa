// Configuration management for the signal-bridge CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/signal-bridge/config.json
// - Linux: ~/.config/signal-bridge/config.json
// - Windows: %APPDATA%\signal-bridge\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use signal_bridge_core::{ClientConfig, HandshakePolicy, RelayConfig, SharedSecret};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings for relay nodes started by this tool
    pub relay: RelayConfig,

    /// Settings for clients started by this tool
    pub client: ClientConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("signal-bridge");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from `path` if given, else from the default location, creating
    /// a default config there if none exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let config_file = Self::config_file()?;
                if config_file.exists() {
                    Self::load_from(&config_file)
                } else {
                    let config = Config::default();
                    config.save_to(&config_file)?;
                    Ok(config)
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. `secret` applies to relay and client alike.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "secret" => {
                self.relay.secret = SharedSecret::from_text(value);
                self.client.secret = SharedSecret::from_text(value);
            }
            "relay.relay_id" => self.relay.relay_id = value.to_string(),
            "relay.allowed_origins" => self.relay.allowed_origins = split_list(value),
            "relay.replay_window_ms" => {
                self.relay.replay_window_ms = value.parse().context("Invalid number")?;
            }
            "relay.client_idle_ttl_ms" => {
                self.relay.client_idle_ttl_ms = value.parse().context("Invalid number")?;
            }
            "relay.prune_interval_ms" => {
                self.relay.prune_interval_ms = value.parse().context("Invalid number")?;
            }
            "relay.max_clients" => {
                self.relay.max_clients = value.parse().context("Invalid number")?;
            }
            "relay.channel_name" => self.relay.channel_name = value.to_string(),
            "client.client_id" => {
                self.client.client_id = non_empty(value);
            }
            "client.relay_endpoint" => self.client.relay_endpoint = value.to_string(),
            "client.allowed_origins" => self.client.allowed_origins = split_list(value),
            "client.replay_window_ms" => {
                self.client.replay_window_ms = value.parse().context("Invalid number")?;
            }
            "client.channel_name" => self.client.channel_name = value.to_string(),
            "client.snapshot_key" => self.client.snapshot_key = non_empty(value),
            "client.ack_timeout_ms" => {
                self.client.handshake_policy = HandshakePolicy::AwaitAck {
                    timeout_ms: value.parse().context("Invalid number")?,
                };
            }
            "client.assume_after_send" => {
                let assume: bool = value.parse().context("Invalid boolean value")?;
                self.client.handshake_policy = if assume {
                    HandshakePolicy::AssumeAfterSend
                } else {
                    HandshakePolicy::default()
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value. The secret is never returned.
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let secret = if self.client.secret.is_empty() {
            "(unset)".to_string()
        } else {
            format!("({} bytes)", self.client.secret.as_bytes().len())
        };
        let policy = match self.client.handshake_policy {
            HandshakePolicy::AwaitAck { timeout_ms } => format!("await ack ({} ms)", timeout_ms),
            HandshakePolicy::AssumeAfterSend => "assume after send".to_string(),
        };

        vec![
            ("secret".to_string(), secret),
            ("relay.relay_id".to_string(), self.relay.relay_id.clone()),
            ("relay.allowed_origins".to_string(), self.relay.allowed_origins.join(",")),
            ("relay.replay_window_ms".to_string(), self.relay.replay_window_ms.to_string()),
            ("relay.client_idle_ttl_ms".to_string(), self.relay.client_idle_ttl_ms.to_string()),
            ("relay.prune_interval_ms".to_string(), self.relay.prune_interval_ms.to_string()),
            ("relay.max_clients".to_string(), self.relay.max_clients.to_string()),
            ("relay.channel_name".to_string(), self.relay.channel_name.clone()),
            (
                "client.client_id".to_string(),
                self.client.client_id.clone().unwrap_or_else(|| "(generated)".to_string()),
            ),
            ("client.relay_endpoint".to_string(), self.client.relay_endpoint.clone()),
            ("client.allowed_origins".to_string(), self.client.allowed_origins.join(",")),
            ("client.replay_window_ms".to_string(), self.client.replay_window_ms.to_string()),
            ("client.channel_name".to_string(), self.client.channel_name.clone()),
            (
                "client.snapshot_key".to_string(),
                self.client.snapshot_key.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("client.handshake_policy".to_string(), policy),
        ]
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
