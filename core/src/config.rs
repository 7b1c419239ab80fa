// Configuration for the relay node and client SDK
//
// Both structs deserialize with every field optional; missing fields take
// the documented defaults. `validate()` catches settings the protocol can't
// run with (no secret, nobody trusted, zero-length windows).

use crate::message::SharedSecret;
use crate::relay::registry::{DEFAULT_CLIENT_IDLE_TTL_MS, DEFAULT_MAX_CLIENTS};
use crate::relay::replay::DEFAULT_REPLAY_WINDOW_MS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default broadcast channel shared by relay instances
pub const DEFAULT_CHANNEL_NAME: &str = "signal-sync-bridge";

/// Default relay identifier, used as `sourceId` on acks
pub const DEFAULT_RELAY_ID: &str = "bridge";

/// Default prune sweep interval: 30 seconds
pub const DEFAULT_PRUNE_INTERVAL_MS: u64 = 30_000;

/// Default time a client waits for its `ack`
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Shared secret is empty")]
    MissingSecret,
    #[error("No trusted origins configured")]
    EmptyAllowList,
    #[error("Replay window must be non-zero")]
    ZeroReplayWindow,
    #[error("Prune interval must be non-zero")]
    ZeroPruneInterval,
    #[error("Relay endpoint name is empty")]
    EmptyEndpoint,
}

/// Relay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Identifier this relay signs its own envelopes with
    pub relay_id: String,
    /// Origins allowed to talk to the relay
    pub allowed_origins: Vec<String>,
    /// HMAC secret shared with every client
    pub secret: SharedSecret,
    /// Replay window in milliseconds
    pub replay_window_ms: u64,
    /// Tolerance for timestamps ahead of the relay's clock; defaults to the window
    pub clock_skew_ms: Option<u64>,
    /// Idle time after which a registered client is pruned
    pub client_idle_ttl_ms: u64,
    /// Interval of the registry / nonce sweep
    pub prune_interval_ms: u64,
    /// Maximum registered clients
    pub max_clients: usize,
    /// Broadcast channel joined by this relay
    pub channel_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_id: DEFAULT_RELAY_ID.to_string(),
            allowed_origins: Vec::new(),
            secret: SharedSecret::default(),
            replay_window_ms: DEFAULT_REPLAY_WINDOW_MS,
            clock_skew_ms: None,
            client_idle_ttl_ms: DEFAULT_CLIENT_IDLE_TTL_MS,
            prune_interval_ms: DEFAULT_PRUNE_INTERVAL_MS,
            max_clients: DEFAULT_MAX_CLIENTS,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn new(secret: SharedSecret, allowed_origins: Vec<String>) -> Self {
        Self {
            secret,
            allowed_origins,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        if self.replay_window_ms == 0 {
            return Err(ConfigError::ZeroReplayWindow);
        }
        if self.prune_interval_ms == 0 {
            return Err(ConfigError::ZeroPruneInterval);
        }
        Ok(())
    }

    pub fn is_trusted_origin(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    pub fn clock_skew_ms(&self) -> u64 {
        self.clock_skew_ms.unwrap_or(self.replay_window_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// When a client may start sending business messages after `hello`.
///
/// Either way the client stays registered until the host calls
/// `BridgeClient::reset_handshake`. The relay does not tell a client it
/// has been pruned or evicted, so hosts reset after reconnecting or after
/// a long idle period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// Wait until the relay's `ack` naming this client arrives
    AwaitAck { timeout_ms: u64 },
    /// Treat the client as registered as soon as `hello` is posted
    AssumeAfterSend,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        HandshakePolicy::AwaitAck {
            timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

/// Client SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Fixed client id; a UUID v4 is generated when absent
    pub client_id: Option<String>,
    /// Name of the relay endpoint to connect to
    pub relay_endpoint: String,
    /// Origins whose directed messages this client accepts (the relay's)
    pub allowed_origins: Vec<String>,
    /// HMAC secret shared with the relay
    pub secret: SharedSecret,
    /// Replay window in milliseconds
    pub replay_window_ms: u64,
    /// Tolerance for timestamps ahead of the local clock; defaults to the window
    pub clock_skew_ms: Option<u64>,
    /// Same-origin broadcast channel
    pub channel_name: String,
    /// Storage key for the last accepted envelope; no persistence when absent
    pub snapshot_key: Option<String>,
    pub handshake_policy: HandshakePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            relay_endpoint: DEFAULT_RELAY_ID.to_string(),
            allowed_origins: Vec::new(),
            secret: SharedSecret::default(),
            replay_window_ms: DEFAULT_REPLAY_WINDOW_MS,
            clock_skew_ms: None,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            snapshot_key: None,
            handshake_policy: HandshakePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(secret: SharedSecret, relay_origin: impl Into<String>) -> Self {
        Self {
            secret,
            allowed_origins: vec![relay_origin.into()],
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        if self.replay_window_ms == 0 {
            return Err(ConfigError::ZeroReplayWindow);
        }
        if self.relay_endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        Ok(())
    }

    pub fn is_trusted_origin(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    pub fn clock_skew_ms(&self) -> u64 {
        self.clock_skew_ms.unwrap_or(self.replay_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.replay_window_ms, 15_000);
        assert_eq!(config.client_idle_ttl_ms, 3_600_000);
        assert_eq!(config.prune_interval_ms, 30_000);
        assert_eq!(config.clock_skew_ms(), 15_000);
        assert_eq!(config.channel_name, "signal-sync-bridge");
    }

    #[test]
    fn test_relay_validation() {
        assert_eq!(
            RelayConfig::default().validate(),
            Err(ConfigError::MissingSecret)
        );

        let mut config = RelayConfig::new(SharedSecret::from_text("s"), vec![]);
        assert_eq!(config.validate(), Err(ConfigError::EmptyAllowList));

        config.allowed_origins.push("https://a.example".into());
        assert!(config.validate().is_ok());

        config.replay_window_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroReplayWindow));
    }

    #[test]
    fn test_trusted_origin_is_exact_match() {
        let config = RelayConfig::new(
            SharedSecret::from_text("s"),
            vec!["https://a.example".into()],
        );
        assert!(config.is_trusted_origin("https://a.example"));
        assert!(!config.is_trusted_origin("https://a.example.evil"));
        assert!(!config.is_trusted_origin("http://a.example"));
    }

    #[test]
    fn test_client_config_from_partial_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "client_id": "A",
                "secret": "demo-shared-secret",
                "allowed_origins": ["https://bridge.example"],
                "handshake_policy": { "mode": "assume_after_send" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.client_id.as_deref(), Some("A"));
        assert_eq!(config.secret.as_bytes(), b"demo-shared-secret");
        assert_eq!(config.handshake_policy, HandshakePolicy::AssumeAfterSend);
        assert_eq!(config.replay_window_ms, 15_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_handshake_policy_waits_for_ack() {
        assert_eq!(
            ClientConfig::default().handshake_policy,
            HandshakePolicy::AwaitAck { timeout_ms: 5_000 }
        );
    }

    #[test]
    fn test_client_validation() {
        let mut config = ClientConfig::new(SharedSecret::from_text("s"), "https://bridge.example");
        assert!(config.validate().is_ok());
        config.relay_endpoint.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyEndpoint));
    }
}
