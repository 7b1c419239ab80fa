// Envelope types: the signed unit every peer and relay exchanges

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Registration request sent by a client to the relay.
pub const HELLO_TYPE: &str = "hello";

/// Registration confirmation, unicast by the relay to the registering client.
pub const ACK_TYPE: &str = "ack";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A signed, replay-protected protocol message.
///
/// `type`, `timestamp`, `nonce` and `payload` are covered by the signature.
/// `id` is for tracing only and `sourceId` is the sender's registered client
/// identifier, checked by the relay against the registry rather than the MAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Discriminator: `hello`, `ack`, or an application event name
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque application data
    pub payload: Value,
    /// Creation time in milliseconds since the epoch
    pub timestamp: u64,
    /// Single-use random token
    pub nonce: String,
    /// Hex-encoded HMAC-SHA256 over the canonical signing input
    #[serde(default)]
    pub signature: String,
    /// Identifier of the sending client
    #[serde(default)]
    pub source_id: String,
}

impl Envelope {
    /// True for the reserved `hello` / `ack` registration types.
    pub fn is_handshake(&self) -> bool {
        is_reserved_type(&self.message_type)
    }

    pub fn is_hello(&self) -> bool {
        self.message_type == HELLO_TYPE
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == ACK_TYPE
    }

    /// The `clientId` carried by a handshake payload, if well formed.
    pub fn handshake_client_id(&self) -> Option<&str> {
        self.payload
            .get("clientId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Whether `message_type` is reserved for the registration exchange.
pub fn is_reserved_type(message_type: &str) -> bool {
    message_type == HELLO_TYPE || message_type == ACK_TYPE
}

/// Payload of both `hello` and `ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub client_id: String,
}

impl HandshakePayload {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "clientId": self.client_id })
    }
}

/// Shared HMAC secret, provisioned out of band to the relay and every client.
///
/// The bytes are wiped on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Use the UTF-8 bytes of `text` as the key.
    pub fn from_text(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }

    /// Decode a hex-encoded key.
    pub fn from_hex(encoded: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(encoded.trim()).map(Self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes redacted>)", self.0.len())
    }
}

impl From<String> for SharedSecret {
    fn from(text: String) -> Self {
        Self::from_text(&text)
    }
}

impl From<SharedSecret> for String {
    fn from(secret: SharedSecret) -> Self {
        String::from_utf8_lossy(&secret.0).into_owned()
    }
}
