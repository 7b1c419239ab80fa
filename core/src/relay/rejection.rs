//! Reasons an inbound envelope is dropped.
//!
//! Rejections never travel back to the sender. They exist for local
//! diagnostics (debug logs, stats, tests) only.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Transport-level sender is not allow-listed
    UntrustedOrigin,
    /// Transport gave no handle to reply to the sender
    MissingReplyTarget,
    /// Timestamp older than the replay window
    Stale,
    /// Timestamp further ahead than the allowed clock skew
    FromFuture,
    /// Nonce already seen inside the window
    ReplayedNonce,
    /// Empty nonce or otherwise unusable envelope fields
    MalformedEnvelope,
    /// HMAC did not verify
    BadSignature,
    /// `hello` without a usable `clientId`
    MalformedHandshake,
    /// A reserved type arrived where it is not allowed
    ReservedType,
    /// Registered id seen from a different origin than it registered with
    IdentityConfusion,
    /// Non-handshake message from an unknown `sourceId`
    UnregisteredSender,
    /// Registry is at capacity
    RegistryFull,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UntrustedOrigin => "untrusted origin",
            Rejection::MissingReplyTarget => "missing reply target",
            Rejection::Stale => "stale timestamp",
            Rejection::FromFuture => "timestamp from the future",
            Rejection::ReplayedNonce => "replayed nonce",
            Rejection::MalformedEnvelope => "malformed envelope",
            Rejection::BadSignature => "bad signature",
            Rejection::MalformedHandshake => "malformed handshake",
            Rejection::ReservedType => "reserved type",
            Rejection::IdentityConfusion => "identity confusion",
            Rejection::UnregisteredSender => "unregistered sender",
            Rejection::RegistryFull => "registry full",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
