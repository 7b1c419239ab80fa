//! Relay and client SDK of the signal bridge
//!
//! One relay node mediates between mutually untrusted peer contexts. Peers
//! register with a signed `hello`, the relay answers with a unicast `ack`,
//! and every later message is verified, replay-checked and fanned out to
//! all other registered peers.

pub mod client;
pub mod registry;
pub mod rejection;
pub mod replay;
pub mod server;

pub use client::{
    BridgeClient, ClientError, ClientTransport, ConnectionState, HandshakeState, Subscription,
};
pub use registry::{ClientRecord, ClientRegistry, RegistryError};
pub use rejection::Rejection;
pub use replay::{ReplayGuard, DEFAULT_REPLAY_WINDOW_MS};
pub use server::{RelayHandle, RelayNode, RelayOutcome, RelayStats};
