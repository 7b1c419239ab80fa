// Signal Bridge Core: a trust-mediating message relay
//
// Peer contexts that cannot trust one another exchange signed,
// replay-protected envelopes through a relay node. The relay checks the
// transport-verified origin, the HMAC and freshness of every message,
// registers peers on `hello` and fans their messages out to everyone else.

pub mod config;
pub mod message;
pub mod relay;
pub mod store;
pub mod transport;

pub use config::{ClientConfig, ConfigError, HandshakePolicy, RelayConfig};
pub use message::{
    decode_envelope, encode_envelope, now_ms, sign, signing_input, verify, CodecError, Envelope,
    HandshakePayload, SharedSecret, ACK_TYPE, HELLO_TYPE,
};
pub use relay::{
    BridgeClient, ClientError, ClientRegistry, ClientTransport, ConnectionState, HandshakeState,
    Rejection, RelayHandle, RelayNode, RelayOutcome, RelayStats, ReplayGuard, Subscription,
};
pub use store::{MemoryStorage, SledStorage, SnapshotEvent, SnapshotStore, StorageBackend};
pub use transport::{
    BroadcastChannel, Connector, Destination, DestinationHandle, DirectedLink, Inbound,
    MemoryNetwork, TransportError,
};
