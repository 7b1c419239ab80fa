//! Transport abstraction layer for Signal Bridge
//!
//! The relay and its clients never talk to the hosting environment directly.
//! They see two capabilities:
//! - a directed channel to one remote context, whose inbound side is tagged
//!   with the sender's verified origin ([`Destination`], [`Connector`])
//! - an undirected, origin-scoped broadcast channel ([`BroadcastChannel`])

use crate::message::Envelope;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Destination closed")]
    Closed,
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// A reply target: something a structured message can be posted to.
///
/// `post` is synchronous and non-blocking. An error means the context behind
/// the handle is gone and the handle will never work again.
#[cfg_attr(test, mockall::automock)]
pub trait Destination: Send + Sync {
    fn post(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Shared, opaque reply handle.
pub type DestinationHandle = Arc<dyn Destination>;

/// A message received on a directed channel.
pub struct Inbound {
    /// Origin of the sending context as verified by the transport
    pub origin: String,
    /// Where replies to the sender go, if the transport exposes it
    pub reply_to: Option<DestinationHandle>,
    /// The untrusted envelope
    pub envelope: Envelope,
}

impl Inbound {
    pub fn new(origin: impl Into<String>, reply_to: Option<DestinationHandle>, envelope: Envelope) -> Self {
        Self {
            origin: origin.into(),
            reply_to,
            envelope,
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("origin", &self.origin)
            .field("reply_to", &self.reply_to.is_some())
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Origin-scoped publish/subscribe primitive.
///
/// Published envelopes reach every other subscriber in the same scope but
/// are never echoed back to the publishing endpoint.
pub trait BroadcastChannel: Send + Sync {
    /// Publish to all other listeners in this scope.
    fn publish(&self, envelope: &Envelope) -> Result<(), TransportError>;
    /// Start listening. The receiver ends once the channel is closed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope>;
    /// Leave the channel; later publishes fail with [`TransportError::Closed`].
    fn close(&self);
}

/// An open directed channel from a client to the relay.
pub struct DirectedLink {
    /// Posts to the relay; the relay sees this client's origin
    pub relay: DestinationHandle,
    /// Everything the relay (or anyone else) posts back to this client
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Establishes the directed channel to the relay endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve once the relay context has loaded and can accept messages.
    async fn connect(&self) -> Result<DirectedLink, TransportError>;
}
