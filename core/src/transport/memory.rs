//! In-process transport: contexts, directed delivery and origin-scoped
//! broadcast channels living inside one tokio runtime.
//!
//! Used by the integration tests and the CLI demo. Each context is
//! identified by its origin string; directed messages are stamped with the
//! sender's origin by the network, never by the sender.

use super::abstraction::{
    BroadcastChannel, Connector, Destination, DestinationHandle, DirectedLink, Inbound,
    TransportError,
};
use crate::message::Envelope;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Endpoint {
    origin: String,
    inbox: mpsc::UnboundedSender<Inbound>,
}

struct Subscriber {
    endpoint_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct NetworkInner {
    /// Named endpoints accepting directed connections (relay contexts)
    endpoints: RwLock<HashMap<String, Endpoint>>,
    /// (origin, channel name) -> listeners
    channels: Mutex<HashMap<(String, String), Vec<Subscriber>>>,
    next_endpoint_id: AtomicU64,
}

/// In-memory network of isolated contexts.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a named endpoint served by a context at `origin`.
    ///
    /// The receiver carries every directed message posted to the endpoint,
    /// stamped with the poster's origin. Rebinding a name whose previous
    /// receiver is still alive is refused.
    pub fn bind_endpoint(
        &self,
        name: &str,
        origin: &str,
    ) -> Result<mpsc::UnboundedReceiver<Inbound>, TransportError> {
        let mut endpoints = self.inner.endpoints.write();
        if let Some(existing) = endpoints.get(name) {
            if !existing.inbox.is_closed() {
                return Err(TransportError::Rejected(format!(
                    "endpoint {} already bound",
                    name
                )));
            }
        }

        let (inbox, rx) = mpsc::unbounded_channel();
        endpoints.insert(
            name.to_string(),
            Endpoint {
                origin: origin.to_string(),
                inbox,
            },
        );
        tracing::debug!("Bound endpoint {} for origin {}", name, origin);
        Ok(rx)
    }

    /// Remove a named endpoint; new connections to it fail.
    pub fn unbind_endpoint(&self, name: &str) {
        self.inner.endpoints.write().remove(name);
    }

    /// A connector that opens links from a context at `origin` to `endpoint`.
    pub fn connector(&self, origin: &str, endpoint: &str) -> MemoryConnector {
        MemoryConnector {
            network: Arc::clone(&self.inner),
            origin: origin.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Join the broadcast channel `name` scoped to `origin`.
    pub fn broadcast(&self, origin: &str, name: &str) -> MemoryBroadcast {
        MemoryBroadcast {
            network: Arc::clone(&self.inner),
            scope: (origin.to_string(), name.to_string()),
            endpoint_id: self.inner.next_endpoint_id.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    /// Live listeners on a broadcast scope.
    pub fn listener_count(&self, origin: &str, name: &str) -> usize {
        let mut channels = self.inner.channels.lock();
        match channels.get_mut(&(origin.to_string(), name.to_string())) {
            Some(subscribers) => {
                subscribers.retain(|s| !s.tx.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }
}

/// Directed handle into one context's inbox.
pub struct MemoryDestination {
    target: mpsc::UnboundedSender<Inbound>,
    sender_origin: String,
    reply_to: Option<DestinationHandle>,
}

impl MemoryDestination {
    pub fn new(
        target: mpsc::UnboundedSender<Inbound>,
        sender_origin: impl Into<String>,
        reply_to: Option<DestinationHandle>,
    ) -> Self {
        Self {
            target,
            sender_origin: sender_origin.into(),
            reply_to,
        }
    }
}

impl Destination for MemoryDestination {
    fn post(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.target
            .send(Inbound {
                origin: self.sender_origin.clone(),
                reply_to: self.reply_to.clone(),
                envelope,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Opens [`DirectedLink`]s to a named endpoint.
pub struct MemoryConnector {
    network: Arc<NetworkInner>,
    origin: String,
    endpoint: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<DirectedLink, TransportError> {
        let (relay_inbox, relay_origin) = {
            let endpoints = self.network.endpoints.read();
            let endpoint = endpoints
                .get(&self.endpoint)
                .filter(|e| !e.inbox.is_closed())
                .ok_or_else(|| TransportError::Unreachable(self.endpoint.clone()))?;
            (endpoint.inbox.clone(), endpoint.origin.clone())
        };

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let back_to_client: DestinationHandle =
            Arc::new(MemoryDestination::new(client_tx, relay_origin, None));
        let to_relay: DestinationHandle = Arc::new(MemoryDestination::new(
            relay_inbox,
            self.origin.clone(),
            Some(back_to_client),
        ));

        tracing::debug!("Context {} connected to {}", self.origin, self.endpoint);
        Ok(DirectedLink {
            relay: to_relay,
            inbound: client_rx,
        })
    }
}

/// One endpoint's membership in an origin-scoped broadcast channel.
pub struct MemoryBroadcast {
    network: Arc<NetworkInner>,
    scope: (String, String),
    endpoint_id: u64,
    closed: AtomicBool,
}

impl BroadcastChannel for MemoryBroadcast {
    fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut channels = self.network.channels.lock();
        if let Some(subscribers) = channels.get_mut(&self.scope) {
            subscribers.retain(|s| {
                if s.endpoint_id == self.endpoint_id {
                    return !s.tx.is_closed();
                }
                s.tx.send(envelope.clone()).is_ok()
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::Acquire) {
            self.network
                .channels
                .lock()
                .entry(self.scope.clone())
                .or_default()
                .push(Subscriber {
                    endpoint_id: self.endpoint_id,
                    tx,
                });
        }
        rx
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut channels = self.network.channels.lock();
        if let Some(subscribers) = channels.get_mut(&self.scope) {
            subscribers.retain(|s| s.endpoint_id != self.endpoint_id);
        }
    }
}

impl Drop for MemoryBroadcast {
    fn drop(&mut self) {
        self.close();
    }
}
