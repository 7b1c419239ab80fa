//! Bridge Client: the SDK a peer context uses to talk through the relay.
//!
//! `init` opens the directed link and joins the same-origin broadcast
//! channel, `ensure_handshake` registers with the relay, `send` signs and
//! transmits, `on_message` delivers verified inbound envelopes.

use super::rejection::Rejection;
use super::replay::ReplayGuard;
use crate::config::{ClientConfig, ConfigError, HandshakePolicy};
use crate::message::{
    is_reserved_type, now_ms, verify, CodecError, Envelope, HandshakePayload, HELLO_TYPE,
};
use crate::store::{MemoryStorage, SnapshotEvent, SnapshotStore, StorageBackend};
use crate::transport::{
    BroadcastChannel, Connector, DestinationHandle, DirectedLink, Inbound, TransportError,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client has been destroyed")]
    Destroyed,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No ack from the relay within {0} ms")]
    HandshakeTimeout(u64),
    #[error("Type {0:?} is reserved for registration")]
    ReservedType(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Lifecycle of the client's transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Initializing,
    Ready,
    Destroyed,
}

/// Registration with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unregistered,
    HelloSent,
    Registered,
}

/// The two capabilities a client needs from its host.
pub struct ClientTransport {
    /// Opens the directed link to the relay endpoint
    pub connector: Arc<dyn Connector>,
    /// Same-origin broadcast channel
    pub broadcast: Arc<dyn BroadcastChannel>,
}

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct ClientInner {
    config: ClientConfig,
    client_id: String,
    transport: ClientTransport,
    /// Serializes `init` callers
    init_lock: tokio::sync::Mutex<()>,
    /// Serializes handshake initiators
    handshake_lock: tokio::sync::Mutex<()>,
    connection: Mutex<ConnectionState>,
    relay: RwLock<Option<DestinationHandle>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    handshake: watch::Sender<HandshakeState>,
    handlers: RwLock<HashMap<u64, Handler>>,
    next_handler_id: AtomicU64,
    replay: Mutex<ReplayGuard>,
    snapshots: Option<SnapshotStore>,
    destroyed: AtomicBool,
}

/// Client SDK handle. Clones share one client.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    /// Create a client; snapshots, if configured, are kept in memory.
    pub fn new(config: ClientConfig, transport: ClientTransport) -> Result<Self, ClientError> {
        Self::with_storage(config, transport, Arc::new(MemoryStorage::new()))
    }

    /// Create a client whose snapshots go to `storage`.
    pub fn with_storage(
        config: ClientConfig,
        transport: ClientTransport,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let snapshots = config
            .snapshot_key
            .as_ref()
            .map(|key| SnapshotStore::new(key.clone(), storage));
        let replay = ReplayGuard::with_skew(config.replay_window_ms, config.clock_skew_ms());
        let (handshake, _) = watch::channel(HandshakeState::Unregistered);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                client_id,
                transport,
                init_lock: tokio::sync::Mutex::new(()),
                handshake_lock: tokio::sync::Mutex::new(()),
                connection: Mutex::new(ConnectionState::Idle),
                relay: RwLock::new(None),
                dispatch_task: Mutex::new(None),
                handshake,
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(0),
                replay: Mutex::new(replay),
                snapshots,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.lock()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.inner.handshake.borrow()
    }

    /// Open the directed link and join the broadcast channel.
    ///
    /// Concurrent callers share one attempt. A failed attempt leaves the
    /// client idle so a later call can try again.
    pub async fn init(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(ClientError::Destroyed);
        }

        let _guard = inner.init_lock.lock().await;
        match *inner.connection.lock() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Destroyed => return Err(ClientError::Destroyed),
            ConnectionState::Idle | ConnectionState::Initializing => {}
        }
        inner.set_connection(ConnectionState::Initializing);

        let connected = tokio::select! {
            result = inner.transport.connector.connect() => result,
            _ = inner.destroyed_signal() => return Err(ClientError::Destroyed),
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                inner.set_connection(ConnectionState::Idle);
                warn!("Client {} could not reach the relay: {}", inner.client_id, e);
                return Err(e.into());
            }
        };

        // destroy() may have run while connect was pending
        if inner.is_destroyed() {
            return Err(ClientError::Destroyed);
        }

        let DirectedLink { relay, inbound } = link;
        *inner.relay.write() = Some(relay);
        let broadcasts = inner.transport.broadcast.subscribe();
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), inbound, broadcasts));
        *inner.dispatch_task.lock() = Some(task);

        inner.set_connection(ConnectionState::Ready);
        info!("Client {} connected to {}", inner.client_id, inner.config.relay_endpoint);
        Ok(())
    }

    /// Register with the relay. Concurrent callers share one `hello`.
    pub async fn ensure_handshake(&self) -> Result<(), ClientError> {
        self.init().await?;

        let inner = &self.inner;
        if self.handshake_state() == HandshakeState::Registered {
            return Ok(());
        }

        let _guard = inner.handshake_lock.lock().await;
        if inner.is_destroyed() {
            return Err(ClientError::Destroyed);
        }
        if self.handshake_state() == HandshakeState::Registered {
            return Ok(());
        }

        // Subscribe before sending so an immediate ack is not missed
        let mut states = inner.handshake.subscribe();
        inner.handshake.send_replace(HandshakeState::HelloSent);

        let hello = Envelope::signed(
            HELLO_TYPE,
            HandshakePayload::new(&inner.client_id).to_value(),
            &inner.client_id,
            &inner.config.secret,
        );
        let posted = hello
            .map_err(ClientError::from)
            .and_then(|hello| inner.post_to_relay(hello));
        if let Err(e) = posted {
            inner.reset_handshake();
            return Err(e);
        }
        debug!("Client {} sent hello", inner.client_id);

        match inner.config.handshake_policy {
            HandshakePolicy::AssumeAfterSend => {
                inner.handshake.send_replace(HandshakeState::Registered);
                Ok(())
            }
            HandshakePolicy::AwaitAck { timeout_ms } => {
                let acked = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    states.wait_for(|state| {
                        *state == HandshakeState::Registered || inner.is_destroyed()
                    }),
                )
                .await
                .map(|waited| waited.is_ok());

                if inner.is_destroyed() {
                    return Err(ClientError::Destroyed);
                }
                match acked {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ClientError::Destroyed),
                    Err(_) => {
                        inner.reset_handshake();
                        warn!("Client {} got no ack within {} ms", inner.client_id, timeout_ms);
                        Err(ClientError::HandshakeTimeout(timeout_ms))
                    }
                }
            }
        }
    }

    /// Forget the registration so the next `ensure_handshake` or `send`
    /// posts a fresh `hello`. No-op once destroyed.
    pub fn reset_handshake(&self) {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return;
        }
        inner.handshake.send_replace(HandshakeState::Unregistered);
        debug!("Client {} will register again", inner.client_id);
    }

    /// Sign and send a business message to the relay, and to same-origin
    /// peers over the broadcast channel. Returns the envelope sent.
    pub async fn send(&self, message_type: &str, payload: Value) -> Result<Envelope, ClientError> {
        if is_reserved_type(message_type) {
            return Err(ClientError::ReservedType(message_type.to_string()));
        }
        self.ensure_handshake().await?;

        let inner = &self.inner;
        let envelope = Envelope::signed(
            message_type,
            payload,
            &inner.client_id,
            &inner.config.secret,
        )?;
        inner.post_to_relay(envelope.clone())?;

        if let Err(e) = inner.transport.broadcast.publish(&envelope) {
            debug!("Broadcast publish skipped: {}", e);
        }
        Ok(envelope)
    }

    /// Register a handler for verified inbound messages.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(id, Arc::new(handler));
        Subscription {
            id,
            client: Arc::downgrade(&self.inner),
        }
    }

    /// Release the transports and forget all local state. Safe to call more
    /// than once; the client cannot be reused afterwards.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        inner.set_connection(ConnectionState::Destroyed);
        inner.relay.write().take();
        if let Some(task) = inner.dispatch_task.lock().take() {
            task.abort();
        }
        inner.transport.broadcast.close();
        inner.handlers.write().clear();
        inner.replay.lock().clear();
        // Wakes any handshake waiter
        inner.handshake.send_replace(HandshakeState::Unregistered);
        info!("Client {} destroyed", inner.client_id);
    }

    /// Notifications for persisted snapshots, if persistence is configured.
    pub fn snapshot_events(&self) -> Option<broadcast::Receiver<SnapshotEvent>> {
        self.inner.snapshots.as_ref().map(SnapshotStore::subscribe)
    }

    /// The last accepted envelope, if persistence is configured and one
    /// has been stored.
    pub fn last_snapshot(&self) -> Option<Envelope> {
        let store = self.inner.snapshots.as_ref()?;
        match store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to load snapshot {}: {}", store.key(), e);
                None
            }
        }
    }
}

/// Returned by [`BridgeClient::on_message`].
pub struct Subscription {
    id: u64,
    client: Weak<ClientInner>,
}

impl Subscription {
    /// Stop delivering to this handler.
    pub fn unsubscribe(self) {
        if let Some(client) = self.client.upgrade() {
            client.handlers.write().remove(&self.id);
        }
    }
}

impl ClientInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Resolves once `destroy` has run.
    async fn destroyed_signal(&self) {
        let mut states = self.handshake.subscribe();
        let _ = states.wait_for(|_| self.is_destroyed()).await;
    }

    fn set_connection(&self, state: ConnectionState) {
        let mut connection = self.connection.lock();
        if *connection != ConnectionState::Destroyed {
            *connection = state;
        }
    }

    fn reset_handshake(&self) {
        self.handshake.send_if_modified(|state| {
            if *state == HandshakeState::HelloSent {
                *state = HandshakeState::Unregistered;
                true
            } else {
                false
            }
        });
    }

    fn post_to_relay(&self, envelope: Envelope) -> Result<(), ClientError> {
        let relay = self.relay.read().clone();
        match relay {
            Some(relay) => Ok(relay.post(envelope)?),
            None if self.is_destroyed() => Err(ClientError::Destroyed),
            None => Err(TransportError::Closed.into()),
        }
    }

    /// Validate one inbound envelope and hand it to subscribers. `origin`
    /// is `Some` for the directed link and `None` for the broadcast
    /// channel. Returns the number of handlers invoked.
    fn receive(&self, envelope: Envelope, origin: Option<&str>, now: u64) -> Result<usize, Rejection> {
        if self.is_destroyed() {
            return Ok(0);
        }
        if let Some(origin) = origin {
            if !self.config.is_trusted_origin(origin) {
                return Err(Rejection::UntrustedOrigin);
            }
        }
        if !verify(&envelope, &self.config.secret) {
            return Err(Rejection::BadSignature);
        }
        self.replay
            .lock()
            .check(&envelope.nonce, envelope.timestamp, now)?;

        if envelope.is_handshake() {
            return self.consume_handshake(&envelope, origin.is_some()).map(|_| 0);
        }

        if let Some(store) = &self.snapshots {
            if let Err(e) = store.persist(&envelope) {
                warn!("Failed to persist snapshot {}: {}", store.key(), e);
            }
        }

        let handlers: Vec<Handler> = self.handlers.read().values().cloned().collect();
        for handler in &handlers {
            handler(&envelope);
        }
        Ok(handlers.len())
    }

    fn consume_handshake(&self, envelope: &Envelope, directed: bool) -> Result<(), Rejection> {
        // Acks are unicast by the relay; anything else is noise
        if !envelope.is_ack() || !directed {
            return Err(Rejection::ReservedType);
        }
        if envelope.handshake_client_id() != Some(self.client_id.as_str()) {
            return Err(Rejection::MalformedHandshake);
        }
        let changed = self.handshake.send_if_modified(|state| {
            if *state == HandshakeState::Registered {
                false
            } else {
                *state = HandshakeState::Registered;
                true
            }
        });
        if changed {
            info!("Client {} registered with {}", self.client_id, envelope.source_id);
        }
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Drains both inbound paths until they close or the client goes away.
async fn dispatch_loop(
    client: Weak<ClientInner>,
    mut directed: mpsc::UnboundedReceiver<Inbound>,
    mut broadcasts: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        let (envelope, origin) = tokio::select! {
            Some(message) = directed.recv() => (message.envelope, Some(message.origin)),
            Some(envelope) = broadcasts.recv() => (envelope, None),
            else => break,
        };

        let client = match client.upgrade() {
            Some(client) => client,
            None => break,
        };
        let message_type = envelope.message_type.clone();
        if let Err(reason) = client.receive(envelope, origin.as_deref(), now_ms()) {
            debug!("Client {} dropped {}: {}", client.client_id, message_type, reason);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
