//! Relay node: validates inbound envelopes, registers peers and fans out
//! their messages.
//!
//! Every inbound message goes through the same pipeline:
//! allow-listed origin, signature, replay guard, then either registration
//! (`hello`) or dispatch to every other registered peer. Nothing is ever
//! sent back for a rejected message.

use super::registry::{ClientRegistry, RegistryError};
use super::rejection::Rejection;
use super::replay::ReplayGuard;
use crate::config::{ConfigError, RelayConfig};
use crate::message::{now_ms, verify, Envelope, HandshakePayload, ACK_TYPE};
use crate::transport::{BroadcastChannel, DestinationHandle, Inbound};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Statistics about relay node operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Currently registered clients
    pub clients_registered: usize,
    /// Envelopes that passed validation
    pub envelopes_accepted: u64,
    /// Envelopes dropped for any reason
    pub envelopes_rejected: u64,
    /// Successful fan-out posts
    pub deliveries: u64,
    /// Registrations removed because their destination failed
    pub dead_destinations: u64,
}

/// What the relay did with an accepted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A `hello` was accepted
    Registered {
        client_id: String,
        /// An earlier registration from the same origin was refreshed
        replaced: bool,
        /// False when the requester's destination died before the ack
        ack_sent: bool,
    },
    /// A business message was fanned out
    Dispatched {
        delivered: usize,
        /// Ids dropped because posting to them failed
        evicted: Vec<String>,
    },
}

struct RelayState {
    registry: ClientRegistry,
    replay: ReplayGuard,
}

/// A relay instance. Owns its registry and nonce table; several nodes can
/// live side by side without sharing anything but the broadcast scope.
pub struct RelayNode {
    config: RelayConfig,
    state: Mutex<RelayState>,
    broadcast: Arc<dyn BroadcastChannel>,
    stats: RwLock<RelayStats>,
}

impl RelayNode {
    /// Build a relay node. Fails if `config` does not validate.
    pub fn new(
        config: RelayConfig,
        broadcast: Arc<dyn BroadcastChannel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = RelayState {
            registry: ClientRegistry::with_capacity_limit(config.max_clients),
            replay: ReplayGuard::with_skew(config.replay_window_ms, config.clock_skew_ms()),
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            broadcast,
            stats: RwLock::new(RelayStats::default()),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Process one directed message using the wall clock.
    pub fn handle_inbound(&self, inbound: Inbound) -> Result<RelayOutcome, Rejection> {
        self.handle_inbound_at(inbound, now_ms())
    }

    /// Process one directed message as of `now`.
    ///
    /// The returned rejection is for local diagnostics only.
    pub fn handle_inbound_at(&self, inbound: Inbound, now: u64) -> Result<RelayOutcome, Rejection> {
        let origin = inbound.origin.clone();
        let message_type = inbound.envelope.message_type.clone();
        let result = self.process(inbound, now);
        if let Err(reason) = &result {
            debug!("Dropped {} from {}: {}", message_type, origin, reason);
        }
        self.record_verdict(result.is_ok());
        result
    }

    fn record_verdict(&self, accepted: bool) {
        let mut stats = self.stats.write();
        if accepted {
            stats.envelopes_accepted += 1;
        } else {
            stats.envelopes_rejected += 1;
        }
    }

    fn process(&self, inbound: Inbound, now: u64) -> Result<RelayOutcome, Rejection> {
        if !self.config.is_trusted_origin(&inbound.origin) {
            return Err(Rejection::UntrustedOrigin);
        }
        let reply_to = inbound.reply_to.ok_or(Rejection::MissingReplyTarget)?;
        let envelope = inbound.envelope;

        // Signature before replay so a forged message cannot burn a nonce
        if !verify(&envelope, &self.config.secret) {
            return Err(Rejection::BadSignature);
        }

        let mut state = self.state.lock();
        state.replay.check(&envelope.nonce, envelope.timestamp, now)?;

        if envelope.is_hello() {
            self.register(&mut state, &inbound.origin, reply_to, &envelope, now)
        } else if envelope.is_ack() {
            Err(Rejection::ReservedType)
        } else {
            self.dispatch(state, &inbound.origin, envelope, now)
        }
    }

    fn register(
        &self,
        state: &mut RelayState,
        origin: &str,
        reply_to: DestinationHandle,
        envelope: &Envelope,
        now: u64,
    ) -> Result<RelayOutcome, Rejection> {
        let client_id = envelope
            .handshake_client_id()
            .ok_or(Rejection::MalformedHandshake)?
            .to_string();

        let replaced = state.registry.contains(&client_id);
        state
            .registry
            .register(&client_id, origin, Arc::clone(&reply_to), now)
            .map_err(|e| match e {
                RegistryError::OriginMismatch { .. } => Rejection::IdentityConfusion,
                RegistryError::CapacityExceeded => Rejection::RegistryFull,
            })?;

        let ack_sent = match Envelope::signed_at(
            ACK_TYPE,
            HandshakePayload::new(&client_id).to_value(),
            &self.config.relay_id,
            &self.config.secret,
            now,
        ) {
            Ok(ack) => match reply_to.post(ack) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Ack to {} failed, dropping registration: {}", client_id, e);
                    state.registry.remove(&client_id);
                    self.stats.write().dead_destinations += 1;
                    false
                }
            },
            Err(e) => {
                warn!("Failed to sign ack for {}: {}", client_id, e);
                false
            }
        };

        self.stats.write().clients_registered = state.registry.len();
        if ack_sent {
            info!("Registered client {} from {}", client_id, origin);
        }

        Ok(RelayOutcome::Registered {
            client_id,
            replaced,
            ack_sent,
        })
    }

    fn dispatch(
        &self,
        mut state: parking_lot::MutexGuard<'_, RelayState>,
        origin: &str,
        envelope: Envelope,
        now: u64,
    ) -> Result<RelayOutcome, Rejection> {
        let record = state
            .registry
            .get(&envelope.source_id)
            .ok_or(Rejection::UnregisteredSender)?;
        if record.origin != origin {
            return Err(Rejection::IdentityConfusion);
        }
        state.registry.touch(&envelope.source_id, now);

        let (delivered, evicted) = fan_out(&mut state.registry, &envelope);
        let registered = state.registry.len();
        drop(state);

        if let Err(e) = self.broadcast.publish(&envelope) {
            warn!("Broadcast publish failed: {}", e);
        }

        self.record_fan_out(delivered, evicted.len(), registered);
        Ok(RelayOutcome::Dispatched { delivered, evicted })
    }

    /// Handle an envelope published by a sibling relay on the shared
    /// broadcast channel, using the wall clock.
    pub fn handle_sibling_broadcast(&self, envelope: Envelope) -> Result<usize, Rejection> {
        self.handle_sibling_broadcast_at(envelope, now_ms())
    }

    /// Re-validate a sibling relay's envelope and deliver it to this relay's
    /// peers, excluding its `sourceId`. Never republished.
    pub fn handle_sibling_broadcast_at(&self, envelope: Envelope, now: u64) -> Result<usize, Rejection> {
        let result = self.process_sibling(envelope, now);
        if let Err(reason) = &result {
            debug!("Dropped sibling broadcast: {}", reason);
        }
        self.record_verdict(result.is_ok());
        result
    }

    fn process_sibling(&self, envelope: Envelope, now: u64) -> Result<usize, Rejection> {
        if !verify(&envelope, &self.config.secret) {
            return Err(Rejection::BadSignature);
        }

        let mut state = self.state.lock();
        state.replay.check(&envelope.nonce, envelope.timestamp, now)?;
        if envelope.is_handshake() {
            return Err(Rejection::ReservedType);
        }

        let (delivered, evicted) = fan_out(&mut state.registry, &envelope);
        let registered = state.registry.len();
        drop(state);

        self.record_fan_out(delivered, evicted.len(), registered);
        Ok(delivered)
    }

    fn record_fan_out(&self, delivered: usize, evicted: usize, registered: usize) {
        let mut stats = self.stats.write();
        stats.deliveries += delivered as u64;
        stats.dead_destinations += evicted as u64;
        stats.clients_registered = registered;
    }

    /// Periodic sweep: idle clients and expired nonces. Returns the ids of
    /// the clients removed.
    pub fn prune(&self, now: u64) -> Vec<String> {
        let mut state = self.state.lock();
        let removed = state.registry.prune(now, self.config.client_idle_ttl_ms);
        let nonces = state.replay.sweep(now);
        let registered = state.registry.len();
        drop(state);

        if !removed.is_empty() || nonces > 0 {
            debug!("Pruned {} idle clients and {} nonces", removed.len(), nonces);
        }
        self.stats.write().clients_registered = registered;
        removed
    }

    /// Drop all registrations and replay state and leave the broadcast
    /// channel.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        state.registry.clear();
        state.replay.clear();
        drop(state);

        self.broadcast.close();
        self.stats.write().clients_registered = 0;
        info!("Relay {} torn down", self.config.relay_id);
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.state.lock().registry.contains(client_id)
    }

    pub fn registered_clients(&self) -> Vec<String> {
        self.state.lock().registry.ids()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.read().clone()
    }

    /// Start the dispatch loop over `inbound`, the sibling broadcast
    /// subscription and the prune timer.
    pub fn spawn(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut siblings = self.broadcast.subscribe();
        let node = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.prune_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;

            info!("Relay {} running", node.config.relay_id);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    message = inbound.recv() => match message {
                        Some(message) => {
                            let _ = node.handle_inbound(message);
                        }
                        None => {
                            info!("Relay endpoint closed");
                            break;
                        }
                    },
                    Some(envelope) = siblings.recv() => {
                        let _ = node.handle_sibling_broadcast(envelope);
                    }
                    _ = ticker.tick() => {
                        node.prune(now_ms());
                    }
                }
            }
            node.teardown();
        });

        RelayHandle {
            node: self,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Post `envelope` to every registered peer except its sender, removing
/// peers whose destination has died.
fn fan_out(registry: &mut ClientRegistry, envelope: &Envelope) -> (usize, Vec<String>) {
    let mut delivered = 0;
    let mut dead = Vec::new();
    registry.for_each_except(&envelope.source_id, |record| {
        match record.destination.post(envelope.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("Destination for {} is gone ({}), removing", record.id, e);
                dead.push(record.id.clone());
            }
        }
    });
    for id in &dead {
        registry.remove(id);
    }
    (delivered, dead)
}

/// Handle to a running relay loop.
pub struct RelayHandle {
    node: Arc<RelayNode>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn node(&self) -> &Arc<RelayNode> {
        &self.node
    }

    /// Stop the loop and tear the relay down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Relay task ended abnormally: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
