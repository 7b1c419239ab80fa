// Last-accepted-envelope snapshot with change notifications

use super::backend::StorageBackend;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Name of the notification emitted on every persisted snapshot
pub const SNAPSHOT_EVENT: &str = "bridge:snapshot";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Emitted after a snapshot is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub key: String,
    pub value: Envelope,
}

/// Stores the most recently accepted envelope under a fixed key.
pub struct SnapshotStore {
    key: String,
    backend: Arc<dyn StorageBackend>,
    events: broadcast::Sender<SnapshotEvent>,
}

impl SnapshotStore {
    pub fn new(key: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key: key.into(),
            backend,
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the snapshot and notify subscribers.
    pub fn persist(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .put(self.key.as_bytes(), &bytes)
            .map_err(StoreError::Backend)?;

        // No subscribers is fine
        let _ = self.events.send(SnapshotEvent {
            key: self.key.clone(),
            value: envelope.clone(),
        });
        Ok(())
    }

    pub fn load(&self) -> Result<Option<Envelope>, StoreError> {
        match self.backend.get(self.key.as_bytes()).map_err(StoreError::Backend)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.backend
            .remove(self.key.as_bytes())
            .map_err(StoreError::Backend)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }
}
