//! Client registry: relay-side map of registered peers.

use crate::transport::DestinationHandle;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Default idle threshold before a client is pruned: 1 hour
pub const DEFAULT_CLIENT_IDLE_TTL_MS: u64 = 60 * 60 * 1000;

/// Default maximum number of registered clients
pub const DEFAULT_MAX_CLIENTS: usize = 1000;

/// A registered peer.
#[derive(Clone)]
pub struct ClientRecord {
    /// Identifier supplied in the peer's `hello`
    pub id: String,
    /// Transport-verified origin, fixed at registration
    pub origin: String,
    /// Where fan-out for this peer is posted
    pub destination: DestinationHandle,
    /// When the current registration was created (ms)
    pub registered_at: u64,
    /// Last accepted message from this peer (ms)
    pub last_seen: u64,
}

impl fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("registered_at", &self.registered_at)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client {id} is registered from {registered}, not {claimed}")]
    OriginMismatch {
        id: String,
        registered: String,
        claimed: String,
    },
    #[error("Client limit exceeded")]
    CapacityExceeded,
}

/// Registered peers keyed by client id. One id maps to one origin for as
/// long as the registration lives.
pub struct ClientRegistry {
    clients: HashMap<String, ClientRecord>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_capacity_limit(DEFAULT_MAX_CLIENTS)
    }

    pub fn with_capacity_limit(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Register `id`, or refresh an existing registration from the same
    /// origin with a new destination (reconnect/reload).
    ///
    /// A different origin for an id that is already registered is refused;
    /// the existing record is left untouched.
    pub fn register(
        &mut self,
        id: &str,
        origin: &str,
        destination: DestinationHandle,
        now: u64,
    ) -> Result<&ClientRecord, RegistryError> {
        let len = self.clients.len();
        match self.clients.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                if record.origin != origin {
                    return Err(RegistryError::OriginMismatch {
                        id: id.to_string(),
                        registered: record.origin.clone(),
                        claimed: origin.to_string(),
                    });
                }
                record.destination = destination;
                record.registered_at = now;
                record.last_seen = now;
                Ok(record)
            }
            Entry::Vacant(entry) => {
                if len >= self.max_clients {
                    return Err(RegistryError::CapacityExceeded);
                }
                Ok(entry.insert(ClientRecord {
                    id: id.to_string(),
                    origin: origin.to_string(),
                    destination,
                    registered_at: now,
                    last_seen: now,
                }))
            }
        }
    }

    /// Mark activity. Returns false if `id` is not registered.
    pub fn touch(&mut self, id: &str, now: u64) -> bool {
        match self.clients.get_mut(id) {
            Some(record) => {
                record.last_seen = record.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<ClientRecord> {
        self.clients.remove(id)
    }

    /// Visit every record except `exclude_id`.
    pub fn for_each_except<F>(&self, exclude_id: &str, mut f: F)
    where
        F: FnMut(&ClientRecord),
    {
        self.clients
            .values()
            .filter(|record| record.id != exclude_id)
            .for_each(|record| f(record));
    }

    /// Drop records idle for more than `ttl_ms`. Returns the removed ids.
    pub fn prune(&mut self, now: u64, ttl_ms: u64) -> Vec<String> {
        let mut removed = Vec::new();
        self.clients.retain(|id, record| {
            let keep = now.saturating_sub(record.last_seen) <= ttl_ms;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::MockDestination;
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_000_000;

    fn dest() -> DestinationHandle {
        let mut mock = MockDestination::new();
        mock.expect_post().returning(|_| Ok(()));
        Arc::new(mock)
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = ClientRegistry::new();
        let record = registry.register("A", "https://a.example", dest(), NOW).unwrap();
        assert_eq!(record.id, "A");
        assert_eq!(record.last_seen, NOW);
        assert!(registry.contains("A"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_same_origin_replaces_destination() {
        let mut registry = ClientRegistry::new();
        let first = dest();
        let second = dest();
        registry.register("A", "https://a.example", first.clone(), NOW).unwrap();
        registry
            .register("A", "https://a.example", second.clone(), NOW + 10)
            .unwrap();

        let record = registry.get("A").unwrap();
        assert!(Arc::ptr_eq(&record.destination, &second));
        assert_eq!(record.registered_at, NOW + 10);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_other_origin_rejected() {
        let mut registry = ClientRegistry::new();
        let original = dest();
        registry.register("A", "https://a.example", original.clone(), NOW).unwrap();

        let result = registry.register("A", "https://evil.example", dest(), NOW + 1);
        assert_eq!(
            result.unwrap_err(),
            RegistryError::OriginMismatch {
                id: "A".into(),
                registered: "https://a.example".into(),
                claimed: "https://evil.example".into(),
            }
        );

        let record = registry.get("A").unwrap();
        assert_eq!(record.origin, "https://a.example");
        assert!(Arc::ptr_eq(&record.destination, &original));
        assert_eq!(record.last_seen, NOW);
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = ClientRegistry::with_capacity_limit(2);
        registry.register("A", "https://a.example", dest(), NOW).unwrap();
        registry.register("B", "https://b.example", dest(), NOW).unwrap();

        assert_eq!(
            registry.register("C", "https://c.example", dest(), NOW).unwrap_err(),
            RegistryError::CapacityExceeded
        );
        // Refreshing an existing id is still allowed at capacity
        assert!(registry.register("A", "https://a.example", dest(), NOW).is_ok());
    }

    #[test]
    fn test_touch() {
        let mut registry = ClientRegistry::new();
        registry.register("A", "https://a.example", dest(), NOW).unwrap();
        assert!(registry.touch("A", NOW + 500));
        assert_eq!(registry.get("A").unwrap().last_seen, NOW + 500);
        assert!(!registry.touch("missing", NOW));
    }

    #[test]
    fn test_for_each_except() {
        let mut registry = ClientRegistry::new();
        for id in ["A", "B", "C"] {
            registry.register(id, "https://x.example", dest(), NOW).unwrap();
        }

        let mut visited = Vec::new();
        registry.for_each_except("A", |record| visited.push(record.id.clone()));
        visited.sort();
        assert_eq!(visited, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_prune_idle_clients() {
        let mut registry = ClientRegistry::new();
        registry.register("old", "https://a.example", dest(), NOW).unwrap();
        registry.register("fresh", "https://b.example", dest(), NOW).unwrap();
        registry.touch("fresh", NOW + DEFAULT_CLIENT_IDLE_TTL_MS);

        let removed = registry.prune(NOW + DEFAULT_CLIENT_IDLE_TTL_MS, DEFAULT_CLIENT_IDLE_TTL_MS);
        assert!(removed.is_empty());

        let removed = registry.prune(NOW + DEFAULT_CLIENT_IDLE_TTL_MS + 1, DEFAULT_CLIENT_IDLE_TTL_MS);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(!registry.contains("old"));
        assert!(registry.contains("fresh"));
    }

    #[test]
    fn test_removed_id_can_register_from_new_origin() {
        let mut registry = ClientRegistry::new();
        registry.register("A", "https://a.example", dest(), NOW).unwrap();
        registry.remove("A");
        assert!(registry.register("A", "https://b.example", dest(), NOW).is_ok());
    }

    #[test]
    fn test_clear() {
        let mut registry = ClientRegistry::new();
        registry.register("A", "https://a.example", dest(), NOW).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
