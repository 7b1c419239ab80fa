// Store module: storage backends and the client's snapshot persistence

pub mod backend;
pub mod snapshot;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use snapshot::{SnapshotEvent, SnapshotStore, StoreError, SNAPSHOT_EVENT};
