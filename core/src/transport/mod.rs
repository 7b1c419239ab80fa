// Transport module: capability traits and the in-process implementation

pub mod abstraction;
pub mod memory;

pub use abstraction::{
    BroadcastChannel, Connector, Destination, DestinationHandle, DirectedLink, Inbound,
    TransportError,
};
pub use memory::{MemoryBroadcast, MemoryConnector, MemoryDestination, MemoryNetwork};
