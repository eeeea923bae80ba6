//! Chain-side networking: the DHT transport boundary and per-chain peer sets

pub mod dht;
pub mod peer_manager;

pub use dht::{Channel, DhtEvent, DhtTransport, MemoryDht, MutableItem, RequestContext};
pub use peer_manager::PeerManager;
