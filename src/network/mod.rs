//! Peer-to-peer networking
//!
//! The peer registry, the wire messages and the transports that carry them,
//! the server answering other nodes, and the synchronizer that pulls heavier
//! chains and relays what this node accepts.

pub mod message;
pub mod peers;
pub mod server;
pub mod sync;
pub mod transport;

pub use message::{Request, Response};
pub use peers::{validate_peer_address, PeerRecord, PeerRegistry, PeerStatus};
pub use server::Server;
pub use sync::{SyncOutcome, SyncPolicy, Synchronizer};
pub use transport::{LocalTransport, PeerTransport, RequestHandler, TcpTransport};
