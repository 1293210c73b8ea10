//! Data storage and persistence
//!
//! Block and UTXO stores (sled-backed and in-memory), the UTXO tracker
//! built on top of them, and the pool of pending transactions.

pub mod block_store;
pub mod memory_pool;
pub mod utxo_set;
pub mod utxo_store;

pub use block_store::{BlockStore, MemoryBlockStore, SledBlockStore};
pub use memory_pool::{MemoryPool, MempoolEntry, MempoolPolicy};
pub use utxo_set::{UtxoEntry, UtxoOverlay, UtxoSet, UtxoView};
pub use utxo_store::{MemoryUtxoStore, SledUtxoStore, UndoRecord, UtxoBatch, UtxoStore};
