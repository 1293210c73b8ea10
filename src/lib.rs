//! # utxo-ledger - a proof-of-work UTXO ledger node
//!
//! Each node keeps its own copy of the chain, validates blocks and
//! transactions independently, mines new blocks and converges with its
//! peers on the chain carrying the most cumulative difficulty.
//!
//! ## How the code is organized
//! - `core/`: blocks, transactions, proof-of-work, difficulty retargeting,
//!   the chain manager and the miner
//! - `storage/`: block and UTXO stores, the UTXO tracker, the mempool
//! - `network/`: peer registry, wire messages, transports, the server and
//!   the synchronizer
//! - `node/`: the runtime wiring everything together behind the commands
//! - `wallet/`: Ed25519 keys and base58 addresses
//! - `config/`: environment settings and the TOML node policy
//! - `utils/`: hashing, signing and serialization helpers
//! - `cli/`: subcommands and the interactive console
//!
//! ## Things to remember
//! - The chain lock is always taken before the mempool lock
//! - The chain and mempool never talk to peers themselves; they emit
//!   events and the synchronizer relays them on its own thread
//! - Stores are injected, so every component runs on in-memory stores in
//!   tests and on sled in a real node

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, ConsoleCommand, Opt};
pub use config::{Config, NodePolicy, GLOBAL_CONFIG};
pub use core::{
    Block, BlockHeader, Blockchain, ChainSelection, ChainStatus, ChainTip, Miner, NodeEvent,
    OutPoint, ProofOfWork, TXInput, TXOutput, Transaction,
};
pub use error::{BlockRejection, BlockchainError, Result, TxRejection};
pub use network::{
    LocalTransport, PeerTransport, Request, RequestHandler, Response, Server, SyncOutcome,
    Synchronizer, TcpTransport,
};
pub use node::{ChainView, Node};
pub use storage::{MemoryPool, UtxoEntry, UtxoSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, double_sha256, ed25519_sign, ed25519_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{convert_address, hash_pub_key, validate_address, Wallet, Wallets};
