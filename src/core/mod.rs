//! Core ledger functionality
//!
//! Blocks, transactions, proof-of-work, difficulty retargeting, the chain
//! manager and the miner that feeds it.

pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod events;
pub mod merkle;
pub mod miner;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, BlockHeader, GENESIS_PREV_HASH};
pub use blockchain::{
    Blockchain, ChainPolicy, ChainSelection, ChainStatus, ChainTip, ChainWatch, MiningTemplate,
};
pub use difficulty::{DifficultyAdjustment, DifficultyPolicy};
pub use events::{event_channel, EventSender, NodeEvent};
pub use merkle::{compute_merkle_root, MerkleProof, MerkleTree, ProofElement};
pub use miner::{forge_block, Miner, MinerPolicy};
pub use monetary::{DEFAULT_TRANSACTION_FEE, INITIAL_BLOCK_REWARD, UNITS_PER_COIN};
pub use proof_of_work::ProofOfWork;
pub use transaction::{OutPoint, ScriptKind, Signable, TXInput, TXOutput, Transaction};
