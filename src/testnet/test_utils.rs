//! Test utilities for chain and node tests

use crate::config::NodePolicy;
use crate::core::{forge_block, Block, Blockchain, Transaction};
use crate::storage::{MemoryBlockStore, MemoryPool, MemoryUtxoStore};
use crate::utils::current_timestamp;
use crate::wallet::Wallet;
use std::sync::Arc;

/// Default policy with difficulty pinned to 1
pub fn test_policy() -> NodePolicy {
    let mut policy = NodePolicy::default();
    policy.difficulty.floor = 1;
    policy.difficulty.initial = 1;
    policy.mining.workers = 1;
    policy.mining.poll_interval = 256;
    policy
}

pub fn memory_chain() -> Blockchain {
    memory_chain_with(&test_policy())
}

pub fn memory_chain_with(policy: &NodePolicy) -> Blockchain {
    let mempool = Arc::new(MemoryPool::new(policy.mempool.clone()));
    Blockchain::open(
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryUtxoStore::new()),
        mempool,
        policy.chain.clone(),
        policy.difficulty.clone(),
    )
    .unwrap()
}

/// A valid child of the current tip paying `address` the reward plus the
/// fees of `txs`. The block is not appended.
pub fn mine_next(chain: &Blockchain, address: &str, txs: Vec<Transaction>) -> Block {
    let tip = chain.tip().unwrap();
    let height = tip.height + 1;
    let fees: u64 = txs.iter().map(|tx| tx.get_fee()).sum();
    let coinbase =
        Transaction::new_coinbase(address, chain.policy().block_reward + fees, height).unwrap();

    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    forge_block(
        &tip.hash,
        height,
        chain.next_difficulty().unwrap(),
        current_timestamp().unwrap(),
        transactions,
    )
    .unwrap()
}

/// A wallet holding the reward of one freshly appended block
pub fn funded_wallet(chain: &Blockchain) -> Wallet {
    let wallet = Wallet::new().unwrap();
    let block = mine_next(chain, &wallet.get_address(), vec![]);
    chain.append(&block).unwrap();
    wallet
}
