use crate::core::{compute_merkle_root, Block, BlockHeader, Blockchain, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::MemoryPool;
use crate::utils::current_timestamp;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerPolicy {
    /// Nonce-search threads
    pub workers: usize,
    /// Serialized bytes of pooled transactions per block
    pub max_block_bytes: usize,
    /// Nonces tried between cancellation checks
    pub poll_interval: u64,
}

impl Default for MinerPolicy {
    fn default() -> Self {
        MinerPolicy {
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_block_bytes: 1_000_000,
            poll_interval: 4096,
        }
    }
}

/// Builds candidate blocks from the mempool and searches for their nonce
pub struct Miner {
    policy: MinerPolicy,
    stop: AtomicBool,
}

impl Miner {
    pub fn new(policy: MinerPolicy) -> Miner {
        Miner {
            policy,
            stop: AtomicBool::new(false),
        }
    }

    /// Asks a running `mine_block` to give up
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Mines one block on the current tip paying `miner_address` the reward
    /// plus the fees of the selected transactions.
    ///
    /// Returns `MiningCancelled` when the tip moves or `cancel` is called
    /// before a nonce is found. The block is returned, not appended.
    pub fn mine_block(
        &self,
        mempool: &MemoryPool,
        chain: &Blockchain,
        miner_address: &str,
    ) -> Result<Block> {
        self.stop.store(false, Ordering::SeqCst);
        let template = chain.mining_template()?;

        let mut transactions = mempool.select_for_block(self.policy.max_block_bytes);
        let fees = transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.get_fee()))
            .ok_or_else(|| BlockchainError::Mining("Fee total overflows".to_string()))?;
        let coinbase = Transaction::new_coinbase(
            miner_address,
            template.block_reward.saturating_add(fees),
            template.height,
        )?;
        transactions.insert(0, coinbase);

        let tx_ids: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.get_id().to_vec()).collect();
        let header = BlockHeader::new(
            template.height,
            current_timestamp()?,
            &template.prev_hash,
            template.difficulty,
            compute_merkle_root(&tx_ids),
        );
        info!(
            "Mining block at height {} with {} transactions (difficulty: {}, fees: {fees})",
            template.height,
            transactions.len(),
            template.difficulty
        );

        let watch = chain.watch();
        let stopped = || {
            self.stop.load(Ordering::SeqCst) || watch.generation() != template.generation
        };
        let solved = ProofOfWork::new(header).run(
            self.policy.workers,
            rand::random::<u64>(),
            self.policy.poll_interval,
            &stopped,
        )?;

        match solved {
            Some(header) => {
                let block = Block::assemble(header, transactions)?;
                info!("Successfully mined block: {}", block.get_hash());
                Ok(block)
            }
            None => {
                info!("Mining at height {} cancelled", template.height);
                Err(BlockchainError::MiningCancelled)
            }
        }
    }
}

/// Single-threaded build of a block with fixed fields
pub fn forge_block(
    prev_hash: &str,
    index: u64,
    difficulty: u32,
    timestamp: i64,
    transactions: Vec<Transaction>,
) -> Result<Block> {
    let tx_ids: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.get_id().to_vec()).collect();
    let header = BlockHeader::new(
        index,
        timestamp,
        prev_hash,
        difficulty,
        compute_merkle_root(&tx_ids),
    );
    let header = ProofOfWork::new(header).solve()?;
    Block::assemble(header, transactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutPoint;
    use crate::storage::UtxoEntry;
    use crate::testnet::test_utils::{memory_chain, memory_chain_with, test_policy};
    use crate::wallet::Wallet;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_mined_block_collects_fees() {
        let chain = memory_chain();
        let miner = Miner::new(test_policy().mining);
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();

        let first = miner
            .mine_block(chain.mempool(), &chain, &alice.get_address())
            .unwrap();
        chain.append(&first).unwrap();

        let spendable = chain.spendable_outputs(&alice.get_address()).unwrap();
        let payment =
            Transaction::new_transfer(&alice, &bob.get_address(), 100, 25, &spendable).unwrap();
        chain.submit_transaction(payment).unwrap();

        let second = miner
            .mine_block(chain.mempool(), &chain, &bob.get_address())
            .unwrap();
        assert_eq!(second.get_transactions().len(), 2);
        assert_eq!(
            second.get_transactions()[0].output_value().unwrap(),
            chain.policy().block_reward + 25
        );
        chain.append(&second).unwrap();
        assert_eq!(
            chain.balance_of(&bob.get_address()).unwrap(),
            chain.policy().block_reward + 125
        );
    }

    #[test]
    fn test_tip_change_cancels_search() {
        let mut policy = test_policy();
        // unreachable within the test, so only cancellation ends the search
        policy.difficulty.initial = 200;
        policy.mining.workers = 2;
        policy.mining.poll_interval = 64;
        let chain = Arc::new(memory_chain_with(&policy));
        let miner = Arc::new(Miner::new(policy.mining.clone()));
        let alice = Wallet::new().unwrap();

        let handle = {
            let chain = Arc::clone(&chain);
            let miner = Arc::clone(&miner);
            let address = alice.get_address();
            thread::spawn(move || miner.mine_block(chain.mempool(), &chain, &address))
        };

        thread::sleep(Duration::from_millis(50));
        let tip = chain.tip().unwrap();
        let coinbase =
            Transaction::new_coinbase(&alice.get_address(), chain.policy().block_reward, 1)
                .unwrap();
        let competing = forge_block(&tip.hash, 1, 1, 5, vec![coinbase]).unwrap();
        chain.append(&competing).unwrap();

        assert!(matches!(
            handle.join().unwrap(),
            Err(BlockchainError::MiningCancelled)
        ));
    }

    #[test]
    fn test_cancel_stops_search() {
        let mut policy = test_policy();
        policy.difficulty.initial = 200;
        policy.mining.poll_interval = 64;
        let chain = Arc::new(memory_chain_with(&policy));
        let miner = Arc::new(Miner::new(policy.mining.clone()));
        let address = Wallet::new().unwrap().get_address();

        let handle = {
            let chain = Arc::clone(&chain);
            let miner = Arc::clone(&miner);
            thread::spawn(move || miner.mine_block(chain.mempool(), &chain, &address))
        };
        thread::sleep(Duration::from_millis(50));
        miner.cancel();

        assert!(matches!(
            handle.join().unwrap(),
            Err(BlockchainError::MiningCancelled)
        ));
        assert_eq!(chain.height().unwrap(), 0);
    }

    #[test]
    fn test_forge_block_is_valid_child() {
        let chain = memory_chain();
        let tip = chain.tip().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let coinbase =
            Transaction::new_coinbase(&address, chain.policy().block_reward, 1).unwrap();
        let block = forge_block(&tip.hash, 1, 3, 1234, vec![coinbase]).unwrap();

        assert_eq!(block.get_timestamp(), 1234);
        assert!(ProofOfWork::validate(block.get_header()).unwrap());
        let empty: BTreeMap<OutPoint, UtxoEntry> = BTreeMap::new();
        chain.validate_block(&block, &empty).unwrap();
    }
}
