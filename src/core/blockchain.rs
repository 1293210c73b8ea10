// The chain manager - the heart of the node
// I keep one RwLock over the tip so a reader never sees a block without its
// UTXO effects. Blocks live behind a BlockStore and the unspent outputs behind
// the UtxoSet, both handed in by whoever builds the node.

use crate::core::{
    Block, BlockHeader, DifficultyAdjustment, DifficultyPolicy, EventSender, NodeEvent, OutPoint,
    ProofOfWork, Transaction, INITIAL_BLOCK_REWARD,
};
use crate::error::{BlockRejection, BlockchainError, Result, TxRejection};
use crate::storage::{
    BlockStore, MemoryPool, MempoolEntry, UtxoEntry, UtxoOverlay, UtxoSet, UtxoStore, UtxoView,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainPolicy {
    pub block_reward: u64,
    /// Replay the whole chain into the UTXO set on every open
    pub rebuild_on_open: bool,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        ChainPolicy {
            block_reward: INITIAL_BLOCK_REWARD,
            rebuild_on_open: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Syncing,
    Synced,
    Reorganizing,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStatus::Syncing => write!(f, "syncing"),
            ChainStatus::Synced => write!(f, "synced"),
            ChainStatus::Reorganizing => write!(f, "reorganizing"),
        }
    }
}

/// Summary of the main chain's head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: String,
    /// Sum of block difficulties from genesis up to and including the tip
    pub cumulative_difficulty: u64,
}

/// What `select_chain` did with a candidate branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSelection {
    Kept,
    Extended {
        blocks: usize,
    },
    Reorganized {
        fork_height: u64,
        rolled_back: usize,
        applied: usize,
    },
}

/// Bumped on every tip change. Miners compare it against the value they
/// started from and give up when it moves.
#[derive(Debug, Default)]
pub struct ChainWatch {
    generation: AtomicU64,
}

impl ChainWatch {
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a miner needs to build on the current tip
#[derive(Debug, Clone)]
pub struct MiningTemplate {
    pub height: u64,
    pub prev_hash: String,
    pub difficulty: u32,
    pub block_reward: u64,
    pub generation: u64,
}

struct ChainInner {
    status: ChainStatus,
    tip: ChainTip,
    work: Vec<u64>, // cumulative difficulty by height
}

pub struct Blockchain {
    inner: RwLock<ChainInner>,
    blocks: Arc<dyn BlockStore>,
    utxo: UtxoSet,
    mempool: Arc<MemoryPool>,
    policy: ChainPolicy,
    difficulty: DifficultyPolicy,
    watch: Arc<ChainWatch>,
    events: Option<EventSender>,
}

// Walks the height index from genesis, checking links, and returns the tip
// with the cumulative work at every height
fn load_main_chain(blocks: &dyn BlockStore) -> Result<(ChainTip, Vec<u64>)> {
    let latest = blocks
        .latest_height()?
        .ok_or_else(|| BlockchainError::Database("Block store is empty".to_string()))?;

    let mut work = Vec::with_capacity(latest as usize + 1);
    let mut total = 0u64;
    let mut prev_hash: Option<String> = None;
    for height in 0..=latest {
        let block = blocks.get_by_height(height)?.ok_or_else(|| {
            BlockchainError::Database(format!("Missing main-chain block at height {height}"))
        })?;
        if let Some(prev) = &prev_hash {
            if block.get_prev_hash() != prev {
                return Err(BlockchainError::Database(format!(
                    "Block at height {height} does not link to its parent"
                )));
            }
        }
        total = total.saturating_add(block.get_difficulty() as u64);
        work.push(total);
        prev_hash = Some(block.get_hash().to_string());
    }

    let tip = ChainTip {
        height: latest,
        hash: prev_hash.unwrap_or_default(),
        cumulative_difficulty: total,
    };
    Ok((tip, work))
}

impl Blockchain {
    /// Opens the chain held by `blocks`, writing the shared genesis block on
    /// first use
    pub fn open(
        blocks: Arc<dyn BlockStore>,
        utxo_store: Arc<dyn UtxoStore>,
        mempool: Arc<MemoryPool>,
        policy: ChainPolicy,
        difficulty: DifficultyPolicy,
    ) -> Result<Blockchain> {
        let utxo = UtxoSet::new(utxo_store);
        let genesis = Block::genesis()?;

        match blocks.get_by_height(0)? {
            Some(stored) if stored.get_hash() != genesis.get_hash() => {
                return Err(BlockchainError::Database(format!(
                    "Stored genesis {} does not match {}",
                    stored.get_hash(),
                    genesis.get_hash()
                )));
            }
            Some(_) => {}
            None => {
                info!("Creating genesis block {}", genesis.get_hash());
                utxo.apply(&genesis)?;
                blocks.put(&genesis)?;
            }
        }

        let (tip, work) = load_main_chain(blocks.as_ref())?;
        if policy.rebuild_on_open || utxo.count()? == 0 {
            utxo.rebuild_from_chain(blocks.as_ref())?;
        }
        info!(
            "Opened chain at height {} ({}), cumulative difficulty {}",
            tip.height, tip.hash, tip.cumulative_difficulty
        );

        Ok(Blockchain {
            inner: RwLock::new(ChainInner {
                status: ChainStatus::Synced,
                tip,
                work,
            }),
            blocks,
            utxo,
            mempool,
            policy,
            difficulty,
            watch: Arc::new(ChainWatch::default()),
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Blockchain {
        self.events = Some(events);
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ChainInner>> {
        self.inner
            .read()
            .map_err(|_| BlockchainError::Database("Chain lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ChainInner>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Database("Chain lock poisoned".to_string()))
    }

    fn announce(&self, block: &Block) {
        if let Some(events) = &self.events {
            events.emit(NodeEvent::BlockAccepted(block.clone()));
        }
    }

    pub fn tip(&self) -> Result<ChainTip> {
        Ok(self.read()?.tip.clone())
    }

    pub fn height(&self) -> Result<u64> {
        Ok(self.read()?.tip.height)
    }

    pub fn status(&self) -> Result<ChainStatus> {
        Ok(self.read()?.status)
    }

    pub fn set_status(&self, status: ChainStatus) -> Result<()> {
        self.write()?.status = status;
        Ok(())
    }

    pub fn watch(&self) -> Arc<ChainWatch> {
        Arc::clone(&self.watch)
    }

    pub fn mempool(&self) -> &Arc<MemoryPool> {
        &self.mempool
    }

    pub fn policy(&self) -> &ChainPolicy {
        &self.policy
    }

    pub fn difficulty_policy(&self) -> &DifficultyPolicy {
        &self.difficulty
    }

    /// Main-chain block at `height`
    pub fn block_at(&self, height: u64) -> Result<Option<Block>> {
        let inner = self.read()?;
        if height > inner.tip.height {
            return Ok(None);
        }
        self.blocks.get_by_height(height)
    }

    /// Any stored block, including ones a reorg left behind
    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        self.blocks.get_by_hash(hash)
    }

    pub fn contains_block(&self, hash: &str) -> Result<bool> {
        Ok(self.blocks.get_by_hash(hash)?.is_some())
    }

    /// Main-chain blocks `from..=to`, cut off at the tip
    pub fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>> {
        let inner = self.read()?;
        let to = to.min(inner.tip.height);
        let mut blocks = vec![];
        for height in from..=to {
            if let Some(block) = self.blocks.get_by_height(height)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Up to `count` headers ending at the tip, oldest first
    pub fn recent_headers(&self, count: usize) -> Result<Vec<BlockHeader>> {
        let inner = self.read()?;
        self.recent_headers_locked(&inner, count)
    }

    fn recent_headers_locked(&self, inner: &ChainInner, count: usize) -> Result<Vec<BlockHeader>> {
        let start = (inner.tip.height + 1).saturating_sub(count as u64);
        let mut headers = vec![];
        for height in start..=inner.tip.height {
            if let Some(block) = self.blocks.get_by_height(height)? {
                headers.push(block.get_header().clone());
            }
        }
        Ok(headers)
    }

    pub fn next_difficulty(&self) -> Result<u32> {
        let inner = self.read()?;
        self.next_difficulty_locked(&inner)
    }

    fn next_difficulty_locked(&self, inner: &ChainInner) -> Result<u32> {
        let history = self.recent_headers_locked(inner, self.difficulty.window as usize)?;
        Ok(DifficultyAdjustment::next_difficulty(&history, &self.difficulty))
    }

    pub fn mining_template(&self) -> Result<MiningTemplate> {
        let inner = self.read()?;
        Ok(MiningTemplate {
            height: inner.tip.height + 1,
            prev_hash: inner.tip.hash.clone(),
            difficulty: self.next_difficulty_locked(&inner)?,
            block_reward: self.policy.block_reward,
            generation: self.watch.generation(),
        })
    }

    /// Stateless checks of `block` as the child of `parent_height`/`parent_hash`:
    /// hash, link, proof-of-work and Merkle root
    pub fn verify_block_header(
        &self,
        block: &Block,
        parent_height: u64,
        parent_hash: &str,
    ) -> Result<()> {
        if !block.verify_hash()? {
            return Err(BlockRejection::BadHash.into());
        }
        if block.get_prev_hash() != parent_hash || block.get_height() != parent_height + 1 {
            return Err(BlockRejection::BadLink.into());
        }
        if !self.difficulty.allows(block.get_difficulty())
            || !ProofOfWork::validate(block.get_header())?
        {
            return Err(BlockRejection::BadProofOfWork.into());
        }
        if !block.verify_merkle_root() {
            return Err(BlockRejection::BadMerkleRoot.into());
        }
        Ok(())
    }

    /// Checks the transactions of `block` against `overlay` and applies
    /// them to it. The coinbase must pay exactly reward plus fees.
    fn check_block(&self, block: &Block, overlay: &mut UtxoOverlay) -> Result<()> {
        let txs = block.get_transactions();
        let coinbase = match txs.first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => return Err(BlockRejection::BadCoinbase("missing".to_string()).into()),
        };
        if txs.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(BlockRejection::BadCoinbase("more than one".to_string()).into());
        }
        coinbase.check_coinbase(block.get_height())?;

        overlay.apply_transaction(coinbase, block.get_height())?;
        let mut fees = 0u64;
        for tx in txs.iter().skip(1) {
            let fee = tx.check_against(&*overlay).map_err(|e| match e {
                BlockchainError::InvalidTransaction(reason) => {
                    BlockchainError::InvalidBlock(BlockRejection::InvalidTransaction {
                        txid: tx.get_id_hex(),
                        reason,
                    })
                }
                other => other,
            })?;
            overlay.apply_transaction(tx, block.get_height())?;
            fees = fees.checked_add(fee).ok_or_else(|| {
                BlockchainError::from(BlockRejection::InvalidTransaction {
                    txid: tx.get_id_hex(),
                    reason: TxRejection::Malformed("fee overflow".to_string()),
                })
            })?;
        }

        let expected = self.policy.block_reward.saturating_add(fees);
        let paid = coinbase.output_value()?;
        if paid != expected {
            return Err(BlockRejection::BadCoinbase(format!(
                "pays {paid}, expected {expected}"
            ))
            .into());
        }
        Ok(())
    }

    /// Full validation of `block` as the next block on the current tip,
    /// against `view`. Nothing is written.
    pub fn validate_block(&self, block: &Block, view: &dyn UtxoView) -> Result<()> {
        let tip = self.tip()?;
        self.verify_block_header(block, tip.height, &tip.hash)?;
        let mut overlay = UtxoOverlay::new(view);
        self.check_block(block, &mut overlay)
    }

    /// Validates `block` against the tip and makes it the new tip, applying
    /// its transactions and clearing them from the mempool
    pub fn append(&self, block: &Block) -> Result<()> {
        {
            let mut inner = self.write()?;
            if block.get_hash() == inner.tip.hash {
                return Ok(());
            }
            self.verify_block_header(block, inner.tip.height, &inner.tip.hash)?;
            let mut overlay = UtxoOverlay::new(&self.utxo);
            self.check_block(block, &mut overlay)?;

            self.utxo.apply(block)?;
            if let Err(e) = self.blocks.put(block) {
                self.utxo.rollback(block)?;
                return Err(e);
            }

            let total = inner
                .tip
                .cumulative_difficulty
                .saturating_add(block.get_difficulty() as u64);
            inner.work.push(total);
            inner.tip = ChainTip {
                height: block.get_height(),
                hash: block.get_hash().to_string(),
                cumulative_difficulty: total,
            };
            self.watch.bump();
            self.mempool.remove_for_block(block)?;
            info!(
                "Appended block {} at height {} (difficulty {}, {} transactions)",
                block.get_hash(),
                block.get_height(),
                block.get_difficulty(),
                block.get_transactions().len()
            );
        }
        self.announce(block);
        Ok(())
    }

    /// Adopts `branch` if it gives more cumulative difficulty than the local
    /// chain.
    ///
    /// `branch` is the contiguous run of blocks above the fork point; blocks
    /// it shares with the main chain are skipped. The branch is validated in
    /// full before anything is touched, so a bad branch leaves the chain as
    /// it was. Ties keep the local chain.
    pub fn select_chain(&self, branch: &[Block]) -> Result<ChainSelection> {
        let (selection, new_tip) = {
            let mut inner = self.write()?;

            let mut start = 0;
            while let Some(block) = branch.get(start) {
                match self.main_chain_hash(&inner, block.get_height())? {
                    Some(hash) if hash == block.get_hash() => start += 1,
                    _ => break,
                }
            }
            let branch = &branch[start..];
            let first = match branch.first() {
                Some(first) => first,
                None => return Ok(ChainSelection::Kept),
            };

            let fork_height = first
                .get_height()
                .checked_sub(1)
                .ok_or(BlockRejection::BadLink)?;
            let fork_hash = self
                .main_chain_hash(&inner, fork_height)?
                .ok_or(BlockRejection::BadLink)?;
            if fork_hash != first.get_prev_hash() {
                return Err(BlockRejection::BadLink.into());
            }

            let base_work = inner.work[fork_height as usize];
            let candidate_work = branch.iter().fold(base_work, |acc, block| {
                acc.saturating_add(block.get_difficulty() as u64)
            });
            if candidate_work <= inner.tip.cumulative_difficulty {
                info!(
                    "Keeping local chain: candidate difficulty {candidate_work} does not exceed {}",
                    inner.tip.cumulative_difficulty
                );
                return Ok(ChainSelection::Kept);
            }

            let previous_status = inner.status;
            let reorganizing = fork_height < inner.tip.height;
            if reorganizing {
                inner.status = ChainStatus::Reorganizing;
            }

            if let Err(e) = self.validate_branch(&inner, fork_height, &fork_hash, branch) {
                inner.status = previous_status;
                warn!("Rejected branch above height {fork_height}: {e}");
                return Err(e);
            }

            let rolled_back = match self.commit_branch(&mut inner, fork_height, branch) {
                Ok(rolled_back) => rolled_back,
                Err(e) => {
                    error!("Reorganization above height {fork_height} failed: {e}");
                    let recovered = self.recover_locked(&mut inner);
                    inner.status = previous_status;
                    recovered?;
                    return Err(BlockchainError::ReorgFailure(e.to_string()));
                }
            };
            inner.status = previous_status;
            self.watch.bump();

            for block in branch {
                self.mempool.remove_for_block(block)?;
            }
            self.mempool.revalidate(&self.utxo)?;
            let abandoned: Vec<Transaction> = rolled_back
                .iter()
                .rev()
                .flat_map(|block| block.get_transactions().iter().cloned())
                .collect();
            let readmitted = self.mempool.readmit(&abandoned, &self.utxo);

            let selection = if reorganizing {
                info!(
                    "Reorganized at height {fork_height}: {} blocks rolled back, {} applied, {readmitted} transactions re-admitted, new tip {}",
                    rolled_back.len(),
                    branch.len(),
                    inner.tip.hash
                );
                ChainSelection::Reorganized {
                    fork_height,
                    rolled_back: rolled_back.len(),
                    applied: branch.len(),
                }
            } else {
                info!(
                    "Extended chain by {} blocks to height {}",
                    branch.len(),
                    inner.tip.height
                );
                ChainSelection::Extended {
                    blocks: branch.len(),
                }
            };
            (selection, branch.last().cloned())
        };

        if let Some(tip) = new_tip {
            self.announce(&tip);
        }
        Ok(selection)
    }

    fn main_chain_hash(&self, inner: &ChainInner, height: u64) -> Result<Option<String>> {
        if height > inner.tip.height {
            return Ok(None);
        }
        Ok(self
            .blocks
            .get_by_height(height)?
            .map(|block| block.get_hash().to_string()))
    }

    // Reverts the local suffix and applies the branch on an overlay only
    fn validate_branch(
        &self,
        inner: &ChainInner,
        fork_height: u64,
        fork_hash: &str,
        branch: &[Block],
    ) -> Result<()> {
        let mut overlay = UtxoOverlay::new(&self.utxo);
        for height in (fork_height + 1..=inner.tip.height).rev() {
            let block = self.blocks.get_by_height(height)?.ok_or_else(|| {
                BlockchainError::ReorgFailure(format!("Missing main-chain block at {height}"))
            })?;
            let undo = self.utxo.undo_for(&block)?;
            overlay.revert_block(&block, &undo);
        }

        let mut parent_height = fork_height;
        let mut parent_hash = fork_hash.to_string();
        for block in branch {
            self.verify_block_header(block, parent_height, &parent_hash)?;
            self.check_block(block, &mut overlay)?;
            parent_height = block.get_height();
            parent_hash = block.get_hash().to_string();
        }
        Ok(())
    }

    // Rolls the suffix above `fork_height` off the UTXO set and applies the
    // branch. Returns the abandoned blocks, highest first.
    fn commit_branch(
        &self,
        inner: &mut ChainInner,
        fork_height: u64,
        branch: &[Block],
    ) -> Result<Vec<Block>> {
        let mut rolled_back = vec![];
        for height in (fork_height + 1..=inner.tip.height).rev() {
            let block = self.blocks.get_by_height(height)?.ok_or_else(|| {
                BlockchainError::ReorgFailure(format!("Missing main-chain block at {height}"))
            })?;
            self.utxo.rollback(&block)?;
            rolled_back.push(block);
        }
        self.blocks.truncate_above(fork_height)?;
        inner.work.truncate(fork_height as usize + 1);

        let mut total = inner.work[fork_height as usize];
        for block in branch {
            self.utxo.apply(block)?;
            self.blocks.put(block)?;
            total = total.saturating_add(block.get_difficulty() as u64);
            inner.work.push(total);
            inner.tip = ChainTip {
                height: block.get_height(),
                hash: block.get_hash().to_string(),
                cumulative_difficulty: total,
            };
        }
        Ok(rolled_back)
    }

    // Brings the UTXO set and tip cache back in line with the block store
    fn recover_locked(&self, inner: &mut ChainInner) -> Result<usize> {
        let count = self.utxo.rebuild_from_chain(self.blocks.as_ref())?;
        let (tip, work) = load_main_chain(self.blocks.as_ref())?;
        inner.tip = tip;
        inner.work = work;
        self.watch.bump();
        Ok(count)
    }

    /// Replays the stored main chain into a fresh UTXO set
    pub fn rebuild_utxo(&self) -> Result<usize> {
        let mut inner = self.write()?;
        let count = self.recover_locked(&mut inner)?;
        self.mempool.revalidate(&self.utxo)?;
        Ok(count)
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<MempoolEntry> {
        let _inner = self.read()?;
        self.mempool.submit(tx, &self.utxo)
    }

    pub fn replace_transaction(&self, tx: Transaction) -> Result<MempoolEntry> {
        let _inner = self.read()?;
        self.mempool.replace_transaction(tx, &self.utxo)
    }

    pub fn balance_of(&self, address: &str) -> Result<u64> {
        let _inner = self.read()?;
        self.utxo.balance_of(address)
    }

    pub fn spendable_outputs(&self, address: &str) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        let _inner = self.read()?;
        self.utxo.spendable_outputs(address)
    }

    pub fn utxo_snapshot(&self) -> Result<BTreeMap<OutPoint, UtxoEntry>> {
        let _inner = self.read()?;
        self.utxo.snapshot()
    }
}
