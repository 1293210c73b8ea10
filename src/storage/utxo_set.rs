use crate::core::{Block, OutPoint, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::{BlockStore, UndoRecord, UtxoBatch, UtxoStore};
use crate::wallet::address_to_pub_key_hash;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One unspent output as the ledger tracks it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UtxoEntry {
    amount: u64,
    pub_key_hash: Vec<u8>,
    height: u64,
    coinbase: bool,
    spent: bool,
}

impl UtxoEntry {
    pub fn new(amount: u64, pub_key_hash: Vec<u8>, height: u64, coinbase: bool) -> UtxoEntry {
        UtxoEntry {
            amount,
            pub_key_hash,
            height,
            coinbase,
            spent: false,
        }
    }

    pub fn get_amount(&self) -> u64 {
        self.amount
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.coinbase
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }

    /// Copy flagged as consumed, the form kept in undo records
    pub fn spent(&self) -> UtxoEntry {
        UtxoEntry {
            spent: true,
            ..self.clone()
        }
    }

    pub fn unspent(&self) -> UtxoEntry {
        UtxoEntry {
            spent: false,
            ..self.clone()
        }
    }
}

/// Read access to unspent outputs. Spent or unknown outpoints read as `None`.
pub trait UtxoView {
    fn get_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>>;
}

impl UtxoView for BTreeMap<OutPoint, UtxoEntry> {
    fn get_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        Ok(self.get(outpoint).filter(|entry| !entry.spent).cloned())
    }
}

/// Copy-on-write layer over another view.
///
/// Lets a block's transactions chain off each other, and lets a whole
/// branch be checked (revert the old suffix, apply the new one) without
/// writing anything.
pub struct UtxoOverlay<'a> {
    base: &'a dyn UtxoView,
    created: BTreeMap<OutPoint, UtxoEntry>,
    hidden: BTreeSet<OutPoint>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a dyn UtxoView) -> UtxoOverlay<'a> {
        UtxoOverlay {
            base,
            created: BTreeMap::new(),
            hidden: BTreeSet::new(),
        }
    }

    /// Removes `outpoint` from the view. Returns the entry when it came from
    /// the base view, `None` when it was created inside this overlay.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        if self.created.remove(outpoint).is_some() {
            return Ok(None);
        }
        if self.hidden.contains(outpoint) {
            return Err(BlockchainError::DoubleSpend(outpoint.to_string()));
        }
        match self.base.get_entry(outpoint)? {
            Some(entry) => {
                self.hidden.insert(outpoint.clone());
                Ok(Some(entry))
            }
            None => Err(BlockchainError::DoubleSpend(outpoint.to_string())),
        }
    }

    pub fn create(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.created.insert(outpoint, entry);
    }

    fn hide(&mut self, outpoint: &OutPoint) {
        self.created.remove(outpoint);
        self.hidden.insert(outpoint.clone());
    }

    /// Spends the inputs of `tx` and adds its outputs. Returns the base
    /// entries it consumed.
    pub fn apply_transaction(&mut self, tx: &Transaction, height: u64) -> Result<UndoRecord> {
        let mut consumed = vec![];
        for input in tx.get_vin() {
            if let Some(entry) = self.spend(input.get_prev_out())? {
                consumed.push((input.get_prev_out().clone(), entry.spent()));
            }
        }
        for (index, output) in tx.get_vout().iter().enumerate() {
            self.create(
                OutPoint::new(tx.get_id(), index as u32),
                UtxoEntry::new(
                    output.get_value(),
                    output.get_pub_key_hash().to_vec(),
                    height,
                    tx.is_coinbase(),
                ),
            );
        }
        Ok(consumed)
    }

    pub fn apply_block(&mut self, block: &Block) -> Result<UndoRecord> {
        let mut consumed = vec![];
        for tx in block.get_transactions() {
            consumed.extend(self.apply_transaction(tx, block.get_height())?);
        }
        Ok(consumed)
    }

    /// Undoes `block` given the entries it consumed
    pub fn revert_block(&mut self, block: &Block, undo: &UndoRecord) {
        for tx in block.get_transactions().iter().rev() {
            for index in 0..tx.get_vout().len() {
                self.hide(&OutPoint::new(tx.get_id(), index as u32));
            }
        }
        for (outpoint, entry) in undo {
            self.hidden.remove(outpoint);
            self.create(outpoint.clone(), entry.unspent());
        }
    }

    /// Pending changes as (puts, deletes)
    fn into_changes(self) -> (Vec<(OutPoint, UtxoEntry)>, Vec<OutPoint>) {
        let deletes = self
            .hidden
            .into_iter()
            .filter(|outpoint| !self.created.contains_key(outpoint))
            .collect();
        (self.created.into_iter().collect(), deletes)
    }
}

impl UtxoView for UtxoOverlay<'_> {
    fn get_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        if let Some(entry) = self.created.get(outpoint) {
            return Ok(Some(entry.clone()));
        }
        if self.hidden.contains(outpoint) {
            return Ok(None);
        }
        self.base.get_entry(outpoint)
    }
}

/// The authoritative unspent-output set.
///
/// Only `apply`, `rollback` and `rebuild_from_chain` change it, and each
/// change is one atomic store batch.
pub struct UtxoSet {
    store: Arc<dyn UtxoStore>,
}

impl UtxoSet {
    pub fn new(store: Arc<dyn UtxoStore>) -> UtxoSet {
        UtxoSet { store }
    }

    /// Spends the inputs and records the outputs of every transaction in
    /// `block`, keeping the consumed entries as the block's undo record.
    /// Nothing is written if any input is spent or absent.
    pub fn apply(&self, block: &Block) -> Result<()> {
        let mut overlay = UtxoOverlay::new(self);
        let undo = overlay.apply_block(block)?;
        let (puts, deletes) = overlay.into_changes();

        debug!(
            "Applying block {} to UTXO set: {} created, {} spent",
            block.get_hash(),
            puts.len(),
            deletes.len()
        );
        self.store.apply_batch(&UtxoBatch {
            puts,
            deletes,
            undo_put: Some((block.get_hash().to_string(), undo)),
            undo_delete: None,
        })
    }

    /// Exact inverse of `apply` for the most recently applied block
    pub fn rollback(&self, block: &Block) -> Result<()> {
        let undo = self.store.get_undo(block.get_hash())?.ok_or_else(|| {
            BlockchainError::ReorgFailure(format!(
                "No undo record for block {}",
                block.get_hash()
            ))
        })?;

        let mut deletes = vec![];
        for tx in block.get_transactions() {
            for index in 0..tx.get_vout().len() {
                deletes.push(OutPoint::new(tx.get_id(), index as u32));
            }
        }
        let puts = undo
            .into_iter()
            .map(|(outpoint, entry)| (outpoint, entry.unspent()))
            .collect();

        debug!("Rolling back block {} from UTXO set", block.get_hash());
        self.store.apply_batch(&UtxoBatch {
            puts,
            deletes,
            undo_put: None,
            undo_delete: Some(block.get_hash().to_string()),
        })
    }

    /// Clears the set and replays every main-chain block from genesis.
    /// Returns the number of unspent outputs afterwards.
    pub fn rebuild_from_chain(&self, blocks: &dyn BlockStore) -> Result<usize> {
        self.store.clear()?;
        let latest = match blocks.latest_height()? {
            Some(height) => height,
            None => return Ok(0),
        };
        for height in 0..=latest {
            let block = blocks.get_by_height(height)?.ok_or_else(|| {
                BlockchainError::Database(format!("Missing main-chain block at height {height}"))
            })?;
            self.apply(&block)?;
        }
        let count = self.count()?;
        info!("Rebuilt UTXO set from {} blocks: {count} unspent outputs", latest + 1);
        Ok(count)
    }

    /// Undo record of an applied block
    pub fn undo_for(&self, block: &Block) -> Result<UndoRecord> {
        self.store.get_undo(block.get_hash())?.ok_or_else(|| {
            BlockchainError::ReorgFailure(format!(
                "No undo record for block {}",
                block.get_hash()
            ))
        })
    }

    pub fn balance_of(&self, address: &str) -> Result<u64> {
        self.balance_of_hash(&address_to_pub_key_hash(address)?)
    }

    pub fn balance_of_hash(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .store
            .scan_by_address(pub_key_hash)?
            .iter()
            .filter(|(_, entry)| !entry.is_spent())
            .map(|(_, entry)| entry.get_amount())
            .sum())
    }

    pub fn spendable_outputs(&self, address: &str) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        Ok(self
            .store
            .scan_by_address(&address_to_pub_key_hash(address)?)?
            .into_iter()
            .filter(|(_, entry)| !entry.is_spent())
            .collect())
    }

    pub fn snapshot(&self) -> Result<BTreeMap<OutPoint, UtxoEntry>> {
        Ok(self.store.scan_all()?.into_iter().collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.store.scan_all()?.len())
    }
}

impl UtxoView for UtxoSet {
    fn get_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        Ok(self.store.get(outpoint)?.filter(|entry| !entry.is_spent()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{compute_merkle_root, BlockHeader, TXOutput};
    use crate::storage::{MemoryBlockStore, MemoryUtxoStore};
    use crate::wallet::Wallet;

    fn block_with(parent: &Block, txs: Vec<Transaction>) -> Block {
        let height = parent.get_height() + 1;
        let root = compute_merkle_root(&txs.iter().map(|tx| tx.get_id().to_vec()).collect::<Vec<_>>());
        let header = BlockHeader::new(height, 10, parent.get_hash(), 1, root);
        Block::assemble(header, txs).unwrap()
    }

    fn coinbase_block(parent: &Block, wallet: &Wallet, reward: u64) -> Block {
        let coinbase =
            Transaction::new_coinbase(&wallet.get_address(), reward, parent.get_height() + 1)
                .unwrap();
        block_with(parent, vec![coinbase])
    }

    fn memory_set() -> UtxoSet {
        UtxoSet::new(Arc::new(MemoryUtxoStore::new()))
    }

    #[test]
    fn test_apply_credits_coinbase() {
        let set = memory_set();
        let alice = Wallet::new().unwrap();
        let genesis = Block::genesis().unwrap();
        set.apply(&genesis).unwrap();
        set.apply(&coinbase_block(&genesis, &alice, 50)).unwrap();

        assert_eq!(set.balance_of(&alice.get_address()).unwrap(), 50);
        assert_eq!(set.count().unwrap(), 2);
    }

    #[test]
    fn test_spend_then_rollback_restores_snapshot() {
        let set = memory_set();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let genesis = Block::genesis().unwrap();
        let funding = coinbase_block(&genesis, &alice, 50);
        set.apply(&genesis).unwrap();
        set.apply(&funding).unwrap();
        let before = set.snapshot().unwrap();

        let spendable = set.spendable_outputs(&alice.get_address()).unwrap();
        let payment =
            Transaction::new_transfer(&alice, &bob.get_address(), 20, 1, &spendable).unwrap();
        let coinbase = Transaction::new_coinbase(&alice.get_address(), 1, 2).unwrap();
        let spending = block_with(&funding, vec![coinbase, payment]);

        set.apply(&spending).unwrap();
        assert_eq!(set.balance_of(&bob.get_address()).unwrap(), 20);
        assert_eq!(set.balance_of(&alice.get_address()).unwrap(), 29 + 1);

        set.rollback(&spending).unwrap();
        assert_eq!(set.snapshot().unwrap(), before);
        assert!(set.undo_for(&spending).is_err());
    }

    #[test]
    fn test_apply_rejects_spent_input_without_writing() {
        let set = memory_set();
        let alice = Wallet::new().unwrap();
        let genesis = Block::genesis().unwrap();
        set.apply(&genesis).unwrap();
        let before = set.snapshot().unwrap();

        let ghost = Transaction::new_standard(
            vec![OutPoint::new(&[9u8; 32], 0)],
            vec![TXOutput::with_pub_key_hash(5, alice.get_pub_key_hash()).unwrap()],
            0,
            0,
        )
        .unwrap();
        let coinbase = Transaction::new_coinbase(&alice.get_address(), 1, 1).unwrap();
        let bad = block_with(&genesis, vec![coinbase, ghost]);

        assert!(matches!(set.apply(&bad), Err(BlockchainError::DoubleSpend(_))));
        assert_eq!(set.snapshot().unwrap(), before);
    }

    #[test]
    fn test_in_block_chaining_leaves_no_undo_for_intermediate_outputs() {
        let set = memory_set();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let genesis = Block::genesis().unwrap();
        let funding = coinbase_block(&genesis, &alice, 50);
        set.apply(&genesis).unwrap();
        set.apply(&funding).unwrap();
        let before = set.snapshot().unwrap();

        let spendable = set.spendable_outputs(&alice.get_address()).unwrap();
        let first =
            Transaction::new_transfer(&alice, &bob.get_address(), 30, 0, &spendable).unwrap();
        let bob_utxo = vec![(
            OutPoint::new(first.get_id(), 0),
            UtxoEntry::new(30, bob.get_pub_key_hash(), 2, false),
        )];
        let second =
            Transaction::new_transfer(&bob, &alice.get_address(), 10, 0, &bob_utxo).unwrap();
        let coinbase = Transaction::new_coinbase(&alice.get_address(), 1, 2).unwrap();
        let block = block_with(&funding, vec![coinbase, first, second]);

        set.apply(&block).unwrap();
        assert_eq!(set.balance_of(&bob.get_address()).unwrap(), 20);
        assert_eq!(set.undo_for(&block).unwrap().len(), 1);

        set.rollback(&block).unwrap();
        assert_eq!(set.snapshot().unwrap(), before);
    }

    #[test]
    fn test_rebuild_matches_incremental_apply() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let blocks = MemoryBlockStore::new();
        let incremental = memory_set();

        let genesis = Block::genesis().unwrap();
        let one = coinbase_block(&genesis, &alice, 50);
        for block in [&genesis, &one] {
            incremental.apply(block).unwrap();
            blocks.put(block).unwrap();
        }
        let spendable = incremental.spendable_outputs(&alice.get_address()).unwrap();
        let payment =
            Transaction::new_transfer(&alice, &bob.get_address(), 5, 2, &spendable).unwrap();
        let coinbase = Transaction::new_coinbase(&bob.get_address(), 52, 2).unwrap();
        let two = block_with(&one, vec![coinbase, payment]);
        incremental.apply(&two).unwrap();
        blocks.put(&two).unwrap();

        let rebuilt = memory_set();
        rebuilt.apply(&Block::genesis().unwrap()).unwrap();
        let count = rebuilt.rebuild_from_chain(&blocks).unwrap();

        assert_eq!(count, incremental.count().unwrap());
        assert_eq!(rebuilt.snapshot().unwrap(), incremental.snapshot().unwrap());
        assert_eq!(
            rebuilt.undo_for(&two).unwrap(),
            incremental.undo_for(&two).unwrap()
        );
    }

    #[test]
    fn test_overlay_revert_then_apply_sees_reinstated_outputs() {
        let set = memory_set();
        let alice = Wallet::new().unwrap();
        let genesis = Block::genesis().unwrap();
        let funding = coinbase_block(&genesis, &alice, 50);
        set.apply(&genesis).unwrap();
        set.apply(&funding).unwrap();

        let mut overlay = UtxoOverlay::new(&set);
        let undo = set.undo_for(&funding).unwrap();
        overlay.revert_block(&funding, &undo);

        let funded = OutPoint::new(funding.get_transactions()[0].get_id(), 0);
        assert!(overlay.get_entry(&funded).unwrap().is_none());
        assert!(set.get_entry(&funded).unwrap().is_some());
        assert!(matches!(overlay.spend(&funded), Err(BlockchainError::DoubleSpend(_))));
    }
}
