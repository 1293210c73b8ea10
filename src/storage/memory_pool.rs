use crate::core::{Block, EventSender, NodeEvent, OutPoint, Transaction};
use crate::error::{BlockchainError, Result, TxRejection};
use crate::storage::UtxoView;
use crate::utils::current_timestamp;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    /// Capacity in serialized bytes
    pub max_bytes: usize,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        MempoolPolicy {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A pooled transaction with the figures used to order it
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    tx: Transaction,
    fee_rate: u64,
    size: usize,
    inserted_at: i64,
    sequence: u32,
    arrival: u64,
}

impl MempoolEntry {
    pub fn get_transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn get_fee_rate(&self) -> u64 {
        self.fee_rate
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn get_inserted_at(&self) -> i64 {
        self.inserted_at
    }

    pub fn get_sequence(&self) -> u32 {
        self.sequence
    }
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, MempoolEntry>, // txid hex -> entry
    spends: HashMap<OutPoint, String>,      // claimed outpoint -> txid hex
    total_bytes: usize,
    next_arrival: u64,
}

impl PoolInner {
    fn insert(&mut self, tx: Transaction, fee_rate: u64, size: usize) -> Result<MempoolEntry> {
        let id = tx.get_id_hex();
        for input in tx.get_vin() {
            self.spends.insert(input.get_prev_out().clone(), id.clone());
        }
        let entry = MempoolEntry {
            sequence: tx.get_sequence(),
            tx,
            fee_rate,
            size,
            inserted_at: current_timestamp()?,
            arrival: self.next_arrival,
        };
        self.next_arrival += 1;
        self.total_bytes += size;
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }

    fn remove(&mut self, txid: &str) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in entry.tx.get_vin() {
            self.spends.remove(input.get_prev_out());
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Pooled transactions claiming any input of `tx`
    fn conflicts(&self, tx: &Transaction) -> Vec<String> {
        let mut ids: Vec<String> = tx
            .get_vin()
            .iter()
            .filter_map(|input| self.spends.get(input.get_prev_out()).cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Entries that must go to make room for a newcomer of `size` bytes
    /// paying `fee_rate`, once `replacing` is gone. `None` when the newcomer
    /// would be the first to be evicted, so the pool must stay as it is.
    fn plan_eviction(
        &self,
        fee_rate: u64,
        size: usize,
        replacing: &[String],
        max_bytes: usize,
    ) -> Option<Vec<String>> {
        if size > max_bytes {
            return None;
        }
        let freed: usize = replacing
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.size)
            .sum();
        let mut total = self.total_bytes.saturating_sub(freed) + size;

        let mut candidates: Vec<(&String, &MempoolEntry)> = self
            .entries
            .iter()
            .filter(|(id, _)| !replacing.contains(*id))
            .collect();
        candidates.sort_by_key(|(_, entry)| (entry.fee_rate, entry.arrival));

        // the newcomer is the latest arrival, so it loses ties
        let newcomer = (fee_rate, self.next_arrival);
        let mut victims = vec![];
        for (id, entry) in candidates {
            if total <= max_bytes {
                break;
            }
            if newcomer < (entry.fee_rate, entry.arrival) {
                return None;
            }
            total = total.saturating_sub(entry.size);
            victims.push(id.clone());
        }
        Some(victims)
    }

    fn evict_to(&mut self, max_bytes: usize) -> Vec<String> {
        let mut evicted = vec![];
        while self.total_bytes > max_bytes {
            let lowest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.fee_rate, entry.arrival))
                .map(|(id, _)| id.clone());
            match lowest {
                Some(id) => {
                    self.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }
}

/// Unconfirmed transactions waiting for a block.
///
/// Every pooled transaction spends only confirmed outputs and no two pooled
/// transactions claim the same outpoint.
pub struct MemoryPool {
    inner: RwLock<PoolInner>,
    policy: MempoolPolicy,
    events: Option<EventSender>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(MempoolPolicy::default())
    }
}

impl MemoryPool {
    pub fn new(policy: MempoolPolicy) -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(PoolInner::default()),
            policy,
            events: None,
        }
    }

    pub fn with_events(policy: MempoolPolicy, events: EventSender) -> MemoryPool {
        MemoryPool {
            events: Some(events),
            ..Self::new(policy)
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, PoolInner>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Database("Memory pool lock poisoned".to_string()))
    }

    fn announce(&self, tx: &Transaction) {
        if let Some(events) = &self.events {
            events.emit(NodeEvent::TransactionAdmitted(tx.clone()));
        }
    }

    /// Admits `tx` after checking it against `view` and the pool
    pub fn submit(&self, tx: Transaction, view: &dyn UtxoView) -> Result<MempoolEntry> {
        let entry = {
            let mut pool = self.write()?;
            if tx.is_coinbase() {
                return Err(TxRejection::CoinbaseNotAllowed.into());
            }
            if pool.entries.contains_key(&tx.get_id_hex()) {
                return Err(TxRejection::Duplicate.into());
            }
            for input in tx.get_vin() {
                if pool.spends.contains_key(input.get_prev_out()) {
                    return Err(TxRejection::DoubleSpend(input.get_prev_out().to_string()).into());
                }
            }
            tx.check_against(view)?;

            let size = tx.size()?;
            let fee_rate = tx.fee_rate()?;
            let victims = pool
                .plan_eviction(fee_rate, size, &[], self.policy.max_bytes)
                .ok_or(TxRejection::PoolFull)?;
            for id in &victims {
                pool.remove(id);
            }
            if !victims.is_empty() {
                info!("Evicted {} low fee-rate transactions", victims.len());
            }
            pool.insert(tx, fee_rate, size)?
        };

        debug!(
            "Admitted transaction {} (fee-rate {})",
            entry.tx.get_id_hex(),
            entry.fee_rate
        );
        self.announce(&entry.tx);
        Ok(entry)
    }

    /// Fee-bump: `tx` takes the place of every pooled transaction sharing an
    /// input with it, provided it beats each on fee-rate and sequence
    pub fn replace_transaction(&self, tx: Transaction, view: &dyn UtxoView) -> Result<MempoolEntry> {
        let entry = {
            let mut pool = self.write()?;
            let conflicts = pool.conflicts(&tx);
            if conflicts.is_empty() {
                return Err(BlockchainError::ReplacementRejected(
                    "no pooled transaction spends these inputs".to_string(),
                ));
            }
            tx.check_against(view)?;
            let size = tx.size()?;
            let fee_rate = tx.fee_rate()?;

            for id in &conflicts {
                if let Some(original) = pool.entries.get(id) {
                    if fee_rate <= original.fee_rate {
                        return Err(BlockchainError::ReplacementRejected(format!(
                            "fee-rate {fee_rate} does not exceed {} of {id}",
                            original.fee_rate
                        )));
                    }
                    if tx.get_sequence() <= original.sequence {
                        return Err(BlockchainError::ReplacementRejected(format!(
                            "sequence {} does not exceed {} of {id}",
                            tx.get_sequence(),
                            original.sequence
                        )));
                    }
                }
            }

            let victims = pool
                .plan_eviction(fee_rate, size, &conflicts, self.policy.max_bytes)
                .ok_or_else(|| {
                    BlockchainError::ReplacementRejected(format!(
                        "no room for {size} bytes at fee-rate {fee_rate}"
                    ))
                })?;
            for id in conflicts.iter().chain(&victims) {
                pool.remove(id);
            }
            let entry = pool.insert(tx, fee_rate, size)?;
            info!(
                "Replaced {} with {} (fee-rate {fee_rate})",
                conflicts.join(", "),
                entry.tx.get_id_hex()
            );
            entry
        };

        self.announce(&entry.tx);
        Ok(entry)
    }

    /// Drops the lowest fee-rate entries, oldest first on ties, until the
    /// pool fits its capacity. Returns the evicted ids.
    pub fn evict_low_fee(&self) -> Result<Vec<String>> {
        let evicted = self.write()?.evict_to(self.policy.max_bytes);
        if !evicted.is_empty() {
            info!("Evicted {} low fee-rate transactions", evicted.len());
        }
        Ok(evicted)
    }

    /// Highest fee-rate first, skipping what does not fit in `max_bytes`
    pub fn select_for_block(&self, max_bytes: usize) -> Vec<Transaction> {
        let mut budget = max_bytes;
        let mut selected = vec![];
        for entry in self.entries() {
            if entry.size <= budget {
                budget -= entry.size;
                selected.push(entry.tx);
            }
        }
        selected
    }

    /// Drops the block's transactions and anything conflicting with them
    pub fn remove_for_block(&self, block: &Block) -> Result<usize> {
        let mut pool = self.write()?;
        let mut removed = 0;
        for tx in block.get_transactions() {
            if pool.remove(&tx.get_id_hex()).is_some() {
                removed += 1;
            }
            for id in pool.conflicts(tx) {
                pool.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drops entries that no longer validate against `view`
    pub fn revalidate(&self, view: &dyn UtxoView) -> Result<Vec<String>> {
        let mut pool = self.write()?;
        let invalid: Vec<String> = pool
            .entries
            .iter()
            .filter(|(_, entry)| entry.tx.check_against(view).is_err())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &invalid {
            debug!("Dropping transaction {id}, no longer valid");
            pool.remove(id);
        }
        Ok(invalid)
    }

    /// Offers transactions from abandoned blocks back to the pool.
    /// Returns how many were admitted.
    pub fn readmit(&self, txs: &[Transaction], view: &dyn UtxoView) -> usize {
        let mut admitted = 0;
        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            match self.submit(tx.clone(), view) {
                Ok(_) => admitted += 1,
                Err(e) => debug!("Not re-admitting {}: {e}", tx.get_id_hex()),
            }
        }
        admitted
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.spends.contains_key(outpoint),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    pub fn get(&self, txid: &str) -> Option<MempoolEntry> {
        match self.inner.read() {
            Ok(pool) => pool.entries.get(txid).cloned(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.get(txid).is_some()
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.entries.len(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.total_bytes,
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    /// Snapshot in descending fee-rate order, earlier arrivals first on ties
    pub fn entries(&self) -> Vec<MempoolEntry> {
        let mut entries: Vec<MempoolEntry> = match self.inner.read() {
            Ok(pool) => pool.entries.values().cloned().collect(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                return vec![];
            }
        };
        entries.sort_by_key(|entry| (Reverse(entry.fee_rate), entry.arrival));
        entries
    }
}
