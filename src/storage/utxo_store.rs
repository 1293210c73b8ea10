// Persistence behind the UTXO tracker. The tracker owns the only handle, so
// nothing else writes the chainstate.

use crate::core::OutPoint;
use crate::error::{BlockchainError, Result};
use crate::storage::UtxoEntry;
use crate::utils::{deserialize, serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

const UTXO_TREE: &str = "chainstate";
const UNDO_TREE: &str = "undo";

/// Outputs a block consumed, in input order
pub type UndoRecord = Vec<(OutPoint, UtxoEntry)>;

/// Set changes for one block, written all-or-nothing
#[derive(Debug, Default, Clone)]
pub struct UtxoBatch {
    pub puts: Vec<(OutPoint, UtxoEntry)>,
    pub deletes: Vec<OutPoint>,
    pub undo_put: Option<(String, UndoRecord)>,
    pub undo_delete: Option<String>,
}

pub trait UtxoStore: Send + Sync {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>>;
    fn put(&self, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<()>;
    fn delete(&self, outpoint: &OutPoint) -> Result<()>;
    fn scan_by_address(&self, pub_key_hash: &[u8]) -> Result<Vec<(OutPoint, UtxoEntry)>>;
    fn scan_all(&self) -> Result<Vec<(OutPoint, UtxoEntry)>>;
    /// Drops every entry and every undo record
    fn clear(&self) -> Result<()>;
    fn get_undo(&self, block_hash: &str) -> Result<Option<UndoRecord>>;
    fn apply_batch(&self, batch: &UtxoBatch) -> Result<()>;
}

pub struct SledUtxoStore {
    utxos: Tree,
    undo: Tree,
}

impl SledUtxoStore {
    pub fn open(db: &Db) -> Result<SledUtxoStore> {
        let utxos = db
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))?;
        let undo = db
            .open_tree(UNDO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open undo tree: {e}")))?;
        Ok(SledUtxoStore { utxos, undo })
    }
}

fn decode_all(iter: sled::Iter) -> Result<Vec<(OutPoint, UtxoEntry)>> {
    let mut entries = vec![];
    for item in iter {
        let (k, v) = item
            .map_err(|e| BlockchainError::Database(format!("Failed to iterate UTXO tree: {e}")))?;
        entries.push((OutPoint::from_key(&k)?, deserialize::<UtxoEntry>(&v)?));
    }
    Ok(entries)
}

impl UtxoStore for SledUtxoStore {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        match self.utxos.get(outpoint.to_key())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<()> {
        self.utxos.insert(outpoint.to_key(), serialize(entry)?)?;
        Ok(())
    }

    fn delete(&self, outpoint: &OutPoint) -> Result<()> {
        self.utxos.remove(outpoint.to_key())?;
        Ok(())
    }

    // I keep the set keyed by outpoint only, so an address lookup is a full scan
    fn scan_by_address(&self, pub_key_hash: &[u8]) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        Ok(decode_all(self.utxos.iter())?
            .into_iter()
            .filter(|(_, entry)| entry.is_locked_with_key(pub_key_hash))
            .collect())
    }

    fn scan_all(&self) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        decode_all(self.utxos.iter())
    }

    fn clear(&self) -> Result<()> {
        self.utxos.clear()?;
        self.undo.clear()?;
        Ok(())
    }

    fn get_undo(&self, block_hash: &str) -> Result<Option<UndoRecord>> {
        match self.undo.get(block_hash)? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn apply_batch(&self, batch: &UtxoBatch) -> Result<()> {
        // Encode up front: the transaction closure may run more than once
        let puts = batch
            .puts
            .iter()
            .map(|(outpoint, entry)| Ok((outpoint.to_key(), serialize(entry)?)))
            .collect::<Result<Vec<_>>>()?;
        let deletes: Vec<Vec<u8>> = batch.deletes.iter().map(OutPoint::to_key).collect();
        let undo_put = match &batch.undo_put {
            Some((hash, record)) => Some((hash.clone(), serialize(record)?)),
            None => None,
        };

        (&self.utxos, &self.undo)
            .transaction(|(utxos, undo)| {
                for key in &deletes {
                    utxos.remove(key.as_slice())?;
                }
                for (key, value) in &puts {
                    utxos.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some((hash, record)) = &undo_put {
                    undo.insert(hash.as_bytes(), record.as_slice())?;
                }
                if let Some(hash) = &batch.undo_delete {
                    undo.remove(hash.as_bytes())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                BlockchainError::Database(format!("Failed to apply UTXO batch: {e:?}"))
            })?;
        Ok(())
    }
}

/// Map-backed store for tests and throwaway nodes
#[derive(Default)]
pub struct MemoryUtxoStore {
    inner: RwLock<MemoryUtxoInner>,
}

#[derive(Default)]
struct MemoryUtxoInner {
    utxos: BTreeMap<OutPoint, UtxoEntry>,
    undo: HashMap<String, UndoRecord>,
}

impl MemoryUtxoStore {
    pub fn new() -> MemoryUtxoStore {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryUtxoInner>> {
        self.inner
            .read()
            .map_err(|_| BlockchainError::Database("UTXO store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryUtxoInner>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Database("UTXO store lock poisoned".to_string()))
    }
}

impl UtxoStore for MemoryUtxoStore {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        Ok(self.read()?.utxos.get(outpoint).cloned())
    }

    fn put(&self, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<()> {
        self.write()?.utxos.insert(outpoint.clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, outpoint: &OutPoint) -> Result<()> {
        self.write()?.utxos.remove(outpoint);
        Ok(())
    }

    fn scan_by_address(&self, pub_key_hash: &[u8]) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        Ok(self
            .read()?
            .utxos
            .iter()
            .filter(|(_, entry)| entry.is_locked_with_key(pub_key_hash))
            .map(|(outpoint, entry)| (outpoint.clone(), entry.clone()))
            .collect())
    }

    fn scan_all(&self) -> Result<Vec<(OutPoint, UtxoEntry)>> {
        Ok(self
            .read()?
            .utxos
            .iter()
            .map(|(outpoint, entry)| (outpoint.clone(), entry.clone()))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.utxos.clear();
        inner.undo.clear();
        Ok(())
    }

    fn get_undo(&self, block_hash: &str) -> Result<Option<UndoRecord>> {
        Ok(self.read()?.undo.get(block_hash).cloned())
    }

    fn apply_batch(&self, batch: &UtxoBatch) -> Result<()> {
        // One write guard for the whole batch, so readers see all of it or none
        let mut inner = self.write()?;
        for outpoint in &batch.deletes {
            inner.utxos.remove(outpoint);
        }
        for (outpoint, entry) in &batch.puts {
            inner.utxos.insert(outpoint.clone(), entry.clone());
        }
        if let Some((hash, record)) = &batch.undo_put {
            inner.undo.insert(hash.clone(), record.clone());
        }
        if let Some(hash) = &batch.undo_delete {
            inner.undo.remove(hash);
        }
        Ok(())
    }
}
