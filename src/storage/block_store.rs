// Blocks are kept by hash forever; the height index only ever names the
// main chain and gets rewritten on a reorg

use crate::core::Block;
use crate::error::{BlockchainError, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

const BLOCKS_TREE: &str = "blocks";
const HEIGHTS_TREE: &str = "heights";

pub trait BlockStore: Send + Sync {
    /// Stores `block` by hash and makes it the main-chain block at its height
    fn put(&self, block: &Block) -> Result<()>;
    fn get_by_height(&self, height: u64) -> Result<Option<Block>>;
    fn get_by_hash(&self, hash: &str) -> Result<Option<Block>>;
    fn latest_height(&self) -> Result<Option<u64>>;
    /// Forgets the main-chain entries above `height`
    fn truncate_above(&self, height: u64) -> Result<()>;
}

pub struct SledBlockStore {
    blocks: Tree,
    heights: Tree,
}

impl SledBlockStore {
    pub fn open(db: &Db) -> Result<SledBlockStore> {
        let blocks = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        let heights = db
            .open_tree(HEIGHTS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open heights tree: {e}")))?;
        Ok(SledBlockStore { blocks, heights })
    }
}

// Big-endian so the tree iterates in height order
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn height_from_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| BlockchainError::Database(format!("Bad height key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl BlockStore for SledBlockStore {
    fn put(&self, block: &Block) -> Result<()> {
        let block_data = block.serialize()?;
        let hash = block.get_hash().to_string();
        let key = height_key(block.get_height());

        (&self.blocks, &self.heights)
            .transaction(|(blocks, heights)| {
                blocks.insert(hash.as_bytes(), block_data.as_slice())?;
                heights.insert(&key[..], hash.as_bytes())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                BlockchainError::Database(format!("Failed to store block: {e:?}"))
            })?;
        Ok(())
    }

    fn get_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.heights.get(height_key(height))? {
            Some(hash) => {
                let hash = String::from_utf8(hash.to_vec()).map_err(|e| {
                    BlockchainError::Database(format!("Invalid block hash format: {e}"))
                })?;
                self.get_by_hash(&hash)
            }
            None => Ok(None),
        }
    }

    fn get_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn latest_height(&self) -> Result<Option<u64>> {
        match self.heights.last()? {
            Some((key, _)) => Ok(Some(height_from_key(&key)?)),
            None => Ok(None),
        }
    }

    fn truncate_above(&self, height: u64) -> Result<()> {
        let Some(start) = height.checked_add(1) else {
            return Ok(());
        };
        for item in self.heights.range(height_key(start)..) {
            let (key, _) = item?;
            self.heights.remove(key)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and simulations
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<MemoryBlockInner>,
}

#[derive(Default)]
struct MemoryBlockInner {
    blocks: HashMap<String, Block>,
    heights: BTreeMap<u64, String>,
}

impl MemoryBlockStore {
    pub fn new() -> MemoryBlockStore {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryBlockInner>> {
        self.inner
            .read()
            .map_err(|_| BlockchainError::Database("Block store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryBlockInner>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Database("Block store lock poisoned".to_string()))
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: &Block) -> Result<()> {
        let mut inner = self.write()?;
        let hash = block.get_hash().to_string();
        inner.heights.insert(block.get_height(), hash.clone());
        inner.blocks.insert(hash, block.clone());
        Ok(())
    }

    fn get_by_height(&self, height: u64) -> Result<Option<Block>> {
        let inner = self.read()?;
        Ok(inner
            .heights
            .get(&height)
            .and_then(|hash| inner.blocks.get(hash))
            .cloned())
    }

    fn get_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        Ok(self.read()?.blocks.get(hash).cloned())
    }

    fn latest_height(&self) -> Result<Option<u64>> {
        Ok(self.read()?.heights.keys().next_back().copied())
    }

    fn truncate_above(&self, height: u64) -> Result<()> {
        self.write()?.heights.retain(|h, _| *h <= height);
        Ok(())
    }
}
