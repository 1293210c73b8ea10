use crate::core::{compute_merkle_root, MerkleProof, MerkleTree, Transaction, INITIAL_BLOCK_REWARD};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, double_sha256, serialize};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

/// Previous-hash of the genesis block
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// Fixed so every node derives the same genesis block
const GENESIS_TIMESTAMP: i64 = 1_700_000_000_000;
const GENESIS_EXTRA_NONCE: &[u8] = b"utxo-ledger genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockHeader {
    index: u64,
    timestamp: i64,
    prev_hash: String,
    difficulty: u32, // leading zero bits required of the header hash
    nonce: u64,
    merkle_root: Vec<u8>,
}

impl BlockHeader {
    pub fn new(
        index: u64,
        timestamp: i64,
        prev_hash: &str,
        difficulty: u32,
        merkle_root: Vec<u8>,
    ) -> BlockHeader {
        BlockHeader {
            index,
            timestamp,
            prev_hash: prev_hash.to_string(),
            difficulty,
            nonce: 0,
            merkle_root,
        }
    }

    /// Double SHA-256 over the serialized header
    pub fn hash_bytes(&self) -> Result<Vec<u8>> {
        Ok(double_sha256(serialize(self)?.as_slice()))
    }

    pub fn hash(&self) -> Result<String> {
        Ok(HEXLOWER.encode(&self.hash_bytes()?))
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_prev_hash(&self) -> &str {
        self.prev_hash.as_str()
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_merkle_root(&self) -> &[u8] {
        &self.merkle_root
    }

    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    header: BlockHeader,
    hash: String,
    transactions: Vec<Transaction>,
}

impl Block {
    /// Pairs a solved header with its transactions and records the header hash
    pub fn assemble(header: BlockHeader, transactions: Vec<Transaction>) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::Mining(
                "Block must contain at least one transaction".to_string(),
            ));
        }
        let hash = header.hash()?;
        Ok(Block {
            header,
            hash,
            transactions,
        })
    }

    /// The shared genesis block. Its coinbase pays an all-zero key hash that
    /// no wallet can produce a key for.
    pub fn genesis() -> Result<Block> {
        let coinbase = Transaction::assemble_genesis_coinbase(
            INITIAL_BLOCK_REWARD,
            GENESIS_EXTRA_NONCE,
        )?;
        let merkle_root = compute_merkle_root(&[coinbase.get_id().to_vec()]);
        let header = BlockHeader::new(0, GENESIS_TIMESTAMP, GENESIS_PREV_HASH, 0, merkle_root);
        Self::assemble(header, vec![coinbase])
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_prev_hash(&self) -> &str {
        self.header.get_prev_hash()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn get_height(&self) -> u64 {
        self.header.index
    }

    pub fn get_difficulty(&self) -> u32 {
        self.header.difficulty
    }

    pub fn get_merkle_root(&self) -> &[u8] {
        self.header.get_merkle_root()
    }

    pub fn get_nonce(&self) -> u64 {
        self.header.nonce
    }

    pub fn tx_ids(&self) -> Vec<Vec<u8>> {
        self.transactions
            .iter()
            .map(|tx| tx.get_id().to_vec())
            .collect()
    }

    /// Recomputes the header hash and compares it with the stored one
    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.header.hash()? == self.hash)
    }

    /// Verify that the block's Merkle root matches its transactions
    pub fn verify_merkle_root(&self) -> bool {
        compute_merkle_root(&self.tx_ids()) == self.header.merkle_root
    }

    /// Generate a Merkle proof for a transaction in this block
    pub fn generate_merkle_proof(&self, transaction_index: usize) -> Result<MerkleProof> {
        MerkleTree::from_hashes(&self.tx_ids())?.generate_proof(transaction_index)
    }

    /// Verify a Merkle proof against this block's Merkle root
    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> bool {
        proof.merkle_root == self.header.merkle_root && MerkleTree::verify_proof(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn sample_block() -> Block {
        let wallet = Wallet::new().unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.get_address(), 10, 1).unwrap();
        let merkle_root = compute_merkle_root(&[coinbase.get_id().to_vec()]);
        let header = BlockHeader::new(1, 42, GENESIS_PREV_HASH, 1, merkle_root);
        Block::assemble(header, vec![coinbase]).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic_and_recomputable() {
        let block = sample_block();
        assert_eq!(block.get_header().hash().unwrap(), block.get_hash());
        assert!(block.verify_hash().unwrap());

        let restored = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(restored.get_header().hash().unwrap(), block.get_hash());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let block = sample_block();
        let mut header = block.get_header().clone();
        header.set_nonce(block.get_nonce() + 1);
        assert_ne!(header.hash().unwrap(), block.get_hash());
    }

    #[test]
    fn test_genesis_is_shared() {
        let a = Block::genesis().unwrap();
        let b = Block::genesis().unwrap();

        assert_eq!(a.get_hash(), b.get_hash());
        assert_eq!(a.get_height(), 0);
        assert_eq!(a.get_prev_hash(), GENESIS_PREV_HASH);
        assert!(a.verify_merkle_root());
    }

    #[test]
    fn test_merkle_proof_against_block() {
        let block = sample_block();
        let proof = block.generate_merkle_proof(0).unwrap();
        assert!(block.verify_merkle_proof(&proof));
        assert!(block.generate_merkle_proof(1).is_err());
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let header = BlockHeader::new(1, 0, GENESIS_PREV_HASH, 1, vec![]);
        assert!(Block::assemble(header, vec![]).is_err());
    }
}
