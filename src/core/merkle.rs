use crate::error::{BlockchainError, Result};
use crate::utils::{double_sha256, sha256_digest};
use serde::{Deserialize, Serialize};

/// Merkle tree over transaction ids.
///
/// Levels are stored bottom-up. A level with an odd number of nodes pairs
/// its last node with itself, and a single leaf is its own root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTree {
    levels: Vec<Vec<Vec<u8>>>,
}

/// Merkle proof for transaction verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Transaction hash being proven
    pub transaction_hash: Vec<u8>,
    /// Merkle root hash
    pub merkle_root: Vec<u8>,
    /// Proof path (sibling hashes and directions)
    pub proof_path: Vec<ProofElement>,
    /// Index of the transaction in the block
    pub transaction_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofElement {
    /// Sibling hash
    pub hash: Vec<u8>,
    /// Direction: true if sibling is on the right, false if on the left
    pub is_right: bool,
}

impl MerkleTree {
    pub fn from_hashes(hashes: &[Vec<u8>]) -> Result<Self> {
        if hashes.is_empty() {
            return Err(BlockchainError::Mining(
                "Cannot build a merkle tree from no hashes".to_string(),
            ));
        }

        let mut levels = vec![hashes.to_vec()];
        while let Some(level) = levels.last() {
            if level.len() == 1 {
                break;
            }
            let next = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Self::hash_pair(left, right),
                    [last] => Self::hash_pair(last, last),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }
        Ok(MerkleTree { levels })
    }

    pub fn root(&self) -> Vec<u8> {
        self.levels
            .last()
            .and_then(|level| level.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn generate_proof(&self, transaction_index: usize) -> Result<MerkleProof> {
        let leaves = &self.levels[0];
        let transaction_hash = leaves.get(transaction_index).cloned().ok_or_else(|| {
            BlockchainError::Mining(format!(
                "Transaction index {transaction_index} out of bounds ({} leaves)",
                leaves.len()
            ))
        })?;

        let mut proof_path = Vec::new();
        let mut index = transaction_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = index % 2 == 0;
            let sibling = if is_right {
                level.get(index + 1).unwrap_or(&level[index])
            } else {
                &level[index - 1]
            };
            proof_path.push(ProofElement {
                hash: sibling.clone(),
                is_right,
            });
            index /= 2;
        }

        Ok(MerkleProof {
            transaction_hash,
            merkle_root: self.root(),
            proof_path,
            transaction_index,
        })
    }

    pub fn verify_proof(proof: &MerkleProof) -> bool {
        let mut current_hash = proof.transaction_hash.clone();

        for element in &proof.proof_path {
            current_hash = if element.is_right {
                Self::hash_pair(&current_hash, &element.hash)
            } else {
                Self::hash_pair(&element.hash, &current_hash)
            };
        }

        current_hash == proof.merkle_root
    }

    fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut combined = Vec::with_capacity(left.len() + right.len());
        combined.extend_from_slice(left);
        combined.extend_from_slice(right);
        double_sha256(&combined)
    }
}

/// Merkle root of `tx_ids` in order. No ids hash to SHA-256 of the empty string.
pub fn compute_merkle_root(tx_ids: &[Vec<u8>]) -> Vec<u8> {
    match MerkleTree::from_hashes(tx_ids) {
        Ok(tree) => tree.root(),
        Err(_) => sha256_digest(&[]),
    }
}
