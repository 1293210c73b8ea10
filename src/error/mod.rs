//! Error handling for the ledger node
//!
//! Every fallible operation in the crate returns [`Result`]. Validation
//! failures carry a typed reason so callers can tell a bad proof-of-work
//! from a double-spend without parsing strings.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Why a transaction was refused by the mempool or by block validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    /// An input references an outpoint that is spent, absent, or already claimed
    DoubleSpend(String),
    /// The signature on input `input` does not verify
    BadSignature { input: usize },
    /// Inputs do not cover outputs plus the declared fee
    InsufficientFunds { required: u64, available: u64 },
    /// Inputs exceed outputs plus fee, so the declared fee is wrong
    FeeMismatch { declared: u64, actual: u64 },
    /// The transaction is already pooled
    Duplicate,
    /// Coinbase transactions only ever appear inside blocks
    CoinbaseNotAllowed,
    /// The pool is full and this transaction pays the lowest rate
    PoolFull,
    /// Structural problem (empty inputs, zero outputs, id mismatch, overflow)
    Malformed(String),
}

impl fmt::Display for TxRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRejection::DoubleSpend(outpoint) => {
                write!(f, "double-spend of {outpoint}")
            }
            TxRejection::BadSignature { input } => write!(f, "bad signature on input {input}"),
            TxRejection::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "insufficient funds: required {required}, available {available}"
            ),
            TxRejection::FeeMismatch { declared, actual } => {
                write!(f, "fee mismatch: declared {declared}, actual {actual}")
            }
            TxRejection::Duplicate => write!(f, "already in the pool"),
            TxRejection::CoinbaseNotAllowed => write!(f, "coinbase outside of a block"),
            TxRejection::PoolFull => write!(f, "fee-rate too low for a full pool"),
            TxRejection::Malformed(msg) => write!(f, "malformed: {msg}"),
        }
    }
}

/// Why a block was refused by the chain manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    /// Stored hash does not match the hash of the header
    BadHash,
    /// Hash does not meet the target or difficulty is below the floor
    BadProofOfWork,
    /// Previous hash or index does not follow the expected parent
    BadLink,
    /// Merkle root does not match the transactions
    BadMerkleRoot,
    /// Missing, duplicated, or overpaying coinbase
    BadCoinbase(String),
    /// A contained transaction failed validation
    InvalidTransaction { txid: String, reason: TxRejection },
}

impl fmt::Display for BlockRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRejection::BadHash => write!(f, "bad hash"),
            BlockRejection::BadProofOfWork => write!(f, "bad proof-of-work"),
            BlockRejection::BadLink => write!(f, "bad link"),
            BlockRejection::BadMerkleRoot => write!(f, "bad merkle root"),
            BlockRejection::BadCoinbase(msg) => write!(f, "bad coinbase: {msg}"),
            BlockRejection::InvalidTransaction { txid, reason } => {
                write!(f, "invalid transaction {txid}: {reason}")
            }
        }
    }
}

/// Error types for ledger operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Database-related errors
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Network communication errors
    Network(String),
    /// Wallet operation errors
    Wallet(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Invalid address format
    InvalidAddress(String),
    /// Not enough spendable outputs to build a transaction
    InsufficientFunds { required: u64, available: u64 },
    /// Block validation failure
    InvalidBlock(BlockRejection),
    /// Transaction validation failure
    InvalidTransaction(TxRejection),
    /// UTXO apply hit a spent or missing outpoint
    DoubleSpend(String),
    /// Fee-bump conditions were not met, original kept
    ReplacementRejected(String),
    /// Peer could not be reached within the timeout
    PeerUnreachable(String),
    /// Rollback or reapply did not complete, state was rebuilt
    ReorgFailure(String),
    /// Mining errors
    Mining(String),
    /// Nonce search abandoned because the tip moved or a stop was requested
    MiningCancelled,
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "Wallet error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::InvalidBlock(reason) => write!(f, "Invalid block: {reason}"),
            BlockchainError::InvalidTransaction(reason) => {
                write!(f, "Invalid transaction: {reason}")
            }
            BlockchainError::DoubleSpend(outpoint) => {
                write!(f, "Double spend: {outpoint} is spent or absent")
            }
            BlockchainError::ReplacementRejected(msg) => {
                write!(f, "Replacement rejected: {msg}")
            }
            BlockchainError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {msg}"),
            BlockchainError::ReorgFailure(msg) => write!(f, "Reorganization failed: {msg}"),
            BlockchainError::Mining(msg) => write!(f, "Mining error: {msg}"),
            BlockchainError::MiningCancelled => write!(f, "Mining cancelled"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

impl From<TxRejection> for BlockchainError {
    fn from(reason: TxRejection) -> Self {
        BlockchainError::InvalidTransaction(reason)
    }
}

impl From<BlockRejection> for BlockchainError {
    fn from(reason: BlockRejection) -> Self {
        BlockchainError::InvalidBlock(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display_includes_reason() {
        let err = BlockchainError::InvalidBlock(BlockRejection::InvalidTransaction {
            txid: "ab".to_string(),
            reason: TxRejection::BadSignature { input: 2 },
        });
        assert_eq!(
            err.to_string(),
            "Invalid block: invalid transaction ab: bad signature on input 2"
        );
    }

    #[test]
    fn test_rejection_converts_into_error() {
        let err: BlockchainError = TxRejection::Duplicate.into();
        assert!(matches!(
            err,
            BlockchainError::InvalidTransaction(TxRejection::Duplicate)
        ));
    }
}
