// Bincode helpers shared by hashing, storage and the wire format.
// Everything goes through the standard config so a block hashes the same
// on every node.
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Decodes exactly one value from `bytes`. Trailing bytes are an error:
/// peers and the stores only ever hand over whole values.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let (data, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "{} trailing bytes after value",
            bytes.len() - read
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutPoint, Transaction};
    use crate::wallet::Wallet;

    #[test]
    fn test_transaction_survives_storage_encoding() {
        let wallet = Wallet::new().unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.get_address(), 50, 3).unwrap();

        let bytes = serialize(&coinbase).unwrap();
        let decoded: Transaction = deserialize(&bytes).unwrap();
        assert_eq!(decoded, coinbase);
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let outpoint = OutPoint::new(&[7; 32], 1);
        let mut bytes = serialize(&outpoint).unwrap();
        bytes.push(0);

        let result: Result<OutPoint> = deserialize(&bytes);
        assert!(matches!(result, Err(BlockchainError::Serialization(_))));
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let outpoint = OutPoint::new(&[7; 32], 1);
        let bytes = serialize(&outpoint).unwrap();

        let result: Result<OutPoint> = deserialize(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
