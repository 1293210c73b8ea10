// This file implements the transaction model - how value moves on the ledger
// Standard transactions are P2PKH: inputs prove ownership of an earlier output,
// outputs lock value to a public-key hash

use crate::error::{BlockRejection, BlockchainError, Result, TxRejection};
use crate::storage::{UtxoEntry, UtxoView};
use crate::utils::{deserialize, double_sha256, ed25519_sign, ed25519_verify, serialize};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, Wallet};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Reference to one output of an earlier transaction
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct OutPoint {
    txid: Vec<u8>,
    vout: u32,
}

impl OutPoint {
    pub fn new(txid: &[u8], vout: u32) -> OutPoint {
        OutPoint {
            txid: txid.to_vec(),
            vout,
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> u32 {
        self.vout
    }

    /// Storage key: txid bytes followed by the big-endian output index,
    /// so all outputs of one transaction sort together
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = self.txid.clone();
        key.extend(self.vout.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<OutPoint> {
        if key.len() < 4 {
            return Err(BlockchainError::Database(format!(
                "Outpoint key of {} bytes is too short",
                key.len()
            )));
        }
        let (txid, vout) = key.split_at(key.len() - 4);
        let mut index = [0u8; 4];
        index.copy_from_slice(vout);
        Ok(OutPoint::new(txid, u32::from_be_bytes(index)))
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", HEXLOWER.encode(&self.txid), self.vout)
    }
}

// An input says "I spend output #vout of txid" and carries the proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    prev_out: OutPoint,
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl TXInput {
    pub fn new(prev_out: OutPoint) -> TXInput {
        TXInput {
            prev_out,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_prev_out(&self) -> &OutPoint {
        &self.prev_out
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }
}

// An output is value locked to whoever holds the key behind pub_key_hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        Self::with_pub_key_hash(value, address_to_pub_key_hash(address)?)
    }

    pub fn with_pub_key_hash(value: u64, pub_key_hash: Vec<u8>) -> Result<TXOutput> {
        if value == 0 {
            return Err(TxRejection::Malformed("output value must be positive".to_string()).into());
        }
        Ok(TXOutput {
            value,
            pub_key_hash,
        })
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

/// The two transaction shapes the ledger accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ScriptKind {
    /// Mints the block reward. `extra_nonce` keeps ids unique across blocks.
    Coinbase { height: u64, extra_nonce: Vec<u8> },
    Standard,
}

/// Sign and verify capability for anything that commits to a message
pub trait Signable {
    /// Bytes every signature commits to
    fn signing_message(&self) -> Result<Vec<u8>>;

    fn sign(&mut self, wallet: &Wallet) -> Result<()>;

    /// Checks input `index` is signed by a key hashing to `locking_hash`
    fn verify_input(&self, index: usize, locking_hash: &[u8]) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    kind: ScriptKind,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
    fee: u64,
    // Replacement counter: a fee bump must carry a higher value than the original
    sequence: u32,
}

impl Transaction {
    pub fn new_coinbase(to: &str, reward: u64, height: u64) -> Result<Transaction> {
        Self::new_coinbase_to_hash(&address_to_pub_key_hash(to)?, reward, height)
    }

    pub fn new_coinbase_to_hash(
        pub_key_hash: &[u8],
        reward: u64,
        height: u64,
    ) -> Result<Transaction> {
        let kind = ScriptKind::Coinbase {
            height,
            extra_nonce: Uuid::new_v4().as_bytes().to_vec(),
        };
        let vout = vec![TXOutput::with_pub_key_hash(reward, pub_key_hash.to_vec())?];
        Self::assemble(kind, vec![], vout, 0, 0)
    }

    /// Deterministic coinbase for the genesis block, paying an all-zero hash
    pub(crate) fn assemble_genesis_coinbase(
        reward: u64,
        extra_nonce: &[u8],
    ) -> Result<Transaction> {
        let kind = ScriptKind::Coinbase {
            height: 0,
            extra_nonce: extra_nonce.to_vec(),
        };
        let vout = vec![TXOutput::with_pub_key_hash(reward, vec![0u8; 20])?];
        Self::assemble(kind, vec![], vout, 0, 0)
    }

    /// Unsigned standard transaction spending `inputs`
    pub fn new_standard(
        inputs: Vec<OutPoint>,
        outputs: Vec<TXOutput>,
        fee: u64,
        sequence: u32,
    ) -> Result<Transaction> {
        let vin = inputs.into_iter().map(TXInput::new).collect();
        Self::assemble(ScriptKind::Standard, vin, outputs, fee, sequence)
    }

    /// Builds and signs a payment from `wallet` to `to`, picking inputs from
    /// `spendable` in order and returning change to the wallet
    pub fn new_transfer(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        fee: u64,
        spendable: &[(OutPoint, UtxoEntry)],
    ) -> Result<Transaction> {
        let owner = wallet.get_pub_key_hash();
        let required = amount.checked_add(fee).ok_or_else(|| {
            BlockchainError::from(TxRejection::Malformed("amount overflow".to_string()))
        })?;

        let mut accumulated = 0u64;
        let mut inputs = vec![];
        for (outpoint, entry) in spendable {
            if accumulated >= required {
                break;
            }
            if !entry.is_locked_with_key(&owner) {
                continue;
            }
            accumulated = accumulated.saturating_add(entry.get_amount());
            inputs.push(outpoint.clone());
        }
        if accumulated < required {
            return Err(BlockchainError::InsufficientFunds {
                required,
                available: accumulated,
            });
        }

        let mut outputs = vec![TXOutput::new(amount, to)?];
        let change = accumulated - required;
        if change > 0 {
            outputs.push(TXOutput::with_pub_key_hash(change, owner)?);
        }

        let mut tx = Self::new_standard(inputs, outputs, fee, 0)?;
        tx.sign(wallet)?;
        Ok(tx)
    }

    /// Rebuilds this payment over the same inputs with a higher fee, taking
    /// the difference out of the change output
    pub fn bump_fee(&self, wallet: &Wallet, new_fee: u64) -> Result<Transaction> {
        if self.is_coinbase() {
            return Err(TxRejection::CoinbaseNotAllowed.into());
        }
        let owner = wallet.get_pub_key_hash();
        let total_in = self
            .output_value()?
            .checked_add(self.fee)
            .ok_or_else(|| TxRejection::Malformed("value overflow".to_string()))?;

        let mut outputs: Vec<TXOutput> = self
            .vout
            .iter()
            .filter(|out| !out.is_locked_with_key(&owner))
            .cloned()
            .collect();
        let paid: u64 = outputs.iter().map(TXOutput::get_value).sum();
        let required = paid.saturating_add(new_fee);
        if total_in < required {
            return Err(BlockchainError::InsufficientFunds {
                required,
                available: total_in,
            });
        }
        let change = total_in - required;
        if change > 0 {
            outputs.push(TXOutput::with_pub_key_hash(change, owner)?);
        }

        let inputs = self.vin.iter().map(|i| i.prev_out.clone()).collect();
        let sequence = self.sequence.saturating_add(1);
        let mut tx = Self::new_standard(inputs, outputs, new_fee, sequence)?;
        tx.sign(wallet)?;
        Ok(tx)
    }

    pub(crate) fn assemble(
        kind: ScriptKind,
        vin: Vec<TXInput>,
        vout: Vec<TXOutput>,
        fee: u64,
        sequence: u32,
    ) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            kind,
            vin,
            vout,
            fee,
            sequence,
        };
        tx.id = tx.compute_id()?;
        Ok(tx)
    }

    /// Double SHA-256 of the transaction serialized with an empty id
    pub fn compute_id(&self) -> Result<Vec<u8>> {
        let mut copy = self.clone();
        copy.id = vec![];
        Ok(double_sha256(serialize(&copy)?.as_slice()))
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, ScriptKind::Coinbase { .. })
    }

    pub fn get_kind(&self) -> &ScriptKind {
        &self.kind
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_fee(&self) -> u64 {
        self.fee
    }

    pub fn get_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn output_value(&self) -> Result<u64> {
        self.vout.iter().try_fold(0u64, |acc, out| {
            acc.checked_add(out.value)
                .ok_or_else(|| TxRejection::Malformed("output value overflow".to_string()).into())
        })
    }

    /// Serialized size in bytes
    pub fn size(&self) -> Result<usize> {
        Ok(self.serialize()?.len())
    }

    /// Fee per kilobyte of serialized transaction
    pub fn fee_rate(&self) -> Result<u64> {
        let size = self.size()?.max(1) as u64;
        Ok(self.fee.saturating_mul(1000) / size)
    }

    /// Validates a standard transaction against `view` and returns its fee.
    ///
    /// Checks, in order: shape, id integrity, no input repeated, every
    /// input present in the view and signed by the key it is locked to,
    /// and `inputs == outputs + fee`.
    pub fn check_against(&self, view: &dyn UtxoView) -> Result<u64> {
        if self.is_coinbase() {
            return Err(TxRejection::CoinbaseNotAllowed.into());
        }
        if self.vin.is_empty() || self.vout.is_empty() {
            return Err(TxRejection::Malformed("no inputs or no outputs".to_string()).into());
        }
        if self.vout.iter().any(|out| out.value == 0) {
            return Err(TxRejection::Malformed("zero-value output".to_string()).into());
        }
        if self.compute_id()? != self.id {
            return Err(TxRejection::Malformed("id does not match contents".to_string()).into());
        }

        let mut seen = HashSet::new();
        let mut input_value = 0u64;
        for (index, input) in self.vin.iter().enumerate() {
            if !seen.insert(&input.prev_out) {
                return Err(TxRejection::DoubleSpend(input.prev_out.to_string()).into());
            }
            let entry = view
                .get_entry(&input.prev_out)?
                .ok_or_else(|| TxRejection::DoubleSpend(input.prev_out.to_string()))?;
            if !self.verify_input(index, entry.get_pub_key_hash())? {
                return Err(TxRejection::BadSignature { input: index }.into());
            }
            input_value = input_value
                .checked_add(entry.get_amount())
                .ok_or_else(|| TxRejection::Malformed("input value overflow".to_string()))?;
        }

        let output_value = self.output_value()?;
        let required = output_value
            .checked_add(self.fee)
            .ok_or_else(|| TxRejection::Malformed("fee overflow".to_string()))?;
        if input_value < required {
            return Err(TxRejection::InsufficientFunds {
                required,
                available: input_value,
            }
            .into());
        }
        if input_value > required {
            return Err(TxRejection::FeeMismatch {
                declared: self.fee,
                actual: input_value - output_value,
            }
            .into());
        }
        Ok(self.fee)
    }

    /// Structural checks on the coinbase of the block at `height`.
    ///
    /// A coinbase spends nothing: its inputs would be removed from the UTXO
    /// set without any signature being checked.
    pub fn check_coinbase(&self, height: u64) -> Result<()> {
        match &self.kind {
            ScriptKind::Coinbase { height: h, .. } if *h == height => {}
            _ => return Err(BlockRejection::BadCoinbase("wrong height".to_string()).into()),
        }
        if !self.vin.is_empty() {
            return Err(BlockRejection::BadCoinbase("has inputs".to_string()).into());
        }
        if self.vout.is_empty() || self.vout.iter().any(|out| out.value == 0) {
            return Err(BlockRejection::BadCoinbase(
                "no outputs or a zero-value output".to_string(),
            )
            .into());
        }
        if self.fee != 0 {
            return Err(BlockRejection::BadCoinbase("declares a fee".to_string()).into());
        }
        if self.compute_id()? != self.id {
            return Err(BlockRejection::BadCoinbase("id does not match contents".to_string()).into());
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

impl Signable for Transaction {
    // The message covers everything except the id, the signatures and the
    // public keys, so inputs can be signed in any order
    fn signing_message(&self) -> Result<Vec<u8>> {
        let mut trimmed = self.clone();
        trimmed.id = vec![];
        for input in trimmed.vin.iter_mut() {
            input.signature = vec![];
            input.pub_key = vec![];
        }
        Ok(double_sha256(serialize(&trimmed)?.as_slice()))
    }

    fn sign(&mut self, wallet: &Wallet) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        let message = self.signing_message()?;
        let signature = ed25519_sign(wallet.get_pkcs8(), &message)?;
        for input in self.vin.iter_mut() {
            input.pub_key = wallet.get_public_key().to_vec();
            input.signature = signature.clone();
        }
        self.id = self.compute_id()?;
        Ok(())
    }

    fn verify_input(&self, index: usize, locking_hash: &[u8]) -> Result<bool> {
        let input = match self.vin.get(index) {
            Some(input) => input,
            None => return Ok(false),
        };
        if hash_pub_key(&input.pub_key) != locking_hash {
            return Ok(false);
        }
        let message = self.signing_message()?;
        Ok(ed25519_verify(&input.pub_key, &input.signature, &message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn funded(wallet: &Wallet, amounts: &[u64]) -> BTreeMap<OutPoint, UtxoEntry> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                (
                    OutPoint::new(&[i as u8; 32], 0),
                    UtxoEntry::new(*amount, wallet.get_pub_key_hash(), 1, false),
                )
            })
            .collect()
    }

    #[test]
    fn test_coinbase_has_no_inputs() {
        let wallet = Wallet::new().unwrap();
        let tx = Transaction::new_coinbase(&wallet.get_address(), 500, 3).unwrap();

        assert!(tx.is_coinbase());
        assert!(tx.get_vin().is_empty());
        assert_eq!(tx.output_value().unwrap(), 500);
        assert_eq!(tx.compute_id().unwrap(), tx.get_id());
        assert!(matches!(tx.get_kind(), ScriptKind::Coinbase { height: 3, .. }));
    }

    #[test]
    fn test_coinbase_shape_is_enforced() {
        let wallet = Wallet::new().unwrap();
        let coinbase_kind = ScriptKind::Coinbase {
            height: 4,
            extra_nonce: vec![1],
        };
        let payout = TXOutput::new(500, &wallet.get_address()).unwrap();

        let good = Transaction::new_coinbase(&wallet.get_address(), 500, 4).unwrap();
        good.check_coinbase(4).unwrap();
        assert!(good.check_coinbase(5).is_err());

        let spending = Transaction::assemble(
            coinbase_kind.clone(),
            vec![TXInput::new(OutPoint::new(&[9; 32], 0))],
            vec![payout.clone()],
            0,
            0,
        )
        .unwrap();
        match spending.check_coinbase(4) {
            Err(BlockchainError::InvalidBlock(BlockRejection::BadCoinbase(reason))) => {
                assert_eq!(reason, "has inputs")
            }
            other => panic!("unexpected result {other:?}"),
        }

        // with_pub_key_hash refuses zero, a decoded block does not go through it
        let zero = TXOutput {
            value: 0,
            pub_key_hash: wallet.get_pub_key_hash(),
        };
        let worthless =
            Transaction::assemble(coinbase_kind.clone(), vec![], vec![zero], 0, 0).unwrap();
        assert!(worthless.check_coinbase(4).is_err());

        let empty = Transaction::assemble(coinbase_kind, vec![], vec![], 0, 0).unwrap();
        assert!(empty.check_coinbase(4).is_err());
    }

    #[test]
    fn test_coinbase_ids_are_unique() {
        let wallet = Wallet::new().unwrap();
        let a = Transaction::new_coinbase(&wallet.get_address(), 500, 1).unwrap();
        let b = Transaction::new_coinbase(&wallet.get_address(), 500, 1).unwrap();
        assert_ne!(a.get_id(), b.get_id());
    }

    #[test]
    fn test_transfer_balances_and_verifies() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let utxos = funded(&alice, &[60, 70]);
        let spendable: Vec<_> = utxos.clone().into_iter().collect();

        let tx = Transaction::new_transfer(&alice, &bob.get_address(), 100, 5, &spendable).unwrap();

        assert_eq!(tx.get_vin().len(), 2);
        assert_eq!(tx.get_vout()[0].get_value(), 100);
        assert_eq!(tx.get_vout()[1].get_value(), 25);
        assert_eq!(tx.check_against(&utxos).unwrap(), 5);
    }

    #[test]
    fn test_transfer_without_funds_fails() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let spendable: Vec<_> = funded(&alice, &[10]).into_iter().collect();

        let result = Transaction::new_transfer(&alice, &bob.get_address(), 100, 1, &spendable);
        assert!(matches!(
            result,
            Err(BlockchainError::InsufficientFunds {
                required: 101,
                available: 10
            })
        ));
    }

    #[test]
    fn test_tampered_output_breaks_signature() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let utxos = funded(&alice, &[50]);
        let spendable: Vec<_> = utxos.clone().into_iter().collect();
        let mut tx =
            Transaction::new_transfer(&alice, &bob.get_address(), 20, 1, &spendable).unwrap();

        tx.vout[0].value = 21;
        tx.vout[1].value = 28;
        tx.id = tx.compute_id().unwrap();

        assert!(matches!(
            tx.check_against(&utxos),
            Err(BlockchainError::InvalidTransaction(TxRejection::BadSignature { input: 0 }))
        ));
    }

    #[test]
    fn test_spending_someone_elses_output_is_rejected() {
        let alice = Wallet::new().unwrap();
        let mallory = Wallet::new().unwrap();
        let utxos = funded(&alice, &[50]);
        let (outpoint, _) = utxos.iter().next().unwrap();

        let mut tx = Transaction::new_standard(
            vec![outpoint.clone()],
            vec![TXOutput::with_pub_key_hash(49, mallory.get_pub_key_hash()).unwrap()],
            1,
            0,
        )
        .unwrap();
        tx.sign(&mallory).unwrap();

        assert!(matches!(
            tx.check_against(&utxos),
            Err(BlockchainError::InvalidTransaction(TxRejection::BadSignature { .. }))
        ));
    }

    #[test]
    fn test_understated_fee_is_a_mismatch() {
        let alice = Wallet::new().unwrap();
        let utxos = funded(&alice, &[50]);
        let (outpoint, _) = utxos.iter().next().unwrap();

        let mut tx = Transaction::new_standard(
            vec![outpoint.clone()],
            vec![TXOutput::with_pub_key_hash(40, alice.get_pub_key_hash()).unwrap()],
            1,
            0,
        )
        .unwrap();
        tx.sign(&alice).unwrap();

        assert!(matches!(
            tx.check_against(&utxos),
            Err(BlockchainError::InvalidTransaction(TxRejection::FeeMismatch {
                declared: 1,
                actual: 10
            }))
        ));
    }

    #[test]
    fn test_missing_input_is_a_double_spend() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let spendable: Vec<_> = funded(&alice, &[50]).into_iter().collect();
        let tx = Transaction::new_transfer(&alice, &bob.get_address(), 20, 1, &spendable).unwrap();

        let empty: BTreeMap<OutPoint, UtxoEntry> = BTreeMap::new();
        assert!(matches!(
            tx.check_against(&empty),
            Err(BlockchainError::InvalidTransaction(TxRejection::DoubleSpend(_)))
        ));
    }

    #[test]
    fn test_bump_fee_shrinks_change_and_raises_sequence() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let utxos = funded(&alice, &[100]);
        let spendable: Vec<_> = utxos.clone().into_iter().collect();
        let tx = Transaction::new_transfer(&alice, &bob.get_address(), 30, 2, &spendable).unwrap();

        let bumped = tx.bump_fee(&alice, 10).unwrap();

        assert_eq!(bumped.get_sequence(), 1);
        assert_eq!(bumped.get_vin()[0].get_prev_out(), tx.get_vin()[0].get_prev_out());
        assert_eq!(bumped.get_vout()[0].get_value(), 30);
        assert_eq!(bumped.get_vout()[1].get_value(), 60);
        assert_eq!(bumped.check_against(&utxos).unwrap(), 10);
    }

    #[test]
    fn test_outpoint_key_round_trip() {
        let outpoint = OutPoint::new(&[7u8; 32], 513);
        assert_eq!(OutPoint::from_key(&outpoint.to_key()).unwrap(), outpoint);
        assert!(OutPoint::from_key(&[1, 2]).is_err());
    }
}
