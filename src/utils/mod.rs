//! Utility functions and helpers
//!
//! Hashing, signing, address encoding and the bincode helpers used
//! throughout the node.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, double_sha256, ed25519_sign, ed25519_verify,
    new_key_pair, public_key_from_pkcs8, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};
