use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const WALLET_FILE: &str = "wallet.dat";

/// Key pairs by address, persisted as one bincode file
pub struct Wallets {
    path: PathBuf,
    wallets: HashMap<String, Wallet>,
}

impl Wallets {
    /// Opens `wallet.dat` in the current directory
    pub fn new() -> Result<Wallets> {
        Self::open(std::env::current_dir()?.join(WALLET_FILE))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        let wallets = if path.exists() {
            let buf = fs::read(&path)?;
            deserialize(&buf[..]).map_err(|e| {
                BlockchainError::Wallet(format!("Could not load {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(Wallets { path, wallets })
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn require_wallet(&self, address: &str) -> Result<&Wallet> {
        self.get_wallet(address)
            .ok_or_else(|| BlockchainError::Wallet(format!("No local key for {address}")))
    }

    fn save_to_file(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let wallets_bytes = serialize(&self.wallets)?;
        writer.write_all(wallets_bytes.as_slice())?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wallets_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);

        let address = {
            let mut wallets = Wallets::open(&path).unwrap();
            wallets.create_wallet().unwrap()
        };

        let wallets = Wallets::open(&path).unwrap();
        assert_eq!(wallets.get_addresses(), vec![address.clone()]);
        let wallet = wallets.require_wallet(&address).unwrap();
        assert_eq!(wallet.get_address(), address);
        assert!(wallets.require_wallet("missing").is_err());
    }
}
