use crate::core::{ChainPolicy, DifficultyPolicy, MinerPolicy};
use crate::error::{BlockchainError, Result};
use crate::network::SyncPolicy;
use crate::storage::MempoolPolicy;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::new);

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";
static DEFAULT_DATA_ROOT: &str = "./data";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const NODE_ID_KEY: &str = "NODE_ID";
const DATA_DIR_KEY: &str = "DATA_DIR";
const POLICY_FILE_KEY: &str = "POLICY_FILE";

/// Runtime settings of this process, seeded from the environment
pub struct Config {
    inner: RwLock<HashMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Config {
        let mut map = HashMap::new();
        map.insert(
            String::from(NODE_ADDRESS_KEY),
            env::var(NODE_ADDRESS_KEY).unwrap_or_else(|_| String::from(DEFAULT_NODE_ADDR)),
        );
        for key in [MINING_ADDRESS_KEY, NODE_ID_KEY, DATA_DIR_KEY, POLICY_FILE_KEY] {
            if let Ok(value) = env::var(key) {
                map.insert(String::from(key), value);
            }
        }

        Config {
            inner: RwLock::new(map),
        }
    }

    // A poisoned map still holds plain strings, so keep using it
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    pub fn get_node_addr(&self) -> String {
        self.get(NODE_ADDRESS_KEY)
            .unwrap_or_else(|| String::from(DEFAULT_NODE_ADDR))
    }

    pub fn set_node_addr(&self, addr: String) {
        self.write().insert(String::from(NODE_ADDRESS_KEY), addr);
    }

    pub fn set_mining_addr(&self, addr: String) {
        self.write().insert(String::from(MINING_ADDRESS_KEY), addr);
    }

    pub fn get_mining_addr(&self) -> Option<String> {
        self.get(MINING_ADDRESS_KEY)
    }

    pub fn is_miner(&self) -> bool {
        self.read().contains_key(MINING_ADDRESS_KEY)
    }

    pub fn set_node_id(&self, node_id: String) {
        self.write().insert(String::from(NODE_ID_KEY), node_id);
    }

    /// The configured id, or the port of the node address
    pub fn get_node_id(&self) -> String {
        self.get(NODE_ID_KEY)
            .unwrap_or_else(|| self.extract_node_id_from_addr())
    }

    /// Extract node ID from address (e.g., "127.0.0.1:2001" -> "2001")
    pub fn extract_node_id_from_addr(&self) -> String {
        let addr = self.get_node_addr();
        match addr.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() => port.to_string(),
            _ => "default".to_string(),
        }
    }

    /// Where this node keeps its sled database
    pub fn get_data_dir(&self) -> PathBuf {
        match self.get(DATA_DIR_KEY) {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(DEFAULT_DATA_ROOT).join(format!("node_{}", self.get_node_id())),
        }
    }

    pub fn set_data_dir(&self, dir: String) {
        self.write().insert(String::from(DATA_DIR_KEY), dir);
    }

    pub fn get_policy_file(&self) -> Option<PathBuf> {
        self.get(POLICY_FILE_KEY).map(PathBuf::from)
    }

    /// The policy from `POLICY_FILE` when set, the defaults otherwise
    pub fn load_policy(&self) -> Result<NodePolicy> {
        match self.get_policy_file() {
            Some(path) => NodePolicy::load(path),
            None => Ok(NodePolicy::default()),
        }
    }
}

/// Consensus and resource policy of a node. Every section falls back to its
/// defaults, so a policy file only needs the values it changes:
///
/// ```toml
/// [difficulty]
/// initial = 12
///
/// [network]
/// sync_interval_secs = 60
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePolicy {
    pub chain: ChainPolicy,
    pub difficulty: DifficultyPolicy,
    pub mempool: MempoolPolicy,
    pub mining: MinerPolicy,
    pub network: SyncPolicy,
}

impl NodePolicy {
    pub fn load(path: impl AsRef<Path>) -> Result<NodePolicy> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<NodePolicy> {
        let policy: NodePolicy = toml::from_str(text)?;
        policy.check()?;
        Ok(policy)
    }

    fn check(&self) -> Result<()> {
        let difficulty = &self.difficulty;
        if difficulty.floor == 0 || difficulty.floor > difficulty.max {
            return Err(BlockchainError::Config(format!(
                "Difficulty floor {} must be within 1..={}",
                difficulty.floor, difficulty.max
            )));
        }
        if !difficulty.allows(difficulty.initial) {
            return Err(BlockchainError::Config(format!(
                "Initial difficulty {} is outside {}..={}",
                difficulty.initial, difficulty.floor, difficulty.max
            )));
        }
        if difficulty.window == 0 {
            return Err(BlockchainError::Config(
                "Difficulty window must be at least one block".to_string(),
            ));
        }
        if self.network.batch_size == 0 {
            return Err(BlockchainError::Config(
                "Sync batch size must be at least one block".to_string(),
            ));
        }
        if self.network.peer_eviction_secs < self.network.peer_timeout_secs {
            return Err(BlockchainError::Config(format!(
                "Peer eviction horizon {}s is shorter than the peer timeout {}s",
                self.network.peer_eviction_secs, self.network.peer_timeout_secs
            )));
        }
        Ok(())
    }
}
