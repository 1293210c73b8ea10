use crate::core::ChainTip;
use crate::error::{BlockchainError, Result};
use crate::utils::current_timestamp;
use log::{info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Answered recently, eligible for broadcast and sync
    Active,
    /// Missed a request; still eligible until the heartbeat gives up on it
    Stale,
    /// Silent past the timeout, ignored until it announces itself again
    Unreachable,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Active => write!(f, "active"),
            PeerStatus::Stale => write!(f, "stale"),
            PeerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub status: PeerStatus,
    /// Milliseconds since the epoch of the last successful exchange
    pub last_seen: i64,
    pub height: u64,
    pub cumulative_difficulty: u64,
    pub failed_syncs: u32,
}

impl PeerRecord {
    fn new(address: &str, now: i64) -> PeerRecord {
        PeerRecord {
            address: address.to_string(),
            status: PeerStatus::Active,
            last_seen: now,
            height: 0,
            cumulative_difficulty: 0,
            failed_syncs: 0,
        }
    }

    fn observe(&mut self, tip: Option<&ChainTip>, now: i64) {
        self.status = PeerStatus::Active;
        self.last_seen = self.last_seen.max(now);
        if let Some(tip) = tip {
            self.height = tip.height;
            self.cumulative_difficulty = tip.cumulative_difficulty;
        }
    }
}

/// `host:port` with a numeric port and a non-empty host
pub fn validate_peer_address(address: &str) -> Result<()> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(BlockchainError::Network(format!(
            "Invalid peer address {address}, expected host:port"
        ))),
    }
}

/// The neighbor set. Readers get snapshots, so nothing iterates while a
/// writer holds the lock.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, PeerRecord>>> {
        self.inner
            .read()
            .map_err(|_| BlockchainError::Network("Peer registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, PeerRecord>>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Network("Peer registry lock poisoned".to_string()))
    }

    /// Returns false when the peer was already known
    pub fn add(&self, address: &str) -> Result<bool> {
        validate_peer_address(address)?;
        let now = current_timestamp()?;
        let mut peers = self.write()?;
        if peers.contains_key(address) {
            return Ok(false);
        }
        peers.insert(address.to_string(), PeerRecord::new(address, now));
        info!("Added peer {address}");
        Ok(true)
    }

    /// Returns false when the peer was not known
    pub fn remove(&self, address: &str) -> Result<bool> {
        let removed = self.write()?.remove(address).is_some();
        if removed {
            info!("Removed peer {address}");
        }
        Ok(removed)
    }

    pub fn contains(&self, address: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(address))
    }

    pub fn get(&self, address: &str) -> Result<Option<PeerRecord>> {
        Ok(self.read()?.get(address).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Every known peer, ordered by address
    pub fn snapshot(&self) -> Result<Vec<PeerRecord>> {
        let mut peers: Vec<PeerRecord> = self.read()?.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(peers)
    }

    /// Peers that broadcast and sync may talk to
    pub fn targets(&self) -> Result<Vec<String>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|peer| peer.status != PeerStatus::Unreachable)
            .map(|peer| peer.address)
            .collect())
    }

    /// Records a successful exchange. Unknown and unreachable peers are
    /// left alone; only an announce brings the latter back.
    pub fn mark_seen(&self, address: &str, tip: Option<&ChainTip>, now: i64) -> Result<()> {
        if let Some(peer) = self.write()?.get_mut(address) {
            if peer.status != PeerStatus::Unreachable {
                peer.observe(tip, now);
            }
        }
        Ok(())
    }

    /// A peer announcing itself is added if new and made eligible again
    pub fn reannounce(&self, address: &str, tip: &ChainTip, now: i64) -> Result<()> {
        validate_peer_address(address)?;
        let mut peers = self.write()?;
        let peer = peers
            .entry(address.to_string())
            .or_insert_with(|| PeerRecord::new(address, now));
        if peer.status == PeerStatus::Unreachable {
            info!("Peer {address} is back");
        }
        peer.observe(Some(tip), now);
        Ok(())
    }

    pub fn mark_stale(&self, address: &str) -> Result<()> {
        if let Some(peer) = self.write()?.get_mut(address) {
            if peer.status == PeerStatus::Active {
                warn!("Peer {address} did not answer, marking stale");
                peer.status = PeerStatus::Stale;
            }
        }
        Ok(())
    }

    pub fn mark_unreachable(&self, address: &str) -> Result<()> {
        if let Some(peer) = self.write()?.get_mut(address) {
            if peer.status != PeerStatus::Unreachable {
                warn!("Peer {address} is unreachable");
                peer.status = PeerStatus::Unreachable;
            }
        }
        Ok(())
    }

    /// Removes unreachable peers whose last exchange is more than
    /// `horizon_ms` before `now` and returns their addresses
    pub fn evict_unreachable(&self, now: i64, horizon_ms: i64) -> Result<Vec<String>> {
        let mut peers = self.write()?;
        let mut evicted: Vec<String> = peers
            .values()
            .filter(|peer| {
                peer.status == PeerStatus::Unreachable
                    && now.saturating_sub(peer.last_seen) > horizon_ms
            })
            .map(|peer| peer.address.clone())
            .collect();
        evicted.sort();
        for address in &evicted {
            peers.remove(address);
        }
        Ok(evicted)
    }

    /// Returns the peer's failed-sync count after this failure
    pub fn record_failed_sync(&self, address: &str) -> Result<u32> {
        let mut peers = self.write()?;
        Ok(match peers.get_mut(address) {
            Some(peer) => {
                peer.failed_syncs = peer.failed_syncs.saturating_add(1);
                peer.failed_syncs
            }
            None => 0,
        })
    }
}
