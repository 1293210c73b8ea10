use crate::core::{Block, Blockchain, ChainSelection, ChainStatus, ChainTip, NodeEvent, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::peers::{PeerRegistry, PeerStatus};
use crate::network::transport::PeerTransport;
use crate::utils::current_timestamp;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Blocks per `GetBlocks` request, also the most a server hands out
    pub batch_size: u64,
    pub heartbeat_interval_secs: u64,
    /// Silence after which a peer is unreachable
    pub peer_timeout_secs: u64,
    /// Silence after which an unreachable peer is forgotten
    pub peer_eviction_secs: u64,
    /// Connect, read and write timeout of a single request
    pub request_timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub event_capacity: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            batch_size: 50,
            heartbeat_interval_secs: 30,
            peer_timeout_secs: 90,
            peer_eviction_secs: 3_600,
            request_timeout_ms: 5_000,
            sync_interval_secs: 120,
            event_capacity: 1024,
        }
    }
}

impl SyncPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The peer's chain is not heavier than ours
    UpToDate,
    /// Another sync with the same peer is running
    AlreadySyncing,
    Selected(ChainSelection),
}

// Removes the peer from the in-flight set when the sync ends, however it
// ends. The last sync out puts a syncing chain back to synced.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    chain: &'a Blockchain,
    peer: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Ok(mut set) = self.set.lock() else {
            return;
        };
        set.remove(&self.peer);
        if !set.is_empty() {
            return;
        }
        let settled = match self.chain.status() {
            Ok(ChainStatus::Syncing) => self.chain.set_status(ChainStatus::Synced),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = settled {
            error!("Failed to reset chain status after sync with {}: {e}", self.peer);
        }
    }
}

/// Keeps this node's chain in line with its neighbors and relays what the
/// chain and mempool accept
pub struct Synchronizer {
    local_addr: String,
    chain: Arc<Blockchain>,
    peers: PeerRegistry,
    transport: Arc<dyn PeerTransport>,
    policy: SyncPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl Synchronizer {
    pub fn new(
        local_addr: &str,
        chain: Arc<Blockchain>,
        transport: Arc<dyn PeerTransport>,
        policy: SyncPolicy,
    ) -> Synchronizer {
        Synchronizer {
            local_addr: local_addr.to_string(),
            chain,
            peers: PeerRegistry::new(),
            transport,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn add_neighbor(&self, address: &str) -> Result<bool> {
        if address == self.local_addr {
            return Err(BlockchainError::Network(format!(
                "{address} is this node's own address"
            )));
        }
        self.peers.add(address)
    }

    pub fn remove_neighbor(&self, address: &str) -> Result<bool> {
        self.peers.remove(address)
    }

    // Runs one request, keeping the peer's record current
    fn request<T>(
        &self,
        peer: &str,
        call: impl FnOnce(&dyn PeerTransport) -> Result<T>,
    ) -> Result<T> {
        match call(self.transport.as_ref()) {
            Ok(value) => {
                self.peers.mark_seen(peer, None, current_timestamp()?)?;
                Ok(value)
            }
            Err(e) => {
                if matches!(e, BlockchainError::PeerUnreachable(_)) {
                    self.peers.mark_stale(peer)?;
                }
                Err(e)
            }
        }
    }

    /// Best effort: failures are logged and unreachable peers marked stale.
    /// Returns how many peers accepted the block.
    pub fn broadcast_block(&self, block: &Block) -> Result<usize> {
        let mut delivered = 0;
        for peer in self.peers.targets()? {
            match self.request(&peer, |t| t.post_block(&peer, &self.local_addr, block)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send block {} to {peer}: {e}", block.get_hash()),
            }
        }
        debug!("Block {} delivered to {delivered} peers", block.get_hash());
        Ok(delivered)
    }

    pub fn broadcast_tx(&self, tx: &Transaction) -> Result<usize> {
        let mut delivered = 0;
        for peer in self.peers.targets()? {
            match self.request(&peer, |t| t.post_tx(&peer, &self.local_addr, tx)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send transaction {} to {peer}: {e}", tx.get_id_hex()),
            }
        }
        debug!("Transaction {} delivered to {delivered} peers", tx.get_id_hex());
        Ok(delivered)
    }

    /// Tells `peer` about our tip so it can add us and sync if we are ahead
    pub fn announce_to(&self, peer: &str) -> Result<()> {
        let tip = self.chain.tip()?;
        self.request(peer, |t| t.announce(peer, &self.local_addr, &tip))
    }

    pub fn announce_all(&self) -> Result<usize> {
        let mut reached = 0;
        for peer in self.peers.targets()? {
            match self.announce_to(&peer) {
                Ok(()) => reached += 1,
                Err(e) => warn!("Failed to announce to {peer}: {e}"),
            }
        }
        Ok(reached)
    }

    fn begin_sync(&self, peer: &str) -> Result<Option<InFlight<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| BlockchainError::Network("Sync lock poisoned".to_string()))?;
        if !set.insert(peer.to_string()) {
            return Ok(None);
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            chain: &self.chain,
            peer: peer.to_string(),
        }))
    }

    /// Adopts `peer`'s chain when it carries more cumulative difficulty.
    ///
    /// Only the fetched blocks are held while talking to the peer; the chain
    /// lock is taken once everything has arrived. A failure discards the
    /// fetched blocks and counts against the peer.
    pub fn sync_with(&self, peer: &str) -> Result<SyncOutcome> {
        let Some(_in_flight) = self.begin_sync(peer)? else {
            debug!("Already syncing with {peer}");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        let remote = self.request(peer, |t| t.get_tip(peer))?;
        self.peers
            .mark_seen(peer, Some(&remote), current_timestamp()?)?;
        let local = self.chain.tip()?;
        if remote.cumulative_difficulty <= local.cumulative_difficulty {
            debug!(
                "{peer} is not ahead (difficulty {} vs {})",
                remote.cumulative_difficulty, local.cumulative_difficulty
            );
            return Ok(SyncOutcome::UpToDate);
        }

        info!(
            "Syncing with {peer}: height {} difficulty {} against local height {} difficulty {}",
            remote.height, remote.cumulative_difficulty, local.height, local.cumulative_difficulty
        );
        self.chain.set_status(ChainStatus::Syncing)?;
        let result = self
            .fetch_branch(peer, &remote, &local)
            .and_then(|branch| self.chain.select_chain(&branch));

        match result {
            Ok(selection) => {
                info!("Sync with {peer} finished: {selection:?}");
                Ok(SyncOutcome::Selected(selection))
            }
            Err(e) => {
                let failures = self.peers.record_failed_sync(peer)?;
                warn!("Sync with {peer} failed ({failures} failed so far): {e}");
                Err(e)
            }
        }
    }

    // Downloads the peer's blocks above the common ancestor, checking each
    // header against its parent as it arrives
    fn fetch_branch(&self, peer: &str, remote: &ChainTip, local: &ChainTip) -> Result<Vec<Block>> {
        let fork_height = self.find_common_ancestor(peer, remote.height.min(local.height))?;
        let fork = self.chain.block_at(fork_height)?.ok_or_else(|| {
            BlockchainError::Database(format!("Missing main-chain block at {fork_height}"))
        })?;
        let batch = self.policy.batch_size.max(1);

        let mut parent_height = fork_height;
        let mut parent_hash = fork.get_hash().to_string();
        let mut branch = vec![];
        while parent_height < remote.height {
            let from = parent_height + 1;
            let to = from.saturating_add(batch - 1).min(remote.height);
            let blocks = self.request(peer, |t| t.get_blocks(peer, from, to))?;
            if blocks.is_empty() {
                return Err(BlockchainError::Network(format!(
                    "{peer} has no blocks for {from}..={to}"
                )));
            }
            for block in blocks {
                self.chain
                    .verify_block_header(&block, parent_height, &parent_hash)?;
                parent_height = block.get_height();
                parent_hash = block.get_hash().to_string();
                branch.push(block);
            }
        }
        debug!(
            "Fetched {} blocks from {peer} above height {fork_height}",
            branch.len()
        );
        Ok(branch)
    }

    // Walks back from `start` a batch at a time until a height where the
    // peer's block is ours too
    fn find_common_ancestor(&self, peer: &str, start: u64) -> Result<u64> {
        let batch = self.policy.batch_size.max(1);
        let mut high = start;
        loop {
            let low = high.saturating_sub(batch - 1);
            let blocks = self.request(peer, |t| t.get_blocks(peer, low, high))?;
            for block in blocks.iter().rev() {
                if let Some(local) = self.chain.block_at(block.get_height())? {
                    if local.get_hash() == block.get_hash() {
                        return Ok(block.get_height());
                    }
                }
            }
            if low == 0 {
                return Err(BlockchainError::Network(format!(
                    "{peer} shares no blocks with this node"
                )));
            }
            high = low - 1;
        }
    }

    /// Syncs with the reachable peer advertising the heaviest chain, if any
    /// is heavier than ours
    pub fn sync_all(&self) -> Result<Option<SyncOutcome>> {
        let local = self.chain.tip()?;
        let best = self
            .peers
            .snapshot()?
            .into_iter()
            .filter(|peer| peer.status != PeerStatus::Unreachable)
            .filter(|peer| peer.cumulative_difficulty > local.cumulative_difficulty)
            .max_by_key(|peer| peer.cumulative_difficulty);

        match best {
            Some(peer) => self.sync_with(&peer.address).map(Some),
            None => Ok(None),
        }
    }

    pub fn heartbeat(&self) -> Result<Vec<String>> {
        self.heartbeat_at(current_timestamp()?)
    }

    /// Asks every reachable peer for its tip. Peers silent for longer than
    /// the timeout become unreachable; the newly unreachable are returned.
    /// Unreachable peers silent past the eviction horizon are removed.
    pub fn heartbeat_at(&self, now: i64) -> Result<Vec<String>> {
        let timeout_ms =
            i64::try_from(self.policy.peer_timeout_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let eviction_ms =
            i64::try_from(self.policy.peer_eviction_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let evicted = self.peers.evict_unreachable(now, eviction_ms)?;
        if !evicted.is_empty() {
            info!("Forgot unreachable peers {}", evicted.join(", "));
        }

        let mut lost = vec![];
        for peer in self.peers.snapshot()? {
            if peer.status == PeerStatus::Unreachable {
                continue;
            }
            match self.transport.get_tip(&peer.address) {
                Ok(tip) => self.peers.mark_seen(&peer.address, Some(&tip), now)?,
                Err(e) => {
                    debug!("Heartbeat to {} failed: {e}", peer.address);
                    if now.saturating_sub(peer.last_seen) > timeout_ms {
                        self.peers.mark_unreachable(&peer.address)?;
                        lost.push(peer.address);
                    } else {
                        self.peers.mark_stale(&peer.address)?;
                    }
                }
            }
        }
        Ok(lost)
    }

    /// Relays accepted blocks and admitted transactions until every sender
    /// is gone
    pub fn run_event_loop(&self, events: Receiver<NodeEvent>) {
        for event in events.iter() {
            let result = match &event {
                NodeEvent::BlockAccepted(block) => self.broadcast_block(block),
                NodeEvent::TransactionAdmitted(tx) => self.broadcast_tx(tx),
            };
            if let Err(e) = result {
                error!("Failed to relay event: {e}");
            }
        }
        info!("Event channel closed, relay stopped");
    }

    /// Runs `sync_with` on its own thread
    pub fn schedule_sync(self: &Arc<Self>, peer: String) {
        let sync = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("sync-{peer}"))
            .spawn(move || {
                if let Err(e) = sync.sync_with(&peer) {
                    warn!("Scheduled sync with {peer} failed: {e}");
                }
            });
        if let Err(e) = spawned {
            error!("Failed to start sync thread: {e}");
        }
    }

    /// Starts the relay, heartbeat and periodic sync threads
    pub fn spawn_background(self: &Arc<Self>, events: Receiver<NodeEvent>) -> Result<Vec<JoinHandle<()>>> {
        let relay = {
            let sync = Arc::clone(self);
            thread::Builder::new()
                .name("relay".to_string())
                .spawn(move || sync.run_event_loop(events))?
        };

        let heartbeat = {
            let sync = Arc::clone(self);
            let interval = Duration::from_secs(self.policy.heartbeat_interval_secs);
            thread::Builder::new()
                .name("heartbeat".to_string())
                .spawn(move || loop {
                    thread::sleep(interval);
                    match sync.heartbeat() {
                        Ok(lost) if !lost.is_empty() => {
                            warn!("Lost contact with {}", lost.join(", "))
                        }
                        Ok(_) => {}
                        Err(e) => error!("Heartbeat failed: {e}"),
                    }
                })?
        };

        let periodic = {
            let sync = Arc::clone(self);
            let interval = Duration::from_secs(self.policy.sync_interval_secs);
            thread::Builder::new()
                .name("sync".to_string())
                .spawn(move || loop {
                    if let Err(e) = sync.heartbeat().and_then(|_| sync.sync_all()) {
                        warn!("Periodic sync failed: {e}");
                    }
                    thread::sleep(interval);
                })?
        };

        Ok(vec![relay, heartbeat, periodic])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{event_channel, forge_block};
    use crate::network::message::{Request, Response};
    use crate::network::transport::{LocalTransport, RequestHandler};
    use crate::network::Server;
    use crate::testnet::test_utils::{funded_wallet, memory_chain, mine_next};
    use crate::wallet::Wallet;

    const NOBODY: &str = "127.0.0.1:6999";

    struct TestNode {
        sync: Arc<Synchronizer>,
        // keeps the weakly registered handler alive
        _handler: Arc<dyn RequestHandler>,
    }

    impl TestNode {
        fn chain(&self) -> &Arc<Blockchain> {
            self.sync.chain()
        }
    }

    fn policy() -> SyncPolicy {
        SyncPolicy {
            batch_size: 2,
            ..SyncPolicy::default()
        }
    }

    fn start_node(transport: &Arc<LocalTransport>, address: &str) -> TestNode {
        let sync = Arc::new(Synchronizer::new(
            address,
            Arc::new(memory_chain()),
            Arc::clone(transport) as Arc<dyn PeerTransport>,
            policy(),
        ));
        let handler: Arc<dyn RequestHandler> = Arc::new(Server::new(Arc::clone(&sync)));
        transport.register(address, &handler).unwrap();
        TestNode {
            sync,
            _handler: handler,
        }
    }

    fn grow(chain: &Blockchain, blocks: usize) {
        let address = Wallet::new().unwrap().get_address();
        for _ in 0..blocks {
            chain.append(&mine_next(chain, &address, vec![])).unwrap();
        }
    }

    // Serves a fixed set of blocks and claims a fixed tip
    struct Canned {
        tip: ChainTip,
        blocks: Vec<Block>,
    }

    impl RequestHandler for Canned {
        fn handle(&self, request: Request) -> Response {
            match request {
                Request::GetTip => Response::Tip(self.tip.clone()),
                Request::GetBlocks { from, to } => Response::Blocks(
                    self.blocks
                        .iter()
                        .filter(|b| (from..=to).contains(&b.get_height()))
                        .map(|b| b.serialize().unwrap())
                        .collect(),
                ),
                _ => Response::Accepted,
            }
        }
    }

    #[test]
    fn test_sync_fetches_missing_blocks_in_batches() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7001");
        let remote = start_node(&transport, "127.0.0.1:7002");
        grow(remote.chain(), 5);

        local.sync.add_neighbor("127.0.0.1:7002").unwrap();
        let outcome = local.sync.sync_with("127.0.0.1:7002").unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Selected(ChainSelection::Extended { blocks: 5 })
        );
        assert_eq!(local.chain().tip().unwrap(), remote.chain().tip().unwrap());
        assert_eq!(local.chain().status().unwrap(), ChainStatus::Synced);
        assert_eq!(
            local.sync.sync_with("127.0.0.1:7002").unwrap(),
            SyncOutcome::UpToDate
        );
    }

    #[test]
    fn test_status_stays_syncing_while_another_sync_runs() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7061");
        let remote = start_node(&transport, "127.0.0.1:7062");
        grow(remote.chain(), 3);
        local.sync.add_neighbor("127.0.0.1:7062").unwrap();

        // a slower sync with another peer is still fetching
        let other = local.sync.begin_sync("127.0.0.1:7063").unwrap().unwrap();
        local.chain().set_status(ChainStatus::Syncing).unwrap();

        let outcome = local.sync.sync_with("127.0.0.1:7062").unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Selected(ChainSelection::Extended { blocks: 3 })
        );
        assert_eq!(local.chain().status().unwrap(), ChainStatus::Syncing);

        drop(other);
        assert_eq!(local.chain().status().unwrap(), ChainStatus::Synced);
    }

    #[test]
    fn test_sync_reorganizes_onto_heavier_fork() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7011");
        let remote = start_node(&transport, "127.0.0.1:7012");
        grow(local.chain(), 2);
        grow(remote.chain(), 4);

        local.sync.add_neighbor("127.0.0.1:7012").unwrap();
        let outcome = local.sync.sync_with("127.0.0.1:7012").unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Selected(ChainSelection::Reorganized {
                fork_height: 0,
                rolled_back: 2,
                applied: 4,
            })
        );
        assert_eq!(local.chain().tip().unwrap(), remote.chain().tip().unwrap());
        assert_eq!(
            local.chain().utxo_snapshot().unwrap(),
            remote.chain().utxo_snapshot().unwrap()
        );
    }

    #[test]
    fn test_lighter_peer_changes_nothing() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7021");
        let remote = start_node(&transport, "127.0.0.1:7022");
        grow(local.chain(), 3);
        grow(remote.chain(), 1);
        let before = local.chain().tip().unwrap();

        local.sync.add_neighbor("127.0.0.1:7022").unwrap();
        assert_eq!(
            local.sync.sync_with("127.0.0.1:7022").unwrap(),
            SyncOutcome::UpToDate
        );
        assert_eq!(local.chain().tip().unwrap(), before);
    }

    #[test]
    fn test_bad_block_discards_partial_fetch() {
        let genesis = Block::genesis().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let coinbase = |height| Transaction::new_coinbase(&address, 1, height).unwrap();
        let first = forge_block(genesis.get_hash(), 1, 1, 10, vec![coinbase(1)]).unwrap();
        // claims height 2 but links to genesis
        let bogus = forge_block(genesis.get_hash(), 2, 1, 20, vec![coinbase(2)]).unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Canned {
            tip: ChainTip {
                height: 2,
                hash: bogus.get_hash().to_string(),
                cumulative_difficulty: 2,
            },
            blocks: vec![genesis, first, bogus],
        });

        let transport = Arc::new(LocalTransport::new());
        transport.register("127.0.0.1:7031", &handler).unwrap();
        let local = start_node(&transport, "127.0.0.1:7032");
        local.sync.add_neighbor("127.0.0.1:7031").unwrap();

        let result = local.sync.sync_with("127.0.0.1:7031");
        assert!(matches!(result, Err(BlockchainError::InvalidBlock(_))));
        assert_eq!(local.chain().height().unwrap(), 0);
        assert_eq!(local.chain().status().unwrap(), ChainStatus::Synced);
        let record = local.sync.peers().get("127.0.0.1:7031").unwrap().unwrap();
        assert_eq!(record.failed_syncs, 1);
        assert_eq!(record.status, PeerStatus::Active);
    }

    #[test]
    fn test_heartbeat_marks_silent_peers_unreachable() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7041");
        let _remote = start_node(&transport, "127.0.0.1:7042");
        local.sync.add_neighbor("127.0.0.1:7042").unwrap();
        local.sync.add_neighbor(NOBODY).unwrap();

        let now = current_timestamp().unwrap();
        assert!(local.sync.heartbeat_at(now).unwrap().is_empty());
        let silent = local.sync.peers().get(NOBODY).unwrap().unwrap();
        assert_eq!(silent.status, PeerStatus::Stale);

        let later = now + (policy().peer_timeout_secs as i64 + 1) * 1000;
        assert_eq!(
            local.sync.heartbeat_at(later).unwrap(),
            vec![NOBODY.to_string()]
        );
        assert_eq!(
            local.sync.peers().targets().unwrap(),
            vec!["127.0.0.1:7042".to_string()]
        );
        let answering = local.sync.peers().get("127.0.0.1:7042").unwrap().unwrap();
        assert_eq!(answering.status, PeerStatus::Active);
        assert_eq!(answering.last_seen, later);
    }

    #[test]
    fn test_heartbeat_forgets_long_unreachable_peers() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7071");
        local.sync.add_neighbor(NOBODY).unwrap();

        let now = current_timestamp().unwrap();
        let lost_at = now + (policy().peer_timeout_secs as i64 + 1) * 1000;
        assert_eq!(
            local.sync.heartbeat_at(lost_at).unwrap(),
            vec![NOBODY.to_string()]
        );
        assert!(local.sync.peers().contains(NOBODY).unwrap());

        let forgotten_at = now + (policy().peer_eviction_secs as i64 + 1) * 1000;
        assert!(local.sync.heartbeat_at(forgotten_at).unwrap().is_empty());
        assert!(!local.sync.peers().contains(NOBODY).unwrap());
    }

    #[test]
    fn test_broadcast_reaches_peers_and_marks_silent_ones() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7051");
        let remote = start_node(&transport, "127.0.0.1:7052");
        local.sync.add_neighbor("127.0.0.1:7052").unwrap();
        local.sync.add_neighbor(NOBODY).unwrap();

        let alice = funded_wallet(local.chain());
        let block = local.chain().block_at(1).unwrap().unwrap();
        assert_eq!(local.sync.broadcast_block(&block).unwrap(), 1);
        assert_eq!(remote.chain().tip().unwrap(), local.chain().tip().unwrap());
        assert_eq!(
            local.sync.peers().get(NOBODY).unwrap().unwrap().status,
            PeerStatus::Stale
        );

        let bob = Wallet::new().unwrap();
        let spendable = local
            .chain()
            .spendable_outputs(&alice.get_address())
            .unwrap();
        let payment =
            Transaction::new_transfer(&alice, &bob.get_address(), 10, 5, &spendable).unwrap();
        local.chain().submit_transaction(payment.clone()).unwrap();
        assert_eq!(local.sync.broadcast_tx(&payment).unwrap(), 1);
        assert!(remote.chain().mempool().contains(&payment.get_id_hex()));
    }

    #[test]
    fn test_event_loop_relays_until_channel_closes() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7061");
        let remote = start_node(&transport, "127.0.0.1:7062");
        local.sync.add_neighbor("127.0.0.1:7062").unwrap();

        let block = mine_next(local.chain(), &Wallet::new().unwrap().get_address(), vec![]);
        local.chain().append(&block).unwrap();

        let (sender, events) = event_channel(4);
        sender.emit(NodeEvent::BlockAccepted(block.clone()));
        drop(sender);
        local.sync.run_event_loop(events);

        assert_eq!(remote.chain().tip().unwrap().hash, block.get_hash());
    }

    #[test]
    fn test_sync_all_picks_heaviest_peer() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7071");
        let light = start_node(&transport, "127.0.0.1:7072");
        let heavy = start_node(&transport, "127.0.0.1:7073");
        grow(light.chain(), 1);
        grow(heavy.chain(), 3);
        local.sync.add_neighbor("127.0.0.1:7072").unwrap();
        local.sync.add_neighbor("127.0.0.1:7073").unwrap();

        // nothing advertised yet
        assert_eq!(local.sync.sync_all().unwrap(), None);

        local.sync.heartbeat().unwrap();
        local.sync.sync_all().unwrap();
        assert_eq!(local.chain().tip().unwrap(), heavy.chain().tip().unwrap());
    }

    #[test]
    fn test_cannot_add_self_as_neighbor() {
        let transport = Arc::new(LocalTransport::new());
        let local = start_node(&transport, "127.0.0.1:7081");
        assert!(local.sync.add_neighbor("127.0.0.1:7081").is_err());
    }
}
