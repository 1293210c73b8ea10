//! The node runtime
//!
//! Wires the chain manager, mempool, miner and synchronizer together over a
//! pair of stores and a peer transport, and exposes the operations behind
//! the command surface.

use crate::config::NodePolicy;
use crate::core::monetary::conversions::format_units;
use crate::core::{
    event_channel, Block, Blockchain, ChainStatus, ChainTip, Miner, NodeEvent, Transaction,
};
use crate::error::{BlockchainError, Result, TxRejection};
use crate::network::{
    PeerRecord, PeerTransport, RequestHandler, Server, SyncOutcome, Synchronizer, TcpTransport,
};
use crate::storage::{
    BlockStore, MemoryPool, MempoolEntry, SledBlockStore, SledUtxoStore, UtxoStore,
};
use crate::wallet::{validate_address, Wallet};
use data_encoding::HEXLOWER;
use log::{error, info, warn};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause after a failed mining round before trying again
const MINING_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Node {
    chain: Arc<Blockchain>,
    miner: Arc<Miner>,
    sync: Arc<Synchronizer>,
    server: Arc<Server>,
    events: Mutex<Option<Receiver<NodeEvent>>>,
    mining: Arc<AtomicBool>,
    policy: NodePolicy,
}

impl Node {
    /// Opens (or creates) the sled database in `data_dir` and talks to peers
    /// over TCP
    pub fn open(data_dir: impl AsRef<Path>, listen_addr: &str, policy: NodePolicy) -> Result<Node> {
        let data_dir = data_dir.as_ref();
        let db = sled::open(data_dir).map_err(|e| {
            BlockchainError::Database(format!("Failed to open {}: {e}", data_dir.display()))
        })?;
        let blocks = Arc::new(SledBlockStore::open(&db)?);
        let utxos = Arc::new(SledUtxoStore::open(&db)?);
        let transport = Arc::new(TcpTransport::new(policy.network.request_timeout()));
        Self::with_stores(listen_addr, blocks, utxos, transport, policy)
    }

    pub fn with_stores(
        listen_addr: &str,
        blocks: Arc<dyn BlockStore>,
        utxos: Arc<dyn UtxoStore>,
        transport: Arc<dyn PeerTransport>,
        policy: NodePolicy,
    ) -> Result<Node> {
        let (events, receiver) = event_channel(policy.network.event_capacity);
        let mempool = Arc::new(MemoryPool::with_events(
            policy.mempool.clone(),
            events.clone(),
        ));
        let chain = Arc::new(
            Blockchain::open(
                blocks,
                utxos,
                mempool,
                policy.chain.clone(),
                policy.difficulty.clone(),
            )?
            .with_events(events),
        );
        let sync = Arc::new(Synchronizer::new(
            listen_addr,
            Arc::clone(&chain),
            transport,
            policy.network.clone(),
        ));
        let server = Arc::new(Server::new(Arc::clone(&sync)));

        Ok(Node {
            chain,
            miner: Arc::new(Miner::new(policy.mining.clone())),
            sync,
            server,
            events: Mutex::new(Some(receiver)),
            mining: Arc::new(AtomicBool::new(false)),
            policy,
        })
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn policy(&self) -> &NodePolicy {
        &self.policy
    }

    pub fn address(&self) -> &str {
        self.sync.local_addr()
    }

    /// This node's request handler, for registering with a `LocalTransport`
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.server) as Arc<dyn RequestHandler>
    }

    /// Mines one block on the current tip and appends it
    pub fn mine(&self, address: &str) -> Result<Block> {
        if !validate_address(address) {
            return Err(BlockchainError::InvalidAddress(address.to_string()));
        }
        let block = self
            .miner
            .mine_block(self.chain.mempool(), &self.chain, address)?;
        self.chain.append(&block)?;
        info!(
            "New block {} at height {} is mined!",
            block.get_hash(),
            block.get_height()
        );
        Ok(block)
    }

    /// Mines on a background thread until `stop_mining`
    pub fn start_mining(&self, address: &str) -> Result<JoinHandle<()>> {
        if !validate_address(address) {
            return Err(BlockchainError::InvalidAddress(address.to_string()));
        }
        if self.mining.swap(true, Ordering::SeqCst) {
            return Err(BlockchainError::Mining("Already mining".to_string()));
        }

        let chain = Arc::clone(&self.chain);
        let miner = Arc::clone(&self.miner);
        let mining = Arc::clone(&self.mining);
        let address = address.to_string();
        let handle = thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || {
                info!("Mining is on. Rewards go to {address}");
                while mining.load(Ordering::SeqCst) {
                    let mined = miner
                        .mine_block(chain.mempool(), &chain, &address)
                        .and_then(|block| chain.append(&block).map(|_| block));
                    match mined {
                        Ok(block) => info!(
                            "New block {} at height {} is mined!",
                            block.get_hash(),
                            block.get_height()
                        ),
                        // the tip moved under us, start over on the new one
                        Err(BlockchainError::MiningCancelled) => {}
                        Err(e) => {
                            error!("Mining round failed: {e}");
                            thread::sleep(MINING_RETRY_DELAY);
                        }
                    }
                }
                info!("Mining stopped");
            })?;
        Ok(handle)
    }

    pub fn stop_mining(&self) {
        self.mining.store(false, Ordering::SeqCst);
        self.miner.cancel();
    }

    /// Returns false when the peer was already known
    pub fn add_peer(&self, address: &str) -> Result<bool> {
        let added = self.sync.add_neighbor(address)?;
        if added {
            if let Err(e) = self.sync.announce_to(address) {
                warn!("Added {address} but could not reach it: {e}");
            }
        }
        Ok(added)
    }

    pub fn remove_peer(&self, address: &str) -> Result<bool> {
        self.sync.remove_neighbor(address)
    }

    /// Syncs with `peer`, or with the heaviest known peer after refreshing
    /// everyone's tip
    pub fn sync(&self, peer: Option<&str>) -> Result<Option<SyncOutcome>> {
        match peer {
            Some(peer) => self.sync.sync_with(peer).map(Some),
            None => {
                self.sync.heartbeat()?;
                self.sync.sync_all()
            }
        }
    }

    /// Pays `amount` plus `fee` from `wallet`, skipping outputs already
    /// claimed by pooled transactions
    pub fn transfer(&self, wallet: &Wallet, to: &str, amount: u64, fee: u64) -> Result<Transaction> {
        if !validate_address(to) {
            return Err(BlockchainError::InvalidAddress(to.to_string()));
        }
        if amount == 0 {
            return Err(TxRejection::Malformed("amount must be positive".to_string()).into());
        }

        let mempool = self.chain.mempool();
        let available: Vec<_> = self
            .chain
            .spendable_outputs(&wallet.get_address())?
            .into_iter()
            .filter(|(outpoint, _)| !mempool.is_spent(outpoint))
            .collect();
        let tx = Transaction::new_transfer(wallet, to, amount, fee, &available)?;
        self.chain.submit_transaction(tx.clone())?;
        info!(
            "Submitted transaction {} paying {} to {to}",
            tx.get_id_hex(),
            format_units(amount)
        );
        Ok(tx)
    }

    /// Replaces the pooled transaction `txid` with a copy paying `new_fee`
    pub fn bump_fee(&self, wallet: &Wallet, txid: &str, new_fee: u64) -> Result<Transaction> {
        let entry = self.chain.mempool().get(txid).ok_or_else(|| {
            BlockchainError::ReplacementRejected(format!("{txid} is not in the mempool"))
        })?;
        let replacement = entry.get_transaction().bump_fee(wallet, new_fee)?;
        self.chain.replace_transaction(replacement.clone())?;
        Ok(replacement)
    }

    pub fn balance(&self, address: &str) -> Result<u64> {
        if !validate_address(address) {
            return Err(BlockchainError::InvalidAddress(address.to_string()));
        }
        self.chain.balance_of(address)
    }

    pub fn peers(&self) -> Result<Vec<PeerRecord>> {
        self.sync.peers().snapshot()
    }

    pub fn mempool_entries(&self) -> Vec<MempoolEntry> {
        self.chain.mempool().entries()
    }

    pub fn reindex_utxo(&self) -> Result<usize> {
        self.chain.rebuild_utxo()
    }

    /// Tip, status, the newest `limit` blocks, mempool and peers
    pub fn view(&self, limit: usize) -> Result<ChainView> {
        let tip = self.chain.tip()?;
        let from = (tip.height + 1).saturating_sub(limit as u64);
        let mut blocks: Vec<BlockSummary> = self
            .chain
            .blocks_in_range(from, tip.height)?
            .iter()
            .map(BlockSummary::from)
            .collect();
        blocks.reverse();

        let mempool = self.chain.mempool();
        Ok(ChainView {
            status: self.chain.status()?,
            next_difficulty: self.chain.next_difficulty()?,
            tip,
            blocks,
            mempool_size: mempool.len(),
            mempool_bytes: mempool.total_bytes(),
            peers: self.peers()?,
        })
    }

    /// Starts the relay, heartbeat and periodic sync threads. Only the first
    /// call starts anything.
    pub fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        let receiver = self
            .events
            .lock()
            .map_err(|_| BlockchainError::Network("Event receiver lock poisoned".to_string()))?
            .take();
        match receiver {
            Some(receiver) => self.sync.spawn_background(receiver),
            None => Ok(vec![]),
        }
    }

    /// Binds the listen address and serves peers on a background thread
    pub fn listen(&self) -> Result<JoinHandle<()>> {
        let listener = Server::bind(self.address())?;
        info!("Server listening on {}", self.address());
        let server = Arc::clone(&self.server);
        Ok(thread::Builder::new()
            .name("server".to_string())
            .spawn(move || server.serve(listener))?)
    }

    /// Listens, starts the background threads and announces this node to
    /// its peers
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = vec![self.listen()?];
        handles.extend(self.start_background()?);
        let reached = self.sync.announce_all()?;
        info!("Node {} started, announced to {reached} peers", self.address());
        Ok(handles)
    }
}

#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub difficulty: u32,
    pub nonce: u64,
    pub transactions: Vec<String>,
}

impl From<&Block> for BlockSummary {
    fn from(block: &Block) -> Self {
        BlockSummary {
            height: block.get_height(),
            hash: block.get_hash().to_string(),
            prev_hash: block.get_prev_hash().to_string(),
            timestamp: block.get_timestamp(),
            difficulty: block.get_difficulty(),
            nonce: block.get_nonce(),
            transactions: block
                .get_transactions()
                .iter()
                .map(|tx| HEXLOWER.encode(tx.get_id()))
                .collect(),
        }
    }
}

/// What `view` shows
#[derive(Debug, Clone)]
pub struct ChainView {
    pub tip: ChainTip,
    pub status: ChainStatus,
    pub next_difficulty: u32,
    /// Newest first
    pub blocks: Vec<BlockSummary>,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
    pub peers: Vec<PeerRecord>,
}

impl fmt::Display for ChainView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Tip: height {} hash {} (cumulative difficulty {}, {})",
            self.tip.height, self.tip.hash, self.tip.cumulative_difficulty, self.status
        )?;
        writeln!(f, "Next difficulty: {}", self.next_difficulty)?;
        writeln!(
            f,
            "Mempool: {} transactions, {} bytes",
            self.mempool_size, self.mempool_bytes
        )?;
        writeln!(f, "Peers: {}", self.peers.len())?;
        for peer in &self.peers {
            writeln!(
                f,
                "  {} {} height {} difficulty {}",
                peer.address, peer.status, peer.height, peer.cumulative_difficulty
            )?;
        }
        for block in &self.blocks {
            writeln!(f)?;
            writeln!(f, "Block {} at height {}", block.hash, block.height)?;
            writeln!(f, "  Prev: {}", block.prev_hash)?;
            writeln!(
                f,
                "  Timestamp: {} Difficulty: {} Nonce: {}",
                block.timestamp, block.difficulty, block.nonce
            )?;
            for txid in &block.transactions {
                writeln!(f, "  - {txid}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalTransport;
    use crate::storage::{MemoryBlockStore, MemoryUtxoStore};
    use crate::testnet::test_utils::test_policy;

    fn memory_node(address: &str) -> Node {
        Node::with_stores(
            address,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryUtxoStore::new()),
            Arc::new(LocalTransport::new()),
            test_policy(),
        )
        .unwrap()
    }

    #[test]
    fn test_mine_credits_reward_and_clears_mempool() {
        let node = memory_node("127.0.0.1:9001");
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let reward = node.policy().chain.block_reward;

        node.mine(&alice.get_address()).unwrap();
        assert_eq!(node.chain().height().unwrap(), 1);
        assert_eq!(node.balance(&alice.get_address()).unwrap(), reward);

        let payment = node.transfer(&alice, &bob.get_address(), 300, 20).unwrap();
        assert_eq!(node.mempool_entries().len(), 1);

        let block = node.mine(&bob.get_address()).unwrap();
        assert_eq!(block.get_transactions()[1].get_id(), payment.get_id());
        assert!(node.mempool_entries().is_empty());
        assert_eq!(node.balance(&alice.get_address()).unwrap(), reward - 320);
        assert_eq!(node.balance(&bob.get_address()).unwrap(), reward + 320);
    }

    #[test]
    fn test_transfer_skips_pooled_outputs() {
        let node = memory_node("127.0.0.1:9002");
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        node.mine(&alice.get_address()).unwrap();

        node.transfer(&alice, &bob.get_address(), 10, 1).unwrap();
        // the only output is claimed by the pooled payment
        assert!(matches!(
            node.transfer(&alice, &bob.get_address(), 10, 1),
            Err(BlockchainError::InsufficientFunds { .. })
        ));

        node.mine(&bob.get_address()).unwrap();
        node.transfer(&alice, &bob.get_address(), 10, 1).unwrap();
    }

    #[test]
    fn test_bump_fee_replaces_pooled_payment() {
        let node = memory_node("127.0.0.1:9003");
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        node.mine(&alice.get_address()).unwrap();

        let payment = node.transfer(&alice, &bob.get_address(), 10, 1).unwrap();
        let bumped = node
            .bump_fee(&alice, &payment.get_id_hex(), 40)
            .unwrap();

        let entries = node.mempool_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get_transaction().get_id(), bumped.get_id());
        assert!(matches!(
            node.bump_fee(&alice, &payment.get_id_hex(), 80),
            Err(BlockchainError::ReplacementRejected(_))
        ));
    }

    #[test]
    fn test_rejects_bad_addresses_and_amounts() {
        let node = memory_node("127.0.0.1:9004");
        let alice = Wallet::new().unwrap();
        assert!(matches!(
            node.mine("not-an-address"),
            Err(BlockchainError::InvalidAddress(_))
        ));
        assert!(matches!(
            node.balance("not-an-address"),
            Err(BlockchainError::InvalidAddress(_))
        ));
        assert!(node.transfer(&alice, &alice.get_address(), 0, 1).is_err());
    }

    #[test]
    fn test_view_lists_newest_first() {
        let node = memory_node("127.0.0.1:9005");
        let address = Wallet::new().unwrap().get_address();
        node.mine(&address).unwrap();
        let last = node.mine(&address).unwrap();
        node.add_peer("127.0.0.1:9006").unwrap();

        let view = node.view(2).unwrap();
        assert_eq!(view.blocks.len(), 2);
        assert_eq!(view.blocks[0].hash, last.get_hash());
        assert_eq!(view.peers.len(), 1);

        let text = view.to_string();
        assert!(text.contains(&format!("Tip: height 2 hash {}", last.get_hash())));
        assert!(text.contains("127.0.0.1:9006"));
    }

    #[test]
    fn test_background_starts_once() {
        let node = memory_node("127.0.0.1:9007");
        assert_eq!(node.start_background().unwrap().len(), 3);
        assert!(node.start_background().unwrap().is_empty());
    }

    #[test]
    fn test_mining_loop_stops() {
        let node = memory_node("127.0.0.1:9008");
        let address = Wallet::new().unwrap().get_address();
        let handle = node.start_mining(&address).unwrap();
        assert!(node.start_mining(&address).is_err());

        while node.chain().height().unwrap() < 2 {
            thread::sleep(Duration::from_millis(10));
        }
        node.stop_mining();
        handle.join().unwrap();
        assert!(node.balance(&address).unwrap() >= 2 * node.policy().chain.block_reward);
    }
}
