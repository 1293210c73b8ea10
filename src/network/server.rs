use crate::core::{Block, Blockchain, ChainTip, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{Request, Response};
use crate::network::sync::Synchronizer;
use crate::network::transport::RequestHandler;
use crate::utils::current_timestamp;
use log::{debug, error, info, warn};
use serde_json::Deserializer;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Answers peer requests against the local chain and mempool
pub struct Server {
    sync: Arc<Synchronizer>,
}

impl Server {
    pub fn new(sync: Arc<Synchronizer>) -> Server {
        Server { sync }
    }

    fn chain(&self) -> &Arc<Blockchain> {
        self.sync.chain()
    }

    pub fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))
    }

    /// Binds `addr` and serves until the listener fails
    pub fn run(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = Self::bind(addr)?;
        info!("Server listening on {addr}");
        self.serve(listener);
        Ok(())
    }

    /// One thread per connection, one request per connection
    pub fn serve(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };

                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream, peer_addr) {
                            error!("Error handling connection from {peer_addr}: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
    }

    fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let timeout = Some(self.sync.policy().request_timeout());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        let request = {
            let reader = BufReader::new(&stream);
            match Deserializer::from_reader(reader).into_iter::<Request>().next() {
                Some(request) => request.map_err(|e| {
                    BlockchainError::Network(format!("Failed to deserialize request: {e}"))
                })?,
                None => return Ok(()),
            }
        };
        debug!("Received {} from {peer_addr}", request.kind());

        let response = self.handle(request);
        serde_json::to_writer(&stream, &response)?;
        stream.flush()?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn handle_get_blocks(&self, from: u64, to: u64) -> Result<Response> {
        let batch = self.sync.policy().batch_size.max(1);
        let to = to.min(from.saturating_add(batch - 1));
        let blocks = self
            .chain()
            .blocks_in_range(from, to)?
            .iter()
            .map(Block::serialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(Response::Blocks(blocks))
    }

    fn handle_block(&self, addr_from: &str, bytes: &[u8]) -> Result<Response> {
        let block = Block::deserialize(bytes)?;
        self.sync
            .peers()
            .mark_seen(addr_from, None, current_timestamp()?)?;

        let chain = self.chain();
        if chain.contains_block(block.get_hash())? {
            return Ok(Response::Accepted);
        }

        let tip = chain.tip()?;
        if block.get_prev_hash() == tip.hash {
            chain.append(&block)?;
            info!(
                "Added block {} at height {} from {addr_from}",
                block.get_hash(),
                block.get_height()
            );
            return Ok(Response::Accepted);
        }

        if block.get_height() >= tip.height {
            // a rival branch at least as tall as ours may be heavier, fetch it
            if !ProofOfWork::validate(block.get_header())? {
                return Ok(Response::rejected(format!(
                    "block {} does not meet its difficulty",
                    block.get_hash()
                )));
            }
            info!(
                "Block {} from {addr_from} is on another branch at height {} (ours {}), scheduling sync",
                block.get_hash(),
                block.get_height(),
                tip.height
            );
            self.sync.add_neighbor(addr_from)?;
            self.sync.schedule_sync(addr_from.to_string());
            return Ok(Response::Accepted);
        }

        Ok(Response::rejected(format!(
            "block {} at height {} does not extend tip {}",
            block.get_hash(),
            block.get_height(),
            tip.height
        )))
    }

    fn handle_tx(&self, addr_from: &str, bytes: &[u8]) -> Result<Response> {
        let tx = Transaction::deserialize(bytes)?;
        self.sync
            .peers()
            .mark_seen(addr_from, None, current_timestamp()?)?;

        let chain = self.chain();
        let mempool = chain.mempool();
        if mempool.contains(&tx.get_id_hex()) {
            return Ok(Response::Accepted);
        }

        // a transaction spending pooled inputs can only get in as a fee bump
        let conflicting = tx
            .get_vin()
            .iter()
            .any(|input| mempool.is_spent(input.get_prev_out()));
        let entry = if conflicting {
            chain.replace_transaction(tx)?
        } else {
            chain.submit_transaction(tx)?
        };
        debug!(
            "Pooled transaction {} from {addr_from}",
            entry.get_transaction().get_id_hex()
        );
        Ok(Response::Accepted)
    }

    fn handle_announce(&self, addr_from: &str, tip: ChainTip) -> Result<Response> {
        self.sync
            .peers()
            .reannounce(addr_from, &tip, current_timestamp()?)?;
        let local = self.chain().tip()?;
        if tip.cumulative_difficulty > local.cumulative_difficulty {
            self.sync.schedule_sync(addr_from.to_string());
        }
        Ok(Response::Accepted)
    }
}

impl RequestHandler for Server {
    fn handle(&self, request: Request) -> Response {
        let kind = request.kind();
        let result = match request {
            Request::GetTip => self.chain().tip().map(Response::Tip),
            Request::GetBlocks { from, to } => self.handle_get_blocks(from, to),
            Request::PostBlock { addr_from, block } => self.handle_block(&addr_from, &block),
            Request::PostTx {
                addr_from,
                transaction,
            } => self.handle_tx(&addr_from, &transaction),
            Request::Announce { addr_from, tip } => self.handle_announce(&addr_from, tip),
        };
        result.unwrap_or_else(|e| {
            warn!("Rejected {kind}: {e}");
            Response::rejected(e)
        })
    }
}
