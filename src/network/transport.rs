use crate::core::{Block, ChainTip, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{Request, Response};
use log::debug;
use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Whatever answers requests for a node; the server implements it
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Response;
}

/// Request/response primitives against one peer. Implementors supply
/// `send`; the typed calls are built on it.
pub trait PeerTransport: Send + Sync {
    /// Fails with `PeerUnreachable` when the peer cannot be reached in time
    fn send(&self, peer: &str, request: &Request) -> Result<Response>;

    fn get_tip(&self, peer: &str) -> Result<ChainTip> {
        match self.send(peer, &Request::GetTip)? {
            Response::Tip(tip) => Ok(tip),
            other => Err(unexpected(peer, "GetTip", other)),
        }
    }

    fn get_blocks(&self, peer: &str, from: u64, to: u64) -> Result<Vec<Block>> {
        match self.send(peer, &Request::GetBlocks { from, to })? {
            Response::Blocks(blocks) => blocks
                .iter()
                .map(|bytes| Block::deserialize(bytes))
                .collect(),
            other => Err(unexpected(peer, "GetBlocks", other)),
        }
    }

    fn post_block(&self, peer: &str, addr_from: &str, block: &Block) -> Result<()> {
        let request = Request::post_block(addr_from, block)?;
        expect_accepted(peer, self.send(peer, &request)?)
    }

    fn post_tx(&self, peer: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
        let request = Request::post_tx(addr_from, tx)?;
        expect_accepted(peer, self.send(peer, &request)?)
    }

    fn announce(&self, peer: &str, addr_from: &str, tip: &ChainTip) -> Result<()> {
        let request = Request::Announce {
            addr_from: addr_from.to_string(),
            tip: tip.clone(),
        };
        expect_accepted(peer, self.send(peer, &request)?)
    }
}

fn unexpected(peer: &str, kind: &str, response: Response) -> BlockchainError {
    match response {
        Response::Rejected { reason } => {
            BlockchainError::Network(format!("{peer} rejected {kind}: {reason}"))
        }
        other => BlockchainError::Network(format!("{peer} answered {kind} with {other:?}")),
    }
}

fn expect_accepted(peer: &str, response: Response) -> Result<()> {
    match response {
        Response::Accepted => Ok(()),
        Response::Rejected { reason } => {
            Err(BlockchainError::Network(format!("{peer} rejected: {reason}")))
        }
        other => Err(BlockchainError::Network(format!(
            "{peer} answered with {other:?}"
        ))),
    }
}

/// JSON over TCP, one connection per request
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> TcpTransport {
        TcpTransport { timeout }
    }

    fn resolve(peer: &str) -> Result<SocketAddr> {
        peer.to_socket_addrs()
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{peer}: {e}")))?
            .next()
            .ok_or_else(|| BlockchainError::PeerUnreachable(format!("{peer}: no address")))
    }
}

impl PeerTransport for TcpTransport {
    fn send(&self, peer: &str, request: &Request) -> Result<Response> {
        let addr = Self::resolve(peer)?;
        debug!("Sending {} to {peer}", request.kind());
        let unreachable = |e: std::io::Error| BlockchainError::PeerUnreachable(format!("{peer}: {e}"));

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(unreachable)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(unreachable)?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(unreachable)?;

        serde_json::to_writer(&stream, request).map_err(|e| {
            BlockchainError::PeerUnreachable(format!("{peer}: failed to send request: {e}"))
        })?;
        stream.flush().map_err(unreachable)?;
        // end of request, so the server can answer
        stream.shutdown(Shutdown::Write).map_err(unreachable)?;

        serde_json::from_reader(BufReader::new(&stream)).map_err(|e| {
            if e.is_io() || e.is_eof() {
                BlockchainError::PeerUnreachable(format!("{peer}: no response: {e}"))
            } else {
                BlockchainError::Network(format!("{peer}: malformed response: {e}"))
            }
        })
    }
}

/// In-process transport: requests go straight to registered handlers after
/// a trip through the JSON encoding. Handlers are held weakly, so dropping
/// a node makes it unreachable.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<String, Weak<dyn RequestHandler>>>,
}

impl LocalTransport {
    pub fn new() -> LocalTransport {
        Self::default()
    }

    pub fn register(&self, address: &str, handler: &Arc<dyn RequestHandler>) -> Result<()> {
        self.handlers
            .write()
            .map_err(|_| BlockchainError::Network("Transport lock poisoned".to_string()))?
            .insert(address.to_string(), Arc::downgrade(handler));
        Ok(())
    }

    pub fn unregister(&self, address: &str) -> Result<()> {
        self.handlers
            .write()
            .map_err(|_| BlockchainError::Network("Transport lock poisoned".to_string()))?
            .remove(address);
        Ok(())
    }

    fn handler(&self, peer: &str) -> Result<Arc<dyn RequestHandler>> {
        self.handlers
            .read()
            .map_err(|_| BlockchainError::Network("Transport lock poisoned".to_string()))?
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BlockchainError::PeerUnreachable(format!("{peer}: not listening")))
    }
}

impl PeerTransport for LocalTransport {
    fn send(&self, peer: &str, request: &Request) -> Result<Response> {
        // the registry lock is released before the handler runs, handlers
        // may call back into this transport
        let handler = self.handler(peer)?;
        let request: Request = serde_json::from_slice(&serde_json::to_vec(request)?)?;
        let response = handler.handle(request);
        Ok(serde_json::from_slice(&serde_json::to_vec(&response)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    struct FixedTip(ChainTip);

    impl RequestHandler for FixedTip {
        fn handle(&self, request: Request) -> Response {
            match request {
                Request::GetTip => Response::Tip(self.0.clone()),
                Request::Announce { .. } => Response::Accepted,
                other => Response::rejected(format!("{} not supported", other.kind())),
            }
        }
    }

    fn tip() -> ChainTip {
        ChainTip {
            height: 3,
            hash: "ab".repeat(32),
            cumulative_difficulty: 7,
        }
    }

    #[test]
    fn test_local_transport_routes_by_address() {
        let transport = LocalTransport::new();
        let handler: Arc<dyn RequestHandler> = Arc::new(FixedTip(tip()));
        transport.register("127.0.0.1:5001", &handler).unwrap();

        assert_eq!(transport.get_tip("127.0.0.1:5001").unwrap(), tip());
        transport
            .announce("127.0.0.1:5001", "127.0.0.1:5002", &tip())
            .unwrap();
        assert!(matches!(
            transport.get_blocks("127.0.0.1:5001", 0, 1),
            Err(BlockchainError::Network(_))
        ));
        assert!(matches!(
            transport.get_tip("127.0.0.1:5003"),
            Err(BlockchainError::PeerUnreachable(_))
        ));

        drop(handler);
        assert!(matches!(
            transport.get_tip("127.0.0.1:5001"),
            Err(BlockchainError::PeerUnreachable(_))
        ));
    }

    #[test]
    fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let request: Request = serde_json::from_reader(BufReader::new(&stream)).unwrap();
            assert_eq!(request, Request::GetTip);
            serde_json::to_writer(&stream, &Response::Tip(tip())).unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(5));
        assert_eq!(transport.get_tip(&addr).unwrap(), tip());
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_transport_unreachable_peer() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let transport = TcpTransport::new(Duration::from_millis(500));
        assert!(matches!(
            transport.get_tip(&addr),
            Err(BlockchainError::PeerUnreachable(_))
        ));
    }
}
