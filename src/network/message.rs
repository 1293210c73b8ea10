//! Wire messages. One JSON request per connection, answered by one JSON
//! response; blocks and transactions ride inside as bincode bytes.

use crate::core::{Block, ChainTip, Transaction};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetTip,
    /// Main-chain blocks `from..=to`; the server may answer with fewer
    GetBlocks {
        from: u64,
        to: u64,
    },
    PostBlock {
        addr_from: String,
        block: Vec<u8>,
    },
    PostTx {
        addr_from: String,
        transaction: Vec<u8>,
    },
    Announce {
        addr_from: String,
        tip: ChainTip,
    },
}

impl Request {
    pub fn post_block(addr_from: &str, block: &Block) -> Result<Request> {
        Ok(Request::PostBlock {
            addr_from: addr_from.to_string(),
            block: block.serialize()?,
        })
    }

    pub fn post_tx(addr_from: &str, tx: &Transaction) -> Result<Request> {
        Ok(Request::PostTx {
            addr_from: addr_from.to_string(),
            transaction: tx.serialize()?,
        })
    }

    /// Short label for logs, without the payload
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetTip => "GetTip",
            Request::GetBlocks { .. } => "GetBlocks",
            Request::PostBlock { .. } => "PostBlock",
            Request::PostTx { .. } => "PostTx",
            Request::Announce { .. } => "Announce",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Tip(ChainTip),
    Blocks(Vec<Vec<u8>>),
    Accepted,
    Rejected { reason: String },
}

impl Response {
    pub fn rejected(reason: impl ToString) -> Response {
        Response::Rejected {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_tagged_json() {
        let request = Request::GetBlocks { from: 3, to: 7 };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"GetBlocks":{"from":3,"to":7}}"#);
        assert_eq!(serde_json::from_str::<Request>(&json).unwrap(), request);
        assert_eq!(
            serde_json::to_string(&Request::GetTip).unwrap(),
            r#""GetTip""#
        );
    }

    #[test]
    fn test_block_payload_survives_envelope() {
        let block = Block::genesis().unwrap();
        let request = Request::post_block("127.0.0.1:2001", &block).unwrap();
        let json = serde_json::to_vec(&request).unwrap();

        match serde_json::from_slice::<Request>(&json).unwrap() {
            Request::PostBlock { addr_from, block: bytes } => {
                assert_eq!(addr_from, "127.0.0.1:2001");
                assert_eq!(Block::deserialize(&bytes).unwrap(), block);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }
}
