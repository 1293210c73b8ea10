// Chain and mempool announce what they accepted on a bounded channel; the
// network side drains it and does the slow peer I/O on its own thread

use crate::core::{Block, Transaction};
use log::warn;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

#[derive(Debug, Clone)]
pub enum NodeEvent {
    BlockAccepted(Block),
    TransactionAdmitted(Transaction),
}

#[derive(Clone)]
pub struct EventSender {
    inner: SyncSender<NodeEvent>,
}

impl EventSender {
    /// Never blocks. A full or closed channel drops the event with a warning.
    pub fn emit(&self, event: NodeEvent) {
        match self.inner.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {}", describe(&event));
            }
            Err(TrySendError::Disconnected(event)) => {
                warn!("Event channel closed, dropping {}", describe(&event));
            }
        }
    }
}

fn describe(event: &NodeEvent) -> String {
    match event {
        NodeEvent::BlockAccepted(block) => format!("block {}", block.get_hash()),
        NodeEvent::TransactionAdmitted(tx) => format!("transaction {}", tx.get_id_hex()),
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, Receiver<NodeEvent>) {
    let (tx, rx) = sync_channel(capacity);
    (EventSender { inner: tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (sender, receiver) = event_channel(1);
        let genesis = Block::genesis().unwrap();

        sender.emit(NodeEvent::BlockAccepted(genesis.clone()));
        sender.emit(NodeEvent::BlockAccepted(genesis));

        assert!(matches!(receiver.try_recv(), Ok(NodeEvent::BlockAccepted(_))));
        assert!(receiver.try_recv().is_err());
    }
}
