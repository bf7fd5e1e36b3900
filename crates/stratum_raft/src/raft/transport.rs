//! Transport seam for consensus messages.
//!
//! The driver is transport-agnostic: it registers an inbox per node and
//! enqueues addressed messages. Delivery is at-least-once and may reorder;
//! the group state machine tolerates both.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::raft::types::{NodeId, RaftMessage};

pub trait Transport: Send + Sync + 'static {
    /// Register a node and return its message inbox. Re-listening replaces
    /// the previous inbox.
    fn listen(&self, node_id: NodeId) -> anyhow::Result<mpsc::UnboundedReceiver<RaftMessage>>;

    /// Unregister a node; subsequent sends to it fail.
    fn stop(&self, node_id: NodeId);

    /// Enqueue a message for `msg.to`. Never blocks the caller.
    fn send(&self, msg: RaftMessage) -> anyhow::Result<()>;
}

/// In-process transport backed by per-node unbounded channels.
#[derive(Default)]
pub struct LocalTransport {
    nodes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<RaftMessage>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for LocalTransport {
    fn listen(&self, node_id: NodeId) -> anyhow::Result<mpsc::UnboundedReceiver<RaftMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.lock().unwrap().insert(node_id, tx);
        Ok(rx)
    }

    fn stop(&self, node_id: NodeId) {
        self.nodes.lock().unwrap().remove(&node_id);
    }

    fn send(&self, msg: RaftMessage) -> anyhow::Result<()> {
        let sender = {
            let nodes = self.nodes.lock().unwrap();
            nodes.get(&msg.to).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(msg).is_err() {
                    debug!("dropping message to stopped node");
                }
                Ok(())
            }
            None => anyhow::bail!("unknown node {}", msg.to),
        }
    }
}
