use tokio::sync::broadcast;

use crate::{event::EventHash, state::NodeState};

/// Notifications published by a node as it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    StateChanged {
        from: NodeState,
        to: NodeState,
    },
    BlockCommitted {
        index: i64,
        round_received: i64,
        transactions: usize,
        state_hash: Vec<u8>,
    },
    CommitFailed {
        index: i64,
        reason: String,
    },
    EquivocationDetected {
        creator: String,
        event: EventHash,
    },
    PeerSetChanged {
        effective_round: i64,
        peers: usize,
    },
    CatchUpFailed {
        attempts: u32,
        reason: String,
    },
}

pub trait NodeEventBus: Clone + Send + Sync + 'static {
    /// Type returned to consumers that subscribe to node events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, node_id: u32, event: NodeEvent);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<(u32, NodeEvent)>,
}

impl BroadcastEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl NodeEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<(u32, NodeEvent)>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, node_id: u32, event: NodeEvent) {
        let _ = self.sender.send((node_id, event));
    }
}
