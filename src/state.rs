use std::fmt;

use tokio::sync::watch;

use crate::error::ConsensusError;

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Asking the network to admit this peer.
    Joining,
    /// Waiting for a frame to fast-forward to.
    CatchingUp,
    /// Gossiping and running consensus.
    Babbling,
    /// Gossiping until our own leave request is committed.
    Leaving,
    Shutdown,
}

impl NodeState {
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Joining, CatchingUp)
                | (CatchingUp, Babbling)
                | (Babbling, Leaving)
                | (Leaving, Babbling)
                | (Joining | CatchingUp | Babbling | Leaving, Shutdown)
        )
    }

    pub fn is_gossiping(self) -> bool {
        matches!(self, NodeState::Babbling | NodeState::Leaving)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Joining => "Joining",
            NodeState::CatchingUp => "CatchingUp",
            NodeState::Babbling => "Babbling",
            NodeState::Leaving => "Leaving",
            NodeState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Single owner of the node state. Transitions are checked and applied
/// atomically.
pub(crate) struct StateCell {
    tx: watch::Sender<NodeState>,
}

impl StateCell {
    pub(crate) fn new(initial: NodeState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> NodeState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.tx.subscribe()
    }

    /// Move to `to`, returning the previous state.
    pub(crate) fn transition(&self, to: NodeState) -> Result<NodeState, ConsensusError> {
        let mut outcome = Err(ConsensusError::InvalidState(to));
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from.can_transition_to(to) {
                *current = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(ConsensusError::InvalidStateTransition { from, to });
                false
            }
        });
        outcome
    }

    /// Enter `Shutdown` from any state. Returns the previous state, or `None`
    /// if the node was already shut down.
    pub(crate) fn shutdown(&self) -> Option<NodeState> {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == NodeState::Shutdown {
                return false;
            }
            previous = Some(*current);
            *current = NodeState::Shutdown;
            true
        });
        previous
    }
}
