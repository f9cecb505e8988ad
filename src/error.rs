use alloy::primitives::SignatureError;

use crate::{event::EventHash, state::NodeState};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Mismatched length: expected {expect}, actual {actual}")]
    MismatchedLength { expect: usize, actual: usize },
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Invalid event signature")]
    InvalidEventSignature,
    #[error("Event {0} already exists")]
    EventAlreadyExists(EventHash),
    #[error("Unknown creator {0}")]
    UnknownCreator(String),
    #[error("Dangling parent {parent} referenced by {event}")]
    DanglingParent { event: EventHash, parent: EventHash },
    #[error("Self-parent {parent} of {event} was not created by the same creator")]
    InvalidSelfParent { event: EventHash, parent: EventHash },
    #[error("Invalid event index: expected {expected}, actual {actual}")]
    InvalidIndex { expected: i64, actual: i64 },

    #[error("Fork by {creator}: {event} reuses self-parent {self_parent:?}")]
    Equivocation {
        creator: String,
        event: EventHash,
        self_parent: Option<EventHash>,
    },

    #[error("Stale self-parent: core head no longer matches the hashgraph")]
    StaleSelfParent,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Consensus invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Empty signature")]
    EmptySignature,
    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("Failed to sign message: {0}")]
    FailedToSignMessage(#[from] alloy_signer::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Peer {0} is unreachable")]
    PeerUnreachable(String),
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("No peer available to gossip with")]
    NoPeers,

    #[error("Join rejected: {0}")]
    JoinRejected(String),
    #[error("Join request was not confirmed in time")]
    JoinTimeout,
    #[error("Leave rejected: {0}")]
    LeaveRejected(String),
    #[error("Leave request was not committed in time")]
    LeaveTimeout,
    #[error("A membership change is already in flight")]
    MembershipChangeInProgress,

    #[error("Store error: {0}")]
    Store(String),
    #[error("Application proxy error: {0}")]
    Proxy(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: NodeState, to: NodeState },
    #[error("Operation not allowed in state {0}")]
    InvalidState(NodeState),
    #[error("Invalid node configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to get current time")]
    FailedToGetCurrentTime(#[from] std::time::SystemTimeError),
}

impl ConsensusError {
    /// Errors caused by a bad event: the event is dropped, the node carries on.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConsensusError::MismatchedLength { .. }
                | ConsensusError::MalformedEvent(_)
                | ConsensusError::InvalidEventSignature
                | ConsensusError::UnknownCreator(_)
                | ConsensusError::DanglingParent { .. }
                | ConsensusError::InvalidSelfParent { .. }
                | ConsensusError::InvalidIndex { .. }
                | ConsensusError::EmptySignature
                | ConsensusError::InvalidSignature(_)
                | ConsensusError::Decode(_)
        )
    }

    /// Errors after which the node must stop advancing consensus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvariantViolation(_) | ConsensusError::Store(_)
        )
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ConsensusError::PeerUnreachable(_)
                | ConsensusError::Timeout(_)
                | ConsensusError::Transport(_)
        )
    }
}
