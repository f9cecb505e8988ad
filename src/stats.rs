use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::NodeState;

#[derive(Debug, Clone)]
pub struct NodeStats {
    pub state: NodeState,
    /// Highest round known locally.
    pub last_round: Option<i64>,
    pub last_consensus_round: Option<i64>,
    /// Index of the last block the application accepted.
    pub last_committed_block: i64,
    pub total_events: usize,
    pub undetermined_events: usize,
    pub consensus_events: usize,
    pub transaction_pool: usize,
    pub peers: usize,
    pub sync_requests: u64,
    pub sync_errors: u64,
}

/// Counters updated from gossip tasks.
#[derive(Debug, Default)]
pub(crate) struct SyncCounters {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl SyncCounters {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub(crate) fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
