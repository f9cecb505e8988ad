use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{block::Block, error::ConsensusError, utils::hash_pair};

#[derive(Debug, Clone, PartialEq)]
pub struct CommitResponse {
    pub state_hash: Vec<u8>,
}

/// The application a node feeds transactions from and commits blocks to.
#[async_trait::async_trait]
pub trait AppProxy: Send + Sync + 'static {
    /// Transactions submitted by the application. Can be taken once.
    fn submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    async fn commit_block(&self, block: Block) -> Result<CommitResponse, ConsensusError>;

    /// Application state as of the block at `block_index` (-1: initial state).
    async fn get_snapshot(&self, block_index: i64) -> Result<Vec<u8>, ConsensusError>;

    async fn restore(&self, snapshot: &[u8]) -> Result<(), ConsensusError>;
}

struct AppState {
    state_hash: [u8; 32],
    snapshots: BTreeMap<i64, [u8; 32]>,
    committed: Vec<Block>,
    failures_to_inject: usize,
}

/// Application whose state is a hash chain over committed transactions.
pub struct InmemAppProxy {
    submit_tx: mpsc::Sender<Vec<u8>>,
    submit_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state: Mutex<AppState>,
}

impl Default for InmemAppProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl InmemAppProxy {
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(1024);
        Self {
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            state: Mutex::new(AppState {
                state_hash: [0; 32],
                snapshots: BTreeMap::new(),
                committed: Vec::new(),
                failures_to_inject: 0,
            }),
        }
    }

    pub async fn submit_tx(&self, tx: Vec<u8>) -> Result<(), ConsensusError> {
        self.submit_tx
            .send(tx)
            .await
            .map_err(|_| ConsensusError::Proxy("submit channel closed".to_string()))
    }

    pub fn committed_blocks(&self) -> Vec<Block> {
        self.state.lock().committed.clone()
    }

    pub fn committed_transactions(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .committed
            .iter()
            .flat_map(|block| block.transactions.iter().cloned())
            .collect()
    }

    pub fn state_hash(&self) -> [u8; 32] {
        self.state.lock().state_hash
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().failures_to_inject = count;
    }
}

#[async_trait::async_trait]
impl AppProxy for InmemAppProxy {
    fn submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.submit_rx.lock().take()
    }

    async fn commit_block(&self, block: Block) -> Result<CommitResponse, ConsensusError> {
        let mut state = self.state.lock();
        if state.failures_to_inject > 0 {
            state.failures_to_inject -= 1;
            return Err(ConsensusError::Proxy(format!(
                "injected failure for block {}",
                block.index
            )));
        }
        if let Some(last) = state.committed.last()
            && block.index != last.index + 1
        {
            return Err(ConsensusError::Proxy(format!(
                "block {} out of order after {}",
                block.index, last.index
            )));
        }

        let mut hash = state.state_hash;
        for tx in &block.transactions {
            hash = hash_pair(&hash, tx);
        }
        state.state_hash = hash;
        state.snapshots.insert(block.index, hash);
        state.committed.push(block);
        Ok(CommitResponse {
            state_hash: hash.to_vec(),
        })
    }

    async fn get_snapshot(&self, block_index: i64) -> Result<Vec<u8>, ConsensusError> {
        let state = self.state.lock();
        if block_index < 0 {
            return Ok(vec![0; 32]);
        }
        state
            .snapshots
            .get(&block_index)
            .map(|hash| hash.to_vec())
            .ok_or_else(|| ConsensusError::Proxy(format!("no snapshot for block {block_index}")))
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<(), ConsensusError> {
        let hash: [u8; 32] = snapshot
            .try_into()
            .map_err(|_| ConsensusError::MismatchedLength {
                expect: 32,
                actual: snapshot.len(),
            })?;
        let mut state = self.state.lock();
        state.state_hash = hash;
        state.committed.clear();
        Ok(())
    }
}
