use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::stream::BoxStream;
use tokio::sync::RwLock;

use crate::{
    block::Block,
    error::ConsensusError,
    event::{Event, EventHash},
    peers::PeerSet,
    protos::hashgraph::v1::Frame,
};

/// Page size used when streaming events.
const STREAM_PAGE: usize = 256;

#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_event(&self, hash: &EventHash) -> Result<Option<Event>, ConsensusError>;

    /// Persist an event under its topological index.
    async fn set_event(&self, event: Event) -> Result<(), ConsensusError>;

    async fn participant_event(
        &self,
        creator: &[u8],
        index: i64,
    ) -> Result<Option<EventHash>, ConsensusError>;

    /// Up to `limit` events with topological index `>= from`, in order.
    async fn topological_events(
        &self,
        from: i64,
        limit: usize,
    ) -> Result<Vec<Event>, ConsensusError>;

    async fn get_block(&self, index: i64) -> Result<Option<Block>, ConsensusError>;

    async fn set_block(&self, block: Block) -> Result<(), ConsensusError>;

    /// Index of the last persisted block, -1 if none.
    async fn last_block_index(&self) -> Result<i64, ConsensusError>;

    async fn set_peer_set(&self, round: i64, peers: PeerSet) -> Result<(), ConsensusError>;

    async fn peer_sets(&self) -> Result<BTreeMap<i64, PeerSet>, ConsensusError>;

    async fn set_last_consensus_round(&self, round: i64) -> Result<(), ConsensusError>;

    async fn last_consensus_round(&self) -> Result<Option<i64>, ConsensusError>;

    /// Persist an installed frame. Events stored before it are discarded.
    async fn set_frame(&self, frame: Frame) -> Result<(), ConsensusError>;

    async fn frame(&self) -> Result<Option<Frame>, ConsensusError>;

    async fn close(&self) -> Result<(), ConsensusError>;

    /// Every persisted event, in topological order.
    fn stream_events(&self) -> BoxStream<'_, Result<Event, ConsensusError>> {
        Box::pin(async_stream::try_stream! {
            let mut from = 0;
            loop {
                let page = self.topological_events(from, STREAM_PAGE).await?;
                let Some(last) = page.last() else {
                    break;
                };
                from = last.topological_index() + 1;
                let done = page.len() < STREAM_PAGE;
                for event in page {
                    yield event;
                }
                if done {
                    break;
                }
            }
        })
    }
}

#[derive(Default)]
struct StoreState {
    events: BTreeMap<i64, Event>,
    by_hash: HashMap<EventHash, i64>,
    by_creator: HashMap<(Vec<u8>, i64), EventHash>,
    blocks: BTreeMap<i64, Block>,
    peer_sets: BTreeMap<i64, PeerSet>,
    last_consensus_round: Option<i64>,
    frame: Option<Frame>,
}

/// In-memory implementation of [`Store`].
#[derive(Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), ConsensusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsensusError::Store("store is closed".to_string()));
        }
        Ok(())
    }

    /// Reopen after [`Store::close`], keeping the contents.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn get_event(&self, hash: &EventHash) -> Result<Option<Event>, ConsensusError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state
            .by_hash
            .get(hash)
            .and_then(|index| state.events.get(index))
            .cloned())
    }

    async fn set_event(&self, event: Event) -> Result<(), ConsensusError> {
        self.ensure_open()?;
        let index = event.topological_index();
        if index < 0 {
            return Err(ConsensusError::Store(format!(
                "event {} has no topological index",
                event.hash()
            )));
        }
        let mut state = self.state.write().await;
        state.by_hash.insert(event.hash(), index);
        state
            .by_creator
            .insert((event.creator().to_vec(), event.index()), event.hash());
        state.events.insert(index, event);
        Ok(())
    }

    async fn participant_event(
        &self,
        creator: &[u8],
        index: i64,
    ) -> Result<Option<EventHash>, ConsensusError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.by_creator.get(&(creator.to_vec(), index)).copied())
    }

    async fn topological_events(
        &self,
        from: i64,
        limit: usize,
    ) -> Result<Vec<Event>, ConsensusError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state
            .events
            .range(from..)
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn get_block(&self, index: i64) -> Result<Option<Block>, ConsensusError> {
        self.ensure_open()?;
        Ok(self.state.read().await.blocks.get(&index).cloned())
    }

    async fn set_block(&self, block: Block) -> Result<(), ConsensusError> {
        self.ensure_open()?;
        self.state.write().await.blocks.insert(block.index, block);
        Ok(())
    }

    async fn last_block_index(&self) -> Result<i64, ConsensusError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.blocks.keys().next_back().copied().unwrap_or(-1))
    }

    async fn set_peer_set(&self, round: i64, peers: PeerSet) -> Result<(), ConsensusError> {
        self.ensure_open()?;
        self.state.write().await.peer_sets.insert(round, peers);
        Ok(())
    }

    async fn peer_sets(&self) -> Result<BTreeMap<i64, PeerSet>, ConsensusError> {
        self.ensure_open()?;
        Ok(self.state.read().await.peer_sets.clone())
    }

    async fn set_last_consensus_round(&self, round: i64) -> Result<(), ConsensusError> {
        self.ensure_open()?;
        self.state.write().await.last_consensus_round = Some(round);
        Ok(())
    }

    async fn last_consensus_round(&self) -> Result<Option<i64>, ConsensusError> {
        self.ensure_open()?;
        Ok(self.state.read().await.last_consensus_round)
    }

    async fn set_frame(&self, frame: Frame) -> Result<(), ConsensusError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state.events.clear();
        state.by_hash.clear();
        state.by_creator.clear();
        state.last_consensus_round = Some(frame.round);
        state.frame = Some(frame);
        Ok(())
    }

    async fn frame(&self) -> Result<Option<Frame>, ConsensusError> {
        self.ensure_open()?;
        Ok(self.state.read().await.frame.clone())
    }

    async fn close(&self) -> Result<(), ConsensusError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
