use std::collections::{HashMap, VecDeque};

use alloy::signers::local::PrivateKeySigner;
use tracing::{debug, warn};

use crate::{
    block::Block,
    error::ConsensusError,
    event::{Event, EventHash},
    hashgraph::Hashgraph,
    peers::{Peer, PeerSet},
    protos::hashgraph::v1::{EventBody, Frame, InternalTransaction, WireEvent},
    utils::{current_timestamp, peer_id},
};

/// Local view of the network: the hashgraph plus what this peer is about to
/// add to it.
///
/// `Core` is synchronous and owned by one node behind a lock. Events it
/// inserts and blocks it produces are queued until the node persists and
/// commits them.
pub struct Core {
    signer: PrivateKeySigner,
    pub_key: Vec<u8>,
    hg: Hashgraph,
    head: Option<EventHash>,
    seq: i64,
    transaction_pool: Vec<Vec<u8>>,
    internal_transaction_pool: Vec<InternalTransaction>,
    pending_blocks: VecDeque<Block>,
    unpersisted: Vec<Event>,
}

impl Core {
    pub fn new(signer: PrivateKeySigner, genesis: PeerSet) -> Self {
        let pub_key = signer.address().to_vec();
        Self {
            signer,
            pub_key,
            hg: Hashgraph::new(genesis),
            head: None,
            seq: -1,
            transaction_pool: Vec::new(),
            internal_transaction_pool: Vec::new(),
            pending_blocks: VecDeque::new(),
            unpersisted: Vec::new(),
        }
    }

    /// Create the genesis event if this peer is a founding member that has
    /// not created one yet.
    pub fn init(&mut self) -> Result<(), ConsensusError> {
        let is_founder = self.hg.peer_set_for_round(0).contains(&self.pub_key);
        if is_founder && self.head.is_none() && self.hg.last_event_of(&self.pub_key).is_none() {
            self.add_self_event(None)?;
        }
        Ok(())
    }

    pub fn id(&self) -> u32 {
        peer_id(&self.pub_key)
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    pub fn hashgraph(&self) -> &Hashgraph {
        &self.hg
    }

    pub fn head(&self) -> Option<EventHash> {
        self.head
    }

    /// Sign a new event on top of our head, carrying the pooled transactions.
    pub fn add_self_event(
        &mut self,
        other_parent: Option<EventHash>,
    ) -> Result<Event, ConsensusError> {
        let recorded = self.hg.last_event_of(&self.pub_key).map(|(hash, _)| hash);
        if recorded != self.head {
            return Err(ConsensusError::StaleSelfParent);
        }

        let body = EventBody {
            creator: self.pub_key.clone(),
            self_parent: self.head.map(|h| h.to_vec()),
            other_parent: other_parent.map(|h| h.to_vec()),
            transactions: std::mem::take(&mut self.transaction_pool),
            internal_transactions: std::mem::take(&mut self.internal_transaction_pool),
            index: self.seq + 1,
            timestamp: current_timestamp()?,
        };
        let event = match Event::sign(body.clone(), &self.signer) {
            Ok(event) => event,
            Err(err) => {
                self.restore_pools(body);
                return Err(err);
            }
        };

        match self.hg.insert_event(event) {
            Ok(hash) => {
                self.head = Some(hash);
                self.seq += 1;
                let event = self
                    .hg
                    .event(&hash)
                    .cloned()
                    .ok_or_else(|| ConsensusError::InvariantViolation(format!("{hash} vanished")))?;
                debug!(event = %hash, index = self.seq, "Created self event");
                self.unpersisted.push(event.clone());
                Ok(event)
            }
            Err(err) => {
                self.restore_pools(body);
                Err(err)
            }
        }
    }

    fn restore_pools(&mut self, body: EventBody) {
        let mut transactions = body.transactions;
        transactions.append(&mut self.transaction_pool);
        self.transaction_pool = transactions;

        let mut internal = body.internal_transactions;
        internal.append(&mut self.internal_transaction_pool);
        self.internal_transaction_pool = internal;
    }

    /// Insert one received event.
    pub fn insert_event(&mut self, event: Event) -> Result<EventHash, ConsensusError> {
        let hash = self.admit(event)?;
        if let Some(event) = self.hg.event(&hash) {
            self.unpersisted.push(event.clone());
        }
        Ok(hash)
    }

    /// A newcomer's events only validate once the join admitting it is
    /// decided, and the events deciding it may have arrived in the same
    /// batch. Consensus runs first in that case.
    fn admit(&mut self, event: Event) -> Result<EventHash, ConsensusError> {
        if !self.hg.is_known_creator(event.creator()) {
            self.run_consensus()?;
        }
        self.hg.insert_event(event)
    }

    /// Insert a batch received from a peer, in order. Returns the hash of the
    /// last event that was actually inserted.
    pub fn insert_batch(
        &mut self,
        events: Vec<WireEvent>,
    ) -> Result<Option<EventHash>, ConsensusError> {
        let mut last = None;
        for wire in events {
            let event = Event::from_wire(wire)?;
            match self.insert_event(event) {
                Ok(hash) => last = Some(hash),
                Err(ConsensusError::EventAlreadyExists(_)) => {}
                Err(err) => {
                    warn!(error = %err, "Rejected event from batch");
                    return Err(err);
                }
            }
        }
        Ok(last)
    }

    /// Insert a batch pulled from a peer, then record the sync with a new self
    /// event when there is anything worth recording. The last inserted event
    /// becomes the other-parent; with nothing new, the event only extends our
    /// own chain.
    pub fn sync(&mut self, events: Vec<WireEvent>) -> Result<Option<Event>, ConsensusError> {
        let inserted = self.insert_batch(events)?;
        if inserted.is_none() && !self.is_busy() {
            return Ok(None);
        }
        self.add_self_event(inserted).map(Some)
    }

    /// Last known index per creator ID.
    pub fn known_events(&self) -> HashMap<u32, i64> {
        self.hg
            .known_events()
            .into_iter()
            .map(|(creator, index)| (peer_id(&creator), index))
            .collect()
    }

    /// Events the owner of `known` lacks, parents first, at most `limit`.
    pub fn event_diff(&self, known: &HashMap<u32, i64>, limit: usize) -> Vec<WireEvent> {
        self.hg
            .topological_events()
            .filter(|event| {
                let seen = known.get(&peer_id(event.creator())).copied().unwrap_or(-1);
                event.index() > seen
            })
            .take(limit)
            .map(Event::to_wire)
            .collect()
    }

    /// Run consensus and queue the blocks it produced.
    pub fn run_consensus(&mut self) -> Result<usize, ConsensusError> {
        let blocks = self.hg.run_consensus()?;
        let produced = blocks.len();
        self.pending_blocks.extend(blocks);
        Ok(produced)
    }

    pub fn next_pending_block(&self) -> Option<&Block> {
        self.pending_blocks.front()
    }

    pub fn pop_pending_block(&mut self) -> Option<Block> {
        self.pending_blocks.pop_front()
    }

    /// Drop queued blocks up to `index`, already committed in an earlier life.
    pub fn skip_blocks_through(&mut self, index: i64) {
        while self
            .pending_blocks
            .front()
            .is_some_and(|block| block.index <= index)
        {
            self.pending_blocks.pop_front();
        }
    }

    pub fn take_unpersisted(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.unpersisted)
    }

    pub fn build_frame(&self) -> Result<Frame, ConsensusError> {
        self.hg.build_frame()
    }

    /// Replace the hashgraph with one installed from a frame.
    pub fn fast_forward(&mut self, hg: Hashgraph) {
        self.head = hg.last_event_of(&self.pub_key).map(|(hash, _)| hash);
        self.seq = hg.last_event_of(&self.pub_key).map_or(-1, |(_, index)| index);
        self.hg = hg;
        self.pending_blocks.clear();
        self.unpersisted.clear();
    }

    /// Rebuild state from events persisted in topological order.
    pub fn replay(&mut self, events: Vec<Event>) -> Result<(), ConsensusError> {
        for event in events {
            match self.admit(event) {
                Ok(_) | Err(ConsensusError::EventAlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if let Some((hash, index)) = self.hg.last_event_of(&self.pub_key) {
            self.head = Some(hash);
            self.seq = index;
        }
        Ok(())
    }

    pub fn add_transactions(&mut self, transactions: Vec<Vec<u8>>) {
        self.transaction_pool.extend(transactions);
    }

    /// Queue a membership request; only one may be in flight at a time.
    pub fn add_internal_transaction(
        &mut self,
        tx: InternalTransaction,
    ) -> Result<(), ConsensusError> {
        if self.has_pending_membership_change() {
            return Err(ConsensusError::MembershipChangeInProgress);
        }
        self.internal_transaction_pool.push(tx);
        Ok(())
    }

    pub fn has_pending_membership_change(&self) -> bool {
        !self.internal_transaction_pool.is_empty() || self.hg.has_pending_membership_change()
    }

    /// Whether consensus still has work that needs new events to finish.
    pub fn is_busy(&self) -> bool {
        !self.transaction_pool.is_empty()
            || self.has_pending_membership_change()
            || self.hg.has_undetermined_payload()
    }

    pub fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.len()
    }

    pub fn latest_peer_set(&self) -> std::sync::Arc<PeerSet> {
        self.hg.latest_peer_set()
    }

    pub fn local_peer(&self, net_addr: &str, moniker: &str) -> Peer {
        Peer::new(self.pub_key.clone(), net_addr, moniker)
    }
}
