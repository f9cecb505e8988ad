//! The event DAG and everything derived from its structure.
//!
//! Events live in an arena keyed by [`EventHash`]. Each creator's events form
//! a chain indexed by sequence number, and every event carries the highest
//! index it knows of every creator (`last_ancestors`), which turns "x sees y"
//! into a single map lookup. Rounds and witnesses are computed on insertion;
//! fame, round-received and blocks are computed by
//! [`Hashgraph::run_consensus`].
//!
//! A round's peer set is final only once every round that could still
//! schedule a change for it is decided. An event whose round would depend on
//! a peer set that is not final yet is inserted without a round and stays
//! pending until consensus catches up, so the rounds an event gets never
//! depend on when it arrived.
//!
//! A hashgraph can also start from a [`Frame`]: a cut of another node's
//! hashgraph at its last decided round. Events below the cut are replaced by
//! one root per creator, which stands in for the creator's last event before
//! the cut.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tracing::debug;

use crate::{
    block::frame_signer,
    error::ConsensusError,
    event::{Event, EventHash},
    peers::PeerSet,
    protos::hashgraph::v1::{Frame, FrameEvent, PeerSetEntry, Root},
    utils::{current_timestamp, short_hex},
};

/// Every this many rounds of voting, undecided voters flip a coin.
pub const COIN_ROUND_FREQUENCY: i64 = 10;
/// Rounds between the round a membership change is decided in and the round
/// its peer set applies from.
pub const PEER_SET_ACTIVATION_DELAY: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fame {
    Undecided,
    Famous,
    NotFamous,
}

#[derive(Debug, Clone, Default)]
pub struct RoundInfo {
    pub(crate) events: Vec<EventHash>,
    pub(crate) witnesses: Vec<EventHash>,
    pub(crate) fame: HashMap<EventHash, Fame>,
    pub(crate) decided: bool,
}

impl RoundInfo {
    fn new(decided: bool) -> Self {
        Self {
            decided,
            ..Default::default()
        }
    }

    fn add_event(&mut self, hash: EventHash, witness: bool) {
        self.events.push(hash);
        if witness {
            self.witnesses.push(hash);
            // A witness showing up after its round was decided cannot be famous.
            let fame = if self.decided {
                Fame::NotFamous
            } else {
                Fame::Undecided
            };
            self.fame.insert(hash, fame);
        }
    }

    pub fn events(&self) -> &[EventHash] {
        &self.events
    }

    pub fn witnesses(&self) -> &[EventHash] {
        &self.witnesses
    }

    pub fn fame(&self, witness: &EventHash) -> Option<Fame> {
        self.fame.get(witness).copied()
    }

    pub fn famous_witnesses(&self) -> Vec<EventHash> {
        self.witnesses
            .iter()
            .filter(|w| self.fame.get(w) == Some(&Fame::Famous))
            .copied()
            .collect()
    }

    pub fn all_witnesses_decided(&self) -> bool {
        self.fame.values().all(|fame| *fame != Fame::Undecided)
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }
}

pub struct Hashgraph {
    pub(crate) events: HashMap<EventHash, Event>,
    /// Per creator, event hashes ordered by index, starting after the root.
    pub(crate) chains: HashMap<Vec<u8>, Vec<EventHash>>,
    pub(crate) roots: HashMap<Vec<u8>, Root>,
    pub(crate) root_creators: HashMap<EventHash, Vec<u8>>,
    pub(crate) rounds: BTreeMap<i64, RoundInfo>,
    pub(crate) peer_sets: BTreeMap<i64, Arc<PeerSet>>,
    /// Memoized votes per candidate, then per voter. Dropped once the
    /// candidate's fame is decided.
    pub(crate) votes: HashMap<EventHash, HashMap<EventHash, bool>>,
    pub(crate) undetermined: Vec<EventHash>,
    /// Events waiting for a final peer set, in insertion order.
    pub(crate) pending: Vec<EventHash>,
    pub(crate) topological: Vec<EventHash>,
    pub(crate) consensus_events: Vec<EventHash>,
    pub(crate) last_consensus_round: Option<i64>,
    pub(crate) first_consensus_round: Option<i64>,
    pub(crate) last_block_index: i64,
}

impl Hashgraph {
    /// Empty hashgraph whose genesis peer set applies from round 0.
    pub fn new(genesis: PeerSet) -> Self {
        let mut peer_sets = BTreeMap::new();
        peer_sets.insert(0, Arc::new(genesis));
        Self::with_peer_sets(peer_sets)
    }

    fn with_peer_sets(peer_sets: BTreeMap<i64, Arc<PeerSet>>) -> Self {
        Self {
            events: HashMap::new(),
            chains: HashMap::new(),
            roots: HashMap::new(),
            root_creators: HashMap::new(),
            rounds: BTreeMap::new(),
            peer_sets,
            votes: HashMap::new(),
            undetermined: Vec::new(),
            pending: Vec::new(),
            topological: Vec::new(),
            consensus_events: Vec::new(),
            last_consensus_round: None,
            first_consensus_round: None,
            last_block_index: -1,
        }
    }

    /// Validate and insert an event received from anyone, including ourselves.
    pub fn insert_event(&mut self, event: Event) -> Result<EventHash, ConsensusError> {
        let hash = event.hash();
        if self.events.contains_key(&hash) {
            return Err(ConsensusError::EventAlreadyExists(hash));
        }
        if !event.verify()? {
            return Err(ConsensusError::InvalidEventSignature);
        }
        if !self.is_known_creator(event.creator()) {
            return Err(ConsensusError::UnknownCreator(short_hex(event.creator())));
        }
        self.check_self_parent(&event)?;
        if let Some(other_parent) = event.other_parent()
            && !self.contains(&other_parent)
        {
            return Err(ConsensusError::DanglingParent {
                event: hash,
                parent: other_parent,
            });
        }

        self.insert_unchecked(event, None)
    }

    fn check_self_parent(&self, event: &Event) -> Result<(), ConsensusError> {
        let creator = event.creator();
        let fork = || ConsensusError::Equivocation {
            creator: short_hex(creator),
            event: event.hash(),
            self_parent: event.self_parent(),
        };

        match (event.self_parent(), self.last_event_of(creator)) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(fork()),
            (Some(parent), Some((last, last_index))) if parent == last => {
                if event.index() == last_index + 1 {
                    Ok(())
                } else {
                    Err(ConsensusError::InvalidIndex {
                        expected: last_index + 1,
                        actual: event.index(),
                    })
                }
            }
            (Some(parent), _) => {
                if let Some(existing) = self.events.get(&parent) {
                    if existing.creator() != creator {
                        return Err(ConsensusError::InvalidSelfParent {
                            event: event.hash(),
                            parent,
                        });
                    }
                    return Err(fork());
                }
                if self.root_creators.get(&parent).map(Vec::as_slice) == Some(creator) {
                    return Err(fork());
                }
                Err(ConsensusError::DanglingParent {
                    event: event.hash(),
                    parent,
                })
            }
        }
    }

    /// Insert without validation. `trusted_round` is used for events coming
    /// from a frame, whose rounds cannot be recomputed locally.
    fn insert_unchecked(
        &mut self,
        mut event: Event,
        trusted_round: Option<i64>,
    ) -> Result<EventHash, ConsensusError> {
        let hash = event.hash();

        let mut last_ancestors: HashMap<Vec<u8>, i64> = HashMap::new();
        for parent in [event.self_parent(), event.other_parent()].into_iter().flatten() {
            if let Some(parent) = self.events.get(&parent) {
                for (creator, index) in &parent.last_ancestors {
                    let entry = last_ancestors.entry(creator.clone()).or_insert(*index);
                    *entry = (*entry).max(*index);
                }
            } else if let Some(creator) = self.root_creators.get(&parent)
                && let Some(root) = self.roots.get(creator)
            {
                let entry = last_ancestors.entry(creator.clone()).or_insert(root.index);
                *entry = (*entry).max(root.index);
            }
        }
        last_ancestors.insert(event.creator().to_vec(), event.index());
        event.last_ancestors = last_ancestors;
        event.topological_index = self.topological.len() as i64;

        let creator = event.creator().to_vec();
        let index = event.index();
        self.chains.entry(creator.clone()).or_default().push(hash);
        self.topological.push(hash);
        self.undetermined.push(hash);
        self.events.insert(hash, event);

        let round = match trusted_round {
            Some(round) => Some(round),
            None => self
                .events
                .get(&hash)
                .and_then(|event| self.compute_round(event)),
        };
        match round {
            Some(round) => self.assign_round(hash, round),
            None => self.pending.push(hash),
        }

        debug!(
            event = %hash,
            creator = %short_hex(&creator),
            index,
            round = ?round,
            "Inserted event"
        );
        Ok(hash)
    }

    /// Record the round and witness flag of an inserted event.
    fn assign_round(&mut self, hash: EventHash, round: i64) {
        let Some(witness) = self
            .events
            .get(&hash)
            .map(|event| self.compute_witness(event, round))
        else {
            return;
        };
        if let Some(event) = self.events.get_mut(&hash) {
            event.round = Some(round);
            event.witness = witness;
        }
        let decided = self.last_consensus_round.is_some_and(|last| round <= last);
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundInfo::new(decided))
            .add_event(hash, witness);
    }

    /// Give rounds to pending events whose peer sets became final. Parents
    /// precede their children in `pending`, so one pass is enough.
    pub(crate) fn assign_pending_rounds(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut assigned = 0;
        for hash in std::mem::take(&mut self.pending) {
            match self.events.get(&hash).and_then(|event| self.compute_round(event)) {
                Some(round) => {
                    self.assign_round(hash, round);
                    assigned += 1;
                }
                None => self.pending.push(hash),
            }
        }
        if assigned > 0 {
            debug!(assigned, pending = self.pending.len(), "Assigned pending rounds");
        }
    }

    /// Highest round whose peer set can no longer change. The next round to
    /// decide is `last + 1`, and what it decides applies
    /// `PEER_SET_ACTIVATION_DELAY` rounds later.
    fn round_horizon(&self) -> i64 {
        self.last_consensus_round.unwrap_or(-1) + PEER_SET_ACTIVATION_DELAY
    }

    /// `None` while the event or one of its ancestors sits above the horizon.
    fn compute_round(&self, event: &Event) -> Option<i64> {
        let mut parent_round = None;
        for parent in [event.self_parent(), event.other_parent()].into_iter().flatten() {
            parent_round = parent_round.max(Some(self.round_of(&parent)?));
        }
        let Some(parent_round) = parent_round else {
            return Some(0);
        };
        if parent_round >= self.round_horizon() {
            return None;
        }

        let peers = self.peer_set_for_round(parent_round);
        let Some(info) = self.rounds.get(&parent_round) else {
            return Some(parent_round);
        };
        let strongly_seen = info
            .witnesses
            .iter()
            .filter(|w| self.strongly_sees_event(event, w, &peers))
            .count();
        if strongly_seen >= peers.super_majority() {
            Some(parent_round + 1)
        } else {
            Some(parent_round)
        }
    }

    fn compute_witness(&self, event: &Event, round: i64) -> bool {
        if !self.peer_set_for_round(round).contains(event.creator()) {
            return false;
        }
        match event.self_parent() {
            None => true,
            Some(parent) => self.round_of(&parent).is_none_or(|r| r < round),
        }
    }

    /// Round of an event or a root. Pending events have none yet.
    pub fn round_of(&self, hash: &EventHash) -> Option<i64> {
        if let Some(event) = self.events.get(hash) {
            return event.round;
        }
        self.root_creators
            .get(hash)
            .and_then(|creator| self.roots.get(creator))
            .map(|root| root.round)
    }

    /// Whether `hash` is an event or a root.
    pub fn contains(&self, hash: &EventHash) -> bool {
        self.events.contains_key(hash) || self.root_creators.contains_key(hash)
    }

    pub fn event(&self, hash: &EventHash) -> Option<&Event> {
        self.events.get(hash)
    }

    /// The event by `creator` at sequence `index`, if present.
    pub fn event_at(&self, creator: &[u8], index: i64) -> Option<&Event> {
        let base = self.roots.get(creator).map_or(0, |root| root.index + 1);
        let offset = usize::try_from(index - base).ok()?;
        self.chains
            .get(creator)
            .and_then(|chain| chain.get(offset))
            .and_then(|hash| self.events.get(hash))
    }

    /// Hash and index of the creator's last event, falling back to its root.
    pub fn last_event_of(&self, creator: &[u8]) -> Option<(EventHash, i64)> {
        if let Some(last) = self.chains.get(creator).and_then(|chain| chain.last())
            && let Some(event) = self.events.get(last)
        {
            return Some((*last, event.index()));
        }
        let root = self.roots.get(creator)?;
        let hash = EventHash::from_slice(&root.hash).ok()?;
        Some((hash, root.index))
    }

    fn sees_event(x: &Event, y: &Event) -> bool {
        x.last_ancestor(y.creator())
            .is_some_and(|index| index >= y.index())
    }

    /// Whether `y` is an ancestor of `x` (or `x` itself).
    pub fn sees(&self, x: &EventHash, y: &EventHash) -> bool {
        match (self.events.get(x), self.events.get(y)) {
            (Some(x), Some(y)) => Self::sees_event(x, y),
            _ => false,
        }
    }

    fn strongly_sees_event(&self, x: &Event, y: &EventHash, peers: &PeerSet) -> bool {
        let Some(y) = self.events.get(y) else {
            return false;
        };
        let mut count = 0;
        for member in peers.pub_keys() {
            let Some(index) = x.last_ancestor(member) else {
                continue;
            };
            let ancestor = if member == x.creator() {
                x
            } else {
                match self.event_at(member, index) {
                    Some(event) => event,
                    None => continue,
                }
            };
            if Self::sees_event(ancestor, y) {
                count += 1;
                if count >= peers.super_majority() {
                    return true;
                }
            }
        }
        false
    }

    pub fn strongly_sees(&self, x: &EventHash, y: &EventHash, peers: &PeerSet) -> bool {
        self.events
            .get(x)
            .is_some_and(|x| self.strongly_sees_event(x, y, peers))
    }

    /// Peer set in effect at `round`.
    pub fn peer_set_for_round(&self, round: i64) -> Arc<PeerSet> {
        self.peer_sets
            .range(..=round)
            .next_back()
            .or_else(|| self.peer_sets.iter().next())
            .map(|(_, peers)| Arc::clone(peers))
            .unwrap_or_else(|| Arc::new(PeerSet::new(vec![])))
    }

    /// Most recent peer set, including one that is scheduled but not yet in effect.
    pub fn latest_peer_set(&self) -> Arc<PeerSet> {
        self.peer_sets
            .values()
            .next_back()
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::new(PeerSet::new(vec![])))
    }

    /// Everyone whose witnesses may still count: the peer set in effect at
    /// the next round to decide, plus every set scheduled after it.
    pub fn gossip_peer_set(&self) -> Arc<PeerSet> {
        let next = self.last_consensus_round.map_or(0, |last| last + 1);
        let current = self.peer_set_for_round(next);
        let mut peers = current.peers().to_vec();
        for scheduled in self.peer_sets.range(next + 1..).map(|(_, peers)| peers) {
            for peer in scheduled.peers() {
                if !peers.iter().any(|known| known.pub_key == peer.pub_key) {
                    peers.push(peer.clone());
                }
            }
        }
        if peers.len() == current.len() {
            current
        } else {
            Arc::new(PeerSet::new(peers))
        }
    }

    pub fn peer_sets(&self) -> &BTreeMap<i64, Arc<PeerSet>> {
        &self.peer_sets
    }

    pub fn is_known_creator(&self, creator: &[u8]) -> bool {
        self.peer_sets.values().any(|peers| peers.contains(creator))
    }

    /// A membership change is pending while a request sits in an undecided
    /// event or a decided change has not reached its effective round.
    pub fn has_pending_membership_change(&self) -> bool {
        let in_flight = self.undetermined.iter().any(|hash| {
            self.events
                .get(hash)
                .is_some_and(|event| !event.internal_transactions().is_empty())
        });
        let last = self.last_consensus_round.unwrap_or(-1);
        let scheduled = self.peer_sets.keys().skip(1).any(|round| *round > last);
        in_flight || scheduled
    }

    /// Whether undecided events still carry transactions.
    pub fn has_undetermined_payload(&self) -> bool {
        self.undetermined
            .iter()
            .any(|hash| self.events.get(hash).is_some_and(Event::has_payload))
    }

    /// Last index per known creator, roots included.
    pub fn known_events(&self) -> HashMap<Vec<u8>, i64> {
        let mut known: HashMap<Vec<u8>, i64> = self
            .roots
            .iter()
            .map(|(creator, root)| (creator.clone(), root.index))
            .collect();
        for creator in self.chains.keys() {
            if let Some((_, index)) = self.last_event_of(creator) {
                known.insert(creator.clone(), index);
            }
        }
        known
    }

    /// Events in insertion order; parents always precede children.
    pub fn topological_events(&self) -> impl Iterator<Item = &Event> {
        self.topological
            .iter()
            .filter_map(|hash| self.events.get(hash))
    }

    pub fn round(&self, round: i64) -> Option<&RoundInfo> {
        self.rounds.get(&round)
    }

    pub fn max_round(&self) -> Option<i64> {
        self.rounds.keys().next_back().copied()
    }

    pub fn last_consensus_round(&self) -> Option<i64> {
        self.last_consensus_round
    }

    pub fn first_consensus_round(&self) -> Option<i64> {
        self.first_consensus_round
    }

    pub fn last_block_index(&self) -> i64 {
        self.last_block_index
    }

    /// Events in consensus order.
    pub fn consensus_events(&self) -> &[EventHash] {
        &self.consensus_events
    }

    pub fn undetermined_events(&self) -> &[EventHash] {
        &self.undetermined
    }

    /// Events inserted without a round yet.
    pub fn pending_events(&self) -> &[EventHash] {
        &self.pending
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Cut this hashgraph at its last decided round.
    pub fn build_frame(&self) -> Result<Frame, ConsensusError> {
        let round = self
            .last_consensus_round
            .ok_or_else(|| ConsensusError::InvalidFrame("no decided round yet".to_string()))?;

        let mut creators: Vec<&Vec<u8>> = self.chains.keys().chain(self.roots.keys()).collect();
        creators.sort();
        creators.dedup();

        let mut roots = Vec::new();
        for creator in creators {
            let last_received = self.chains.get(creator).and_then(|chain| {
                chain
                    .iter()
                    .rev()
                    .filter_map(|hash| self.events.get(hash))
                    .find(|event| event.round_received.is_some())
            });
            match last_received {
                Some(event) => roots.push(Root {
                    creator: creator.clone(),
                    hash: event.hash().to_vec(),
                    index: event.index(),
                    round: event.round.unwrap_or_default(),
                }),
                None => {
                    if let Some(root) = self.roots.get(creator) {
                        roots.push(root.clone());
                    }
                }
            }
        }

        let events = self
            .topological_events()
            .filter(|event| event.round_received.is_none())
            .map(|event| FrameEvent {
                event: Some(event.to_wire()),
                round: event.round,
            })
            .collect();

        let peer_sets = self
            .peer_sets
            .iter()
            .map(|(round, peers)| PeerSetEntry {
                round: *round,
                peers: peers.peers().to_vec(),
            })
            .collect();

        Ok(Frame {
            round,
            roots,
            events,
            peer_sets,
            last_block_index: self.last_block_index,
            timestamp: current_timestamp()?,
        })
    }

    /// Build a hashgraph from a frame signed by `signature`, on behalf of the
    /// peer identified by `local_key`.
    pub fn from_frame(
        frame: &Frame,
        signature: &[u8],
        local_key: &[u8],
    ) -> Result<Self, ConsensusError> {
        let helper = frame_signer(frame, signature)?;
        let hg = Self::from_trusted_frame(frame)?;
        if !hg.peer_set_for_round(frame.round).contains(&helper) {
            return Err(ConsensusError::InvalidFrame(format!(
                "signed by non-member {}",
                short_hex(&helper)
            )));
        }
        if !hg.latest_peer_set().contains(local_key) {
            return Err(ConsensusError::InvalidFrame(
                "local peer is not a member of the frame's peer set".to_string(),
            ));
        }
        Ok(hg)
    }

    /// Install a frame whose origin is already established, such as one read
    /// back from our own store. Event signatures are still checked.
    pub fn from_trusted_frame(frame: &Frame) -> Result<Self, ConsensusError> {
        let peer_sets: BTreeMap<i64, Arc<PeerSet>> = frame
            .peer_sets
            .iter()
            .map(|entry| (entry.round, Arc::new(PeerSet::new(entry.peers.clone()))))
            .collect();
        if peer_sets.is_empty() {
            return Err(ConsensusError::InvalidFrame("no peer sets".to_string()));
        }

        let mut hg = Self::with_peer_sets(peer_sets);

        for root in &frame.roots {
            let hash = EventHash::from_slice(&root.hash)?;
            hg.root_creators.insert(hash, root.creator.clone());
            hg.roots.insert(root.creator.clone(), root.clone());
        }
        hg.last_consensus_round = Some(frame.round);
        hg.first_consensus_round = Some(frame.round);
        hg.last_block_index = frame.last_block_index;

        for frame_event in &frame.events {
            let wire = frame_event
                .event
                .clone()
                .ok_or_else(|| ConsensusError::InvalidFrame("empty frame event".to_string()))?;
            let event = Event::from_wire(wire)?;
            if !event.verify()? {
                return Err(ConsensusError::InvalidEventSignature);
            }
            let chained = match (event.self_parent(), hg.last_event_of(event.creator())) {
                (None, None) => true,
                (Some(parent), Some((last, last_index))) => {
                    parent == last && event.index() == last_index + 1
                }
                _ => false,
            };
            if !chained {
                return Err(ConsensusError::InvalidFrame(format!(
                    "event {} does not extend its creator's chain",
                    event.hash()
                )));
            }
            hg.insert_unchecked(event, frame_event.round)?;
        }

        let witnesses = hg
            .rounds
            .get(&frame.round)
            .map_or(0, |info| info.witnesses.len());
        let required = hg.peer_set_for_round(frame.round).super_majority();
        if witnesses < required {
            return Err(ConsensusError::InvalidFrame(format!(
                "round {} has {witnesses} witnesses, {required} required",
                frame.round
            )));
        }

        Ok(hg)
    }
}
