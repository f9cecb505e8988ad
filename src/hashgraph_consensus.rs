use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info};

use crate::{
    block::{Block, InternalTransactionReceipt},
    error::ConsensusError,
    event::{Event, EventHash},
    hashgraph::{COIN_ROUND_FREQUENCY, Fame, Hashgraph, PEER_SET_ACTIVATION_DELAY},
    protos::hashgraph::v1::{InternalTransaction, TransactionType},
    utils::{median, short_hex, super_majority},
};

impl Hashgraph {
    /// Decide whatever can be decided and return the resulting blocks, in
    /// index order.
    ///
    /// Every decided round can release pending events into later rounds, and
    /// their witnesses may vote, so this runs until a pass decides nothing.
    pub fn run_consensus(&mut self) -> Result<Vec<Block>, ConsensusError> {
        let mut blocks = Vec::new();
        loop {
            let before = self.last_consensus_round;
            self.decide_fame()?;
            blocks.extend(self.decide_round_received()?);
            if self.last_consensus_round == before {
                return Ok(blocks);
            }
        }
    }

    /// Virtual voting on the fame of every undecided witness.
    pub(crate) fn decide_fame(&mut self) -> Result<(), ConsensusError> {
        let Some(max_round) = self.max_round() else {
            return Ok(());
        };
        let undecided_rounds: Vec<i64> = self
            .rounds
            .iter()
            .filter(|(_, info)| !info.decided)
            .map(|(round, _)| *round)
            .collect();

        for round in undecided_rounds {
            let candidates: Vec<EventHash> = self
                .rounds
                .get(&round)
                .map(|info| {
                    info.witnesses
                        .iter()
                        .filter(|w| info.fame(w) == Some(Fame::Undecided))
                        .copied()
                        .collect()
                })
                .unwrap_or_default();

            for candidate in candidates {
                self.vote_on(candidate, round, max_round)?;
            }
        }
        Ok(())
    }

    fn vote_on(
        &mut self,
        candidate: EventHash,
        round: i64,
        max_round: i64,
    ) -> Result<(), ConsensusError> {
        for voting_round in (round + 1)..=max_round {
            let diff = voting_round - round;
            let voters = self.witnesses_of(voting_round);
            let previous_witnesses = self.witnesses_of(voting_round - 1);
            let previous_peers = self.peer_set_for_round(voting_round - 1);

            for voter in voters {
                if self.vote(&voter, &candidate).is_some() {
                    continue;
                }

                if diff == 1 {
                    let vote = self.sees(&voter, &candidate);
                    self.record_vote(voter, candidate, vote);
                    continue;
                }

                let mut yays = 0;
                let mut nays = 0;
                for witness in &previous_witnesses {
                    if !self.strongly_sees(&voter, witness, &previous_peers) {
                        continue;
                    }
                    match self.vote(witness, &candidate) {
                        Some(true) => yays += 1,
                        Some(false) => nays += 1,
                        None => {
                            return Err(ConsensusError::InvariantViolation(format!(
                                "witness {witness} has no vote on {candidate}"
                            )));
                        }
                    }
                }
                let majority = yays >= nays;
                let tally = yays.max(nays);
                if tally > previous_peers.len() {
                    return Err(ConsensusError::InvariantViolation(format!(
                        "{tally} votes counted in round {} with {} peers",
                        voting_round - 1,
                        previous_peers.len()
                    )));
                }
                let super_majority = tally >= previous_peers.super_majority();

                if diff % COIN_ROUND_FREQUENCY != 0 {
                    self.record_vote(voter, candidate, majority);
                    if super_majority {
                        self.set_fame(round, candidate, majority);
                        return Ok(());
                    }
                } else {
                    let vote = if super_majority {
                        majority
                    } else {
                        self.events.get(&voter).is_some_and(Event::coin_bit)
                    };
                    self.record_vote(voter, candidate, vote);
                }
            }
        }
        Ok(())
    }

    fn witnesses_of(&self, round: i64) -> Vec<EventHash> {
        self.rounds
            .get(&round)
            .map(|info| info.witnesses.clone())
            .unwrap_or_default()
    }

    fn vote(&self, voter: &EventHash, candidate: &EventHash) -> Option<bool> {
        self.votes
            .get(candidate)
            .and_then(|votes| votes.get(voter))
            .copied()
    }

    fn record_vote(&mut self, voter: EventHash, candidate: EventHash, vote: bool) {
        self.votes.entry(candidate).or_default().insert(voter, vote);
    }

    fn set_fame(&mut self, round: i64, witness: EventHash, famous: bool) {
        self.votes.remove(&witness);
        if let Some(info) = self.rounds.get_mut(&round) {
            let fame = if famous { Fame::Famous } else { Fame::NotFamous };
            info.fame.insert(witness, fame);
            debug!(round, %witness, ?fame, "Decided fame");
        }
    }

    /// Decide rounds in order and assign round-received to the events they
    /// settle.
    pub(crate) fn decide_round_received(&mut self) -> Result<Vec<Block>, ConsensusError> {
        let mut blocks = Vec::new();
        loop {
            let next = match self.last_consensus_round {
                Some(last) => last + 1,
                None => match self.rounds.keys().next() {
                    Some(first) => *first,
                    None => break,
                },
            };
            let ready = self
                .rounds
                .get(&next)
                .is_some_and(|info| !info.witnesses.is_empty() && info.all_witnesses_decided());
            if !ready {
                break;
            }

            if let Some(info) = self.rounds.get_mut(&next) {
                info.decided = true;
            }
            self.last_consensus_round = Some(next);
            self.first_consensus_round.get_or_insert(next);

            if let Some(block) = self.process_decided_round(next)? {
                blocks.push(block);
            }
            self.assign_pending_rounds();
        }
        Ok(blocks)
    }

    fn process_decided_round(&mut self, round: i64) -> Result<Option<Block>, ConsensusError> {
        let famous = self
            .rounds
            .get(&round)
            .map(|info| info.famous_witnesses())
            .unwrap_or_default();
        let required = super_majority(famous.len());

        let mut received: Vec<(u64, EventHash)> = Vec::new();
        for hash in &self.undetermined {
            let Some(event) = self.events.get(hash) else {
                continue;
            };
            if event.round.is_none_or(|r| r >= round) {
                continue;
            }
            let seen_by = famous
                .iter()
                .filter(|w| self.sees(w, hash))
                .count();
            if seen_by >= required {
                received.push((self.consensus_timestamp(event, &famous), *hash));
            }
        }
        received.sort();

        for (timestamp, hash) in &received {
            if let Some(event) = self.events.get_mut(hash) {
                event.round_received = Some(round);
                event.consensus_timestamp = Some(*timestamp);
            }
            self.consensus_events.push(*hash);
        }
        let settled: HashSet<EventHash> = received.iter().map(|(_, hash)| *hash).collect();
        self.undetermined.retain(|hash| !settled.contains(hash));

        info!(
            round,
            famous = famous.len(),
            received = received.len(),
            "Round decided"
        );

        let mut transactions = Vec::new();
        let mut internal_transactions = Vec::new();
        for (_, hash) in &received {
            if let Some(event) = self.events.get(hash) {
                transactions.extend(event.transactions().iter().cloned());
                internal_transactions.extend(event.internal_transactions().iter().cloned());
            }
        }
        if transactions.is_empty() && internal_transactions.is_empty() {
            return Ok(None);
        }

        let receipts = self.apply_membership(round, &internal_transactions)?;
        self.last_block_index += 1;
        let block = Block {
            index: self.last_block_index,
            round_received: round,
            timestamp: received.last().map_or(0, |(timestamp, _)| *timestamp),
            transactions,
            internal_transactions,
            receipts,
            peer_set_hash: self.peer_set_for_round(round).hash(),
        };
        info!(
            index = block.index,
            round,
            transactions = block.transactions.len(),
            "Block created"
        );
        Ok(Some(block))
    }

    /// Median creation time at which the famous witnesses first learnt of `x`.
    fn consensus_timestamp(&self, x: &Event, famous: &[EventHash]) -> u64 {
        let mut timestamps = Vec::with_capacity(famous.len());
        for witness in famous {
            let Some(witness) = self.events.get(witness) else {
                continue;
            };
            if !self.sees(&witness.hash(), &x.hash()) {
                continue;
            }
            let mut earliest = witness;
            while let Some(parent) = earliest.self_parent()
                && let Some(parent) = self.events.get(&parent)
                && self.sees(&parent.hash(), &x.hash())
            {
                earliest = parent;
            }
            timestamps.push(earliest.timestamp());
        }
        median(timestamps).unwrap_or_else(|| x.timestamp())
    }

    /// Apply the membership requests decided in `round`, in order.
    fn apply_membership(
        &mut self,
        round: i64,
        transactions: &[InternalTransaction],
    ) -> Result<Vec<InternalTransactionReceipt>, ConsensusError> {
        let effective_round = round + PEER_SET_ACTIVATION_DELAY;
        let mut receipts = Vec::with_capacity(transactions.len());

        for tx in transactions {
            let latest = self.latest_peer_set();
            let signed = tx.verify().unwrap_or(false);
            let next = match (tx.transaction_type(), tx.peer()) {
                (Some(TransactionType::Join), Some(peer))
                    if signed && !latest.contains(&peer.pub_key) =>
                {
                    Some(latest.with_new_peer(peer.clone()))
                }
                // The last member leaves without consensus.
                (Some(TransactionType::Leave), Some(peer))
                    if signed && latest.contains(&peer.pub_key) && latest.len() > 1 =>
                {
                    Some(latest.with_removed_peer(&peer.pub_key))
                }
                _ => None,
            };

            let Some(next) = next else {
                info!(
                    round,
                    peer = %tx.peer().map(|p| short_hex(&p.pub_key)).unwrap_or_default(),
                    "Membership request rejected"
                );
                receipts.push(InternalTransactionReceipt {
                    transaction: tx.clone(),
                    accepted: false,
                    effective_round: None,
                });
                continue;
            };

            if let Some(max_round) = self.max_round()
                && max_round >= effective_round
            {
                return Err(ConsensusError::InvariantViolation(format!(
                    "peer set for round {effective_round} decided after round {max_round} was reached"
                )));
            }
            info!(
                round,
                effective_round,
                peers = next.len(),
                "Peer set scheduled"
            );
            self.peer_sets.insert(effective_round, Arc::new(next));
            receipts.push(InternalTransactionReceipt {
                transaction: tx.clone(),
                accepted: true,
                effective_round: Some(effective_round),
            });
        }
        Ok(receipts)
    }
}

#[cfg(test)]
mod tests {
    use alloy::signers::local::PrivateKeySigner;

    use super::*;
    use crate::{
        core::Core,
        peers::{Peer, PeerSet},
    };

    /// Each core in turn pulls from its neighbour, with a transaction queued
    /// so that every pull creates an event.
    fn ring(n: usize, steps: usize) -> Vec<Core> {
        let signers: Vec<_> = (0..n).map(|_| PrivateKeySigner::random()).collect();
        let peers = PeerSet::new(
            signers
                .iter()
                .enumerate()
                .map(|(i, s)| Peer::new(s.address().to_vec(), format!("inmem://{i}"), format!("n{i}")))
                .collect(),
        );
        let mut cores: Vec<Core> = signers
            .into_iter()
            .map(|signer| {
                let mut core = Core::new(signer, peers.clone());
                core.init().unwrap();
                core
            })
            .collect();

        for step in 0..steps {
            let a = step % n;
            let b = (a + 1) % n;
            let known = cores[a].known_events();
            let diff = cores[b].event_diff(&known, usize::MAX);
            cores[a].add_transactions(vec![step.to_le_bytes().to_vec()]);
            cores[a].sync(diff).unwrap();
            cores[a].run_consensus().unwrap();
        }
        cores
    }

    #[test]
    fn decided_witnesses_leave_no_votes_behind() {
        let cores = ring(4, 200);
        let hg = cores[0].hashgraph();
        assert!(hg.last_consensus_round().is_some());

        for candidate in hg.votes.keys() {
            let fame = hg
                .round_of(candidate)
                .and_then(|round| hg.rounds.get(&round))
                .and_then(|info| info.fame(candidate));
            assert_eq!(fame, Some(Fame::Undecided), "votes kept for {candidate}");
        }
    }

    #[test]
    fn rounds_stop_at_the_activation_horizon() {
        for core in ring(4, 200) {
            let hg = core.hashgraph();
            let horizon = hg.last_consensus_round().unwrap_or(-1) + PEER_SET_ACTIVATION_DELAY;
            assert!(hg.max_round() <= Some(horizon));
            for hash in hg.pending_events() {
                assert_eq!(hg.round_of(hash), None);
            }
        }
    }
}
