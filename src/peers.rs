//! Membership of a consensus network.
//!
//! A [`PeerSet`] is an immutable snapshot of the participants. Membership
//! changes never mutate a set: [`PeerSet::with_new_peer`] and
//! [`PeerSet::with_removed_peer`] build a new one, and the hashgraph scopes
//! each set to the round from which it applies. The set's [`PeerSet::hash`]
//! identifies a membership version.

use std::{collections::HashMap, fmt};

use crate::utils::{hash_pair, peer_id, short_hex, super_majority, trust_count};

pub use crate::protos::hashgraph::v1::Peer;

impl Peer {
    pub fn new(pub_key: Vec<u8>, net_addr: impl Into<String>, moniker: impl Into<String>) -> Self {
        Self {
            pub_key,
            net_addr: net_addr.into(),
            moniker: moniker.into(),
        }
    }

    /// Numeric identifier derived from the public key.
    pub fn id(&self) -> u32 {
        peer_id(&self.pub_key)
    }

    pub fn pub_key_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.pub_key))
    }
}

#[derive(Clone)]
pub struct PeerSet {
    peers: Vec<Peer>,
    by_pub_key: HashMap<Vec<u8>, usize>,
    by_id: HashMap<u32, usize>,
    hash: [u8; 32],
    super_majority: usize,
    trust_count: usize,
}

impl PeerSet {
    /// Build a set from an ordered list of peers. A public key listed twice
    /// keeps its first position.
    pub fn new(peers: Vec<Peer>) -> Self {
        let mut unique = Vec::with_capacity(peers.len());
        let mut by_pub_key = HashMap::new();
        let mut by_id = HashMap::new();
        for peer in peers {
            if by_pub_key.contains_key(&peer.pub_key) {
                continue;
            }
            by_pub_key.insert(peer.pub_key.clone(), unique.len());
            by_id.insert(peer.id(), unique.len());
            unique.push(peer);
        }

        let hash = unique
            .iter()
            .fold([0u8; 32], |acc, peer| hash_pair(&acc, &peer.pub_key));
        let n = unique.len();

        Self {
            peers: unique,
            by_pub_key,
            by_id,
            hash,
            super_majority: super_majority(n),
            trust_count: trust_count(n),
        }
    }

    pub fn with_new_peer(&self, peer: Peer) -> Self {
        let mut peers = self.peers.clone();
        peers.push(peer);
        Self::new(peers)
    }

    pub fn with_removed_peer(&self, pub_key: &[u8]) -> Self {
        let peers = self
            .peers
            .iter()
            .filter(|p| p.pub_key != pub_key)
            .cloned()
            .collect();
        Self::new(peers)
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn pub_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.peers.iter().map(|p| p.pub_key.as_slice())
    }

    pub fn ids(&self) -> Vec<u32> {
        self.peers.iter().map(Peer::id).collect()
    }

    pub fn by_pub_key(&self, pub_key: &[u8]) -> Option<&Peer> {
        self.by_pub_key.get(pub_key).map(|&i| &self.peers[i])
    }

    pub fn by_id(&self, id: u32) -> Option<&Peer> {
        self.by_id.get(&id).map(|&i| &self.peers[i])
    }

    pub fn contains(&self, pub_key: &[u8]) -> bool {
        self.by_pub_key.contains_key(pub_key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Identifies this membership version.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn super_majority(&self) -> usize {
        self.super_majority
    }

    pub fn trust_count(&self) -> usize {
        self.trust_count
    }
}

impl PartialEq for PeerSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for PeerSet {}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSet")
            .field("hash", &short_hex(&self.hash))
            .field(
                "peers",
                &self.peers.iter().map(|p| &p.moniker).collect::<Vec<_>>(),
            )
            .finish()
    }
}
