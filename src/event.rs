use std::{collections::HashMap, fmt};

use alloy_signer::SignerSync;
use prost::Message;

use crate::{
    error::ConsensusError,
    peers::Peer,
    protos::hashgraph::v1::{
        EventBody, InternalTransaction, InternalTransactionBody, TransactionType, WireEvent,
    },
    utils::{recover_signer, sha256, short_hex, sign_digest, verify_signature},
};

/// Length of a creator key (secp256k1 address).
pub const CREATOR_KEY_LEN: usize = 20;

/// SHA-256 of an encoded [`EventBody`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventHash(pub [u8; 32]);

impl EventHash {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConsensusError::MismatchedLength {
                expect: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", short_hex(&self.0))
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({})", short_hex(&self.0))
    }
}

/// A signed vertex of the hashgraph.
///
/// The body and signature are immutable. The remaining fields are assigned
/// by the local hashgraph once, as the event is inserted and as consensus
/// progresses.
#[derive(Clone, Debug)]
pub struct Event {
    body: EventBody,
    signature: Vec<u8>,
    hash: EventHash,
    self_parent: Option<EventHash>,
    other_parent: Option<EventHash>,

    pub(crate) topological_index: i64,
    pub(crate) last_ancestors: HashMap<Vec<u8>, i64>,
    pub(crate) round: Option<i64>,
    pub(crate) witness: bool,
    pub(crate) round_received: Option<i64>,
    pub(crate) consensus_timestamp: Option<u64>,
}

impl Event {
    /// Sign `body` and build the event.
    pub fn sign<S: SignerSync>(body: EventBody, signer: &S) -> Result<Self, ConsensusError> {
        let hash = EventHash(sha256(&body.encode_to_vec()));
        let signature = sign_digest(signer, &hash.0)?;
        Self::from_parts(body, signature, hash)
    }

    /// Parse an event received from a peer. The signature is not checked
    /// here; see [`Event::verify`].
    pub fn from_wire(wire: WireEvent) -> Result<Self, ConsensusError> {
        let body = wire
            .body
            .ok_or_else(|| ConsensusError::MalformedEvent("missing body".to_string()))?;
        let hash = EventHash(sha256(&body.encode_to_vec()));
        Self::from_parts(body, wire.signature, hash)
    }

    fn from_parts(
        body: EventBody,
        signature: Vec<u8>,
        hash: EventHash,
    ) -> Result<Self, ConsensusError> {
        if body.creator.len() != CREATOR_KEY_LEN {
            return Err(ConsensusError::MismatchedLength {
                expect: CREATOR_KEY_LEN,
                actual: body.creator.len(),
            });
        }
        if body.index < 0 {
            return Err(ConsensusError::MalformedEvent(format!(
                "negative index {}",
                body.index
            )));
        }
        let self_parent = body
            .self_parent
            .as_deref()
            .map(EventHash::from_slice)
            .transpose()?;
        let other_parent = body
            .other_parent
            .as_deref()
            .map(EventHash::from_slice)
            .transpose()?;
        if self_parent.is_none() && body.index != 0 {
            return Err(ConsensusError::InvalidIndex {
                expected: 0,
                actual: body.index,
            });
        }

        Ok(Self {
            body,
            signature,
            hash,
            self_parent,
            other_parent,
            topological_index: -1,
            last_ancestors: HashMap::new(),
            round: None,
            witness: false,
            round_received: None,
            consensus_timestamp: None,
        })
    }

    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            body: Some(self.body.clone()),
            signature: self.signature.clone(),
        }
    }

    /// Check that the signature recovers to the creator.
    pub fn verify(&self) -> Result<bool, ConsensusError> {
        verify_signature(&self.signature, &self.body.creator, &self.hash.0)
    }

    /// Coin-round vote: lowest bit of the last byte of `s`.
    pub fn coin_bit(&self) -> bool {
        self.signature.get(63).is_some_and(|byte| byte & 1 == 1)
    }

    pub fn hash(&self) -> EventHash {
        self.hash
    }

    pub fn body(&self) -> &EventBody {
        &self.body
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn creator(&self) -> &[u8] {
        &self.body.creator
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn timestamp(&self) -> u64 {
        self.body.timestamp
    }

    pub fn self_parent(&self) -> Option<EventHash> {
        self.self_parent
    }

    pub fn other_parent(&self) -> Option<EventHash> {
        self.other_parent
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.body.internal_transactions
    }

    pub fn has_payload(&self) -> bool {
        !self.body.transactions.is_empty() || !self.body.internal_transactions.is_empty()
    }

    pub fn round(&self) -> Option<i64> {
        self.round
    }

    pub fn is_witness(&self) -> bool {
        self.witness
    }

    pub fn round_received(&self) -> Option<i64> {
        self.round_received
    }

    pub fn consensus_timestamp(&self) -> Option<u64> {
        self.consensus_timestamp
    }

    pub fn topological_index(&self) -> i64 {
        self.topological_index
    }

    /// Highest index of `creator`'s events among this event's ancestors.
    pub fn last_ancestor(&self, creator: &[u8]) -> Option<i64> {
        self.last_ancestors.get(creator).copied()
    }
}

impl InternalTransaction {
    pub fn join<S: SignerSync>(peer: Peer, signer: &S) -> Result<Self, ConsensusError> {
        Self::signed(TransactionType::Join, peer, signer)
    }

    pub fn leave<S: SignerSync>(peer: Peer, signer: &S) -> Result<Self, ConsensusError> {
        Self::signed(TransactionType::Leave, peer, signer)
    }

    fn signed<S: SignerSync>(
        kind: TransactionType,
        peer: Peer,
        signer: &S,
    ) -> Result<Self, ConsensusError> {
        let body = InternalTransactionBody {
            kind: kind as i32,
            peer: Some(peer),
        };
        let signature = sign_digest(signer, &sha256(&body.encode_to_vec()))?;
        Ok(Self {
            body: Some(body),
            signature,
        })
    }

    pub fn transaction_type(&self) -> Option<TransactionType> {
        self.body
            .as_ref()
            .and_then(|body| TransactionType::try_from(body.kind).ok())
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.body.as_ref().and_then(|body| body.peer.as_ref())
    }

    /// Identity used to match a request with its outcome.
    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.encode_to_vec())
    }

    /// The transaction must be signed by the peer it names.
    pub fn verify(&self) -> Result<bool, ConsensusError> {
        let (Some(body), Some(peer)) = (self.body.as_ref(), self.peer()) else {
            return Ok(false);
        };
        let signer = recover_signer(&self.signature, &sha256(&body.encode_to_vec()))?;
        Ok(signer == peer.pub_key)
    }
}
