use alloy_signer::SignerSync;
use prost::Message;

use crate::{
    error::ConsensusError,
    protos::hashgraph::v1::{Frame, InternalTransaction},
    utils::{hash_pair, recover_signer, sha256, sign_digest},
};

/// Outcome of a membership request, as decided by consensus.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalTransactionReceipt {
    pub transaction: InternalTransaction,
    pub accepted: bool,
    /// Round from which the new peer set applies, for accepted requests.
    pub effective_round: Option<i64>,
}

/// The ordered payload of one round-received.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub index: i64,
    pub round_received: i64,
    pub timestamp: u64,
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub receipts: Vec<InternalTransactionReceipt>,
    /// Hash of the peer set that decided the round.
    pub peer_set_hash: [u8; 32],
}

impl Block {
    pub fn hash(&self) -> [u8; 32] {
        let mut acc = hash_pair(&self.index.to_be_bytes(), &self.round_received.to_be_bytes());
        acc = hash_pair(&acc, &self.timestamp.to_be_bytes());
        for tx in &self.transactions {
            acc = hash_pair(&acc, &sha256(tx));
        }
        for receipt in &self.receipts {
            acc = hash_pair(&acc, &receipt.transaction.hash());
            acc = hash_pair(&acc, &[receipt.accepted as u8]);
        }
        hash_pair(&acc, &self.peer_set_hash)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.internal_transactions.is_empty()
    }
}

pub fn frame_hash(frame: &Frame) -> [u8; 32] {
    sha256(&frame.encode_to_vec())
}

pub fn sign_frame<S: SignerSync>(frame: &Frame, signer: &S) -> Result<Vec<u8>, ConsensusError> {
    sign_digest(signer, &frame_hash(frame))
}

/// Recover the key that signed `frame`.
pub fn frame_signer(frame: &Frame, signature: &[u8]) -> Result<Vec<u8>, ConsensusError> {
    recover_signer(signature, &frame_hash(frame))
}
