// Wire and hashing messages for the gossip hashgraph.
//
// Field tags are part of the hashing format: an event hash is the SHA-256 of
// `EventBody::encode_to_vec()`, so tags must never be renumbered.

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub net_addr: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub moniker: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TransactionType {
    Join = 0,
    Leave = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalTransactionBody {
    #[prost(enumeration = "TransactionType", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: ::core::option::Option<Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalTransaction {
    #[prost(message, optional, tag = "1")]
    pub body: ::core::option::Option<InternalTransactionBody>,
    /// Signature by the peer named in the body.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventBody {
    #[prost(bytes = "vec", tag = "1")]
    pub creator: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub self_parent: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub other_parent: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub transactions: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, repeated, tag = "5")]
    pub internal_transactions: ::prost::alloc::vec::Vec<InternalTransaction>,
    #[prost(int64, tag = "6")]
    pub index: i64,
    #[prost(uint64, tag = "7")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireEvent {
    #[prost(message, optional, tag = "1")]
    pub body: ::core::option::Option<EventBody>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Root {
    #[prost(bytes = "vec", tag = "1")]
    pub creator: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "3")]
    pub index: i64,
    #[prost(int64, tag = "4")]
    pub round: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrameEvent {
    #[prost(message, optional, tag = "1")]
    pub event: ::core::option::Option<WireEvent>,
    #[prost(int64, optional, tag = "2")]
    pub round: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerSetEntry {
    #[prost(int64, tag = "1")]
    pub round: i64,
    #[prost(message, repeated, tag = "2")]
    pub peers: ::prost::alloc::vec::Vec<Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    /// Last decided round of the helper when the frame was cut.
    #[prost(int64, tag = "1")]
    pub round: i64,
    #[prost(message, repeated, tag = "2")]
    pub roots: ::prost::alloc::vec::Vec<Root>,
    /// Undetermined events, in the helper's topological order.
    #[prost(message, repeated, tag = "3")]
    pub events: ::prost::alloc::vec::Vec<FrameEvent>,
    #[prost(message, repeated, tag = "4")]
    pub peer_sets: ::prost::alloc::vec::Vec<PeerSetEntry>,
    #[prost(int64, tag = "5")]
    pub last_block_index: i64,
    #[prost(uint64, tag = "6")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(map = "uint32, int64", tag = "2")]
    pub known: ::std::collections::HashMap<u32, i64>,
    #[prost(uint32, tag = "3")]
    pub sync_limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncResponse {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub events: ::prost::alloc::vec::Vec<WireEvent>,
    #[prost(map = "uint32, int64", tag = "3")]
    pub known: ::std::collections::HashMap<u32, i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EagerSyncRequest {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub events: ::prost::alloc::vec::Vec<WireEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EagerSyncResponse {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(bool, tag = "2")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FastForwardRequest {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FastForwardResponse {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(message, optional, tag = "2")]
    pub frame: ::core::option::Option<Frame>,
    #[prost(bytes = "vec", tag = "3")]
    pub snapshot: ::prost::alloc::vec::Vec<u8>,
    /// Helper's signature over the frame hash.
    #[prost(bytes = "vec", tag = "4")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRequest {
    #[prost(message, optional, tag = "1")]
    pub internal_transaction: ::core::option::Option<InternalTransaction>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResponse {
    #[prost(uint32, tag = "1")]
    pub from_id: u32,
    #[prost(bool, tag = "2")]
    pub accepted: bool,
    #[prost(int64, tag = "3")]
    pub accepted_round: i64,
    #[prost(message, repeated, tag = "4")]
    pub peers: ::prost::alloc::vec::Vec<Peer>,
    #[prost(string, tag = "5")]
    pub reason: ::prost::alloc::string::String,
    /// The responder could not take the request now; another attempt may succeed.
    #[prost(bool, tag = "6")]
    pub retry_later: bool,
}
