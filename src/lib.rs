//! A leaderless, Byzantine-fault-tolerant consensus engine.
//!
//! Peers gossip about gossip: every sync between two peers is recorded as a
//! signed event that references the last event of each. The resulting DAG,
//! the hashgraph, carries enough information for every peer to run the same
//! virtual vote locally and reach the same total order of transactions,
//! without a leader and without extra consensus messages.
//!
//! ## How it works
//!
//! - [`hashgraph::Hashgraph`] stores events, assigns rounds and witnesses,
//!   decides witness fame and turns decided rounds into ordered
//!   [`block::Block`]s.
//! - [`core::Core`] wraps the hashgraph for one peer: it creates and signs
//!   that peer's events and queues produced blocks.
//! - [`node::Node`] drives a core over a [`transport::Transport`], persists to
//!   a [`store::Store`] and commits blocks to an [`proxy::AppProxy`]. It also
//!   handles membership: peers can join or leave while consensus runs, and
//!   late joiners fast-forward from a signed frame instead of replaying
//!   history.
//!
//! In-memory implementations of the transport, store and application are
//! provided for embedding and testing.

pub mod protos {
    pub mod hashgraph {
        pub mod v1 {
            include!("protos/hashgraph.v1.rs");
        }
    }
}

pub mod block;
pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod events;
pub mod hashgraph;
mod hashgraph_consensus;
pub mod node;
mod node_rpc;
pub mod peers;
pub mod proxy;
pub mod state;
pub mod stats;
pub mod store;
pub mod transport;
pub mod utils;
