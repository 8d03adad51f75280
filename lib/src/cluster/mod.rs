//! Cluster membership (C2) and its gossip transport (C3).
//!
//! `ClusterState` is the pure, backend-agnostic membership table: it knows
//! nothing about gossip wire formats. `gossip::GossipSyncer` is the bridge
//! that keeps it in sync with a `chitchat` cluster, translating chitchat's
//! key/value anti-entropy events into the join/up/down/expired/left
//! lifecycle callbacks the rest of the crate depends on.

pub mod gossip;
pub mod node;

pub use gossip::GossipSyncer;
pub use node::{ClusterState, Node, NodeId, NodeStatus};
