//! # fixgw-cluster
//!
//! Running several fixgw nodes together:
//! - [`Replicator`] pushes the keys a node owns to its peers over netfix
//! - [`QuorumElector`] decides which node is leader from replicated votes

mod backoff;
mod error;
pub mod quorum;
pub mod replication;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::ClusterError;
pub use quorum::{evaluate, Election, LeaderHandle, QuorumElector};
pub use replication::{PeerStatus, Replicator};
