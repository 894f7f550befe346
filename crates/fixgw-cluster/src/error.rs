use fixgw_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node's vote item is missing from the store.
    #[error("Quorum misconfigured: vote item {key} is not defined")]
    QuorumMisconfigured { key: String },

    /// A replicated key is missing from the store.
    #[error("Replication output {0} is not defined")]
    UnknownOutput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
