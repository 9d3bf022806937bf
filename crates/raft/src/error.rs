use std::io;

use thiserror::Error;

use crate::{ServerAddress, ServerId};

#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires the leader; the current leader, when known,
    /// is carried so callers can redirect.
    #[error("node is not the leader")]
    NotLeader {
        leader: Option<(ServerId, ServerAddress)>,
    },

    /// The proposal did not commit within the caller's budget. Retryable.
    #[error("timed out waiting for the proposal to commit")]
    Timeout,

    /// The runtime has shut down (or is shutting down).
    #[error("raft runtime is shut down")]
    Shutdown,

    /// Bootstrap was attempted on a node that already has state.
    #[error("bootstrap only works on fresh nodes without prior state")]
    CantBootstrap,

    /// The requested entry has been compacted away or never existed.
    #[error("log entry {0} not found")]
    LogNotFound(u64),

    /// No snapshot is available to ship or restore from.
    #[error("no snapshot available")]
    NoSnapshot,

    /// Failure in one of the pluggable storage backends.
    #[error("storage: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

impl Error {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }
}
