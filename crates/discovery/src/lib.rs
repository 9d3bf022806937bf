//! Cluster discovery over SWIM-style gossip.
//!
//! A [`Membership`] advertises this node to its peers and watches them come
//! and go. Join and leave observations for non-local members are delivered
//! to a [`Handler`], which is how the rest of the system learns about the
//! cluster without holding a reference back into discovery.

mod membership;

use async_trait::async_trait;

pub use membership::{Config, Member, MemberStatus, Membership};

/// Why a [`Handler`] callback could not do its work.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler forwards to a consensus runtime and this node is not
    /// the leader. Expected on followers; logged quietly.
    #[error("not the cluster leader")]
    NotLeader,

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Receiver of membership changes.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, name: &str, addr: &str) -> Result<(), HandlerError>;

    async fn leave(&self, name: &str) -> Result<(), HandlerError>;
}
