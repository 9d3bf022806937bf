//! A library-shaped consensus runtime.
//!
//! Provides leader election, log replication, snapshot shipping, and
//! cluster reconfiguration over pluggable storage and transport:
//!
//! - [`LogStore`] holds the replicated entries themselves,
//! - [`StableStore`] the few values that must survive restarts,
//! - [`SnapshotStore`] finished state-machine captures,
//! - [`StreamLayer`] the peer-to-peer byte streams.
//!
//! The application supplies an [`Fsm`]; committed entries are applied to it
//! exactly once, in order, on every voter.

mod config;
mod error;
mod fsm;
mod log;
mod node;
mod snapshot;
mod stable;
mod transport;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/raft.v1.rs"));
}

pub type ServerId = String;
pub type ServerAddress = String;

pub use crate::{
    config::Config,
    error::Error,
    fsm::{Fsm, FsmSnapshot},
    log::{EntryKind, LogEntry, LogStore},
    node::{has_existing_state, Raft},
    snapshot::{FileSnapshotStore, SnapshotMeta, SnapshotServer, SnapshotSink, SnapshotStore},
    stable::{SledStore, StableStore},
    transport::{Connection, StreamLayer, TcpStreamLayer},
};
