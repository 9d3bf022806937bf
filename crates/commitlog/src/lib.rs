//! A durable, strictly ordered, offset-addressed commit log.
//!
//! The storage engine is built leaves first: a store holds length-prefixed
//! record payloads, an index maps relative offsets to store positions
//! through a memory map, a segment pairs one of each, and a [`Log`]
//! orchestrates an ordered set of segments with a single active tail.
//!
//! [`DistributedLog`] wraps a [`Log`] behind a consensus runtime so that
//! appends are replicated to a cluster before they are acknowledged, and
//! [`Replicator`] mirrors records from discovered peers when consensus is
//! not in play.

mod commitlog;
mod config;
mod distributed;
mod error;
mod index;
mod replicator;
mod segment;
mod store;

pub use crate::{
    commitlog::{Log, LogReader},
    config::{Config, SegmentConfig},
    distributed::{DistributedLog, RaftOptions, StreamLayer, RAFT_RPC},
    error::Error,
    replicator::Replicator,
};
