use std::time::Duration;

use crate::ServerId;

/// Runtime tuning for a single raft node.
///
/// The defaults suit a LAN cluster; tests shrink the timeouts to keep
/// elections fast.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this node within the cluster.
    pub local_id: ServerId,

    /// How long a follower waits without hearing from a leader before it
    /// starts an election. Randomized up to 2x per election round.
    pub heartbeat_timeout: Duration,

    /// How long a candidate waits for a quorum of votes before starting a
    /// new election round.
    pub election_timeout: Duration,

    /// How long a leader may go without contact from a quorum before it
    /// steps down.
    pub leader_lease_timeout: Duration,

    /// Interval between leader heartbeats (and therefore the upper bound
    /// on commit notification latency).
    pub commit_timeout: Duration,

    /// Maximum entries shipped per append round-trip.
    pub max_append_entries: usize,

    /// How often to check whether a snapshot is due.
    pub snapshot_interval: Duration,

    /// Outstanding applied entries before a snapshot is taken and the log
    /// compacted.
    pub snapshot_threshold: u64,
}

impl Config {
    pub fn new(local_id: impl Into<ServerId>) -> Self {
        Self {
            local_id: local_id.into(),
            heartbeat_timeout: Duration::from_secs(1),
            election_timeout: Duration::from_secs(1),
            leader_lease_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(50),
            max_append_entries: 64,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
        }
    }
}
