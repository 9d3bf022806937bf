use crate::{proto, Error};

/// What a replicated log entry carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// An opaque command destined for the state machine.
    Command,
    /// Appended by a fresh leader to commit entries from earlier terms.
    Noop,
    /// A membership change; the payload is an encoded `Configuration`.
    Configuration,
}

impl EntryKind {
    pub fn from_u32(kind: u32) -> Self {
        match kind {
            1 => Self::Noop,
            2 => Self::Configuration,
            _ => Self::Command,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Command => 0,
            Self::Noop => 1,
            Self::Configuration => 2,
        }
    }
}

/// A single entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl From<proto::Entry> for LogEntry {
    fn from(entry: proto::Entry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            kind: EntryKind::from_u32(entry.kind),
            data: entry.data,
        }
    }
}

impl From<LogEntry> for proto::Entry {
    fn from(entry: LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            kind: entry.kind.as_u32(),
            data: entry.data,
        }
    }
}

/// Durable storage for replicated log entries.
///
/// Indexes are dense and start at 1; `last_index` of 0 means the log is
/// empty. `delete_range` is used for compaction after a snapshot and, in
/// the rare conflicting-leader case, for discarding a suffix.
pub trait LogStore: Send + Sync + 'static {
    fn first_index(&self) -> Result<u64, Error>;

    fn last_index(&self) -> Result<u64, Error>;

    /// Fetch the entry at `index`, or [`Error::LogNotFound`] if it was
    /// compacted away or never written.
    fn get_log(&self, index: u64) -> Result<LogEntry, Error>;

    /// Append entries. Indexes are assigned by the caller and are
    /// guaranteed to continue the existing sequence.
    fn store_logs(&self, entries: &[LogEntry]) -> Result<(), Error>;

    /// Remove the entries between `min` and `max`, inclusive.
    fn delete_range(&self, min: u64, max: u64) -> Result<(), Error>;
}
