use std::io;

use thiserror::Error;

/// Errors produced by the log and its replicated wrapper.
#[derive(Debug, Error)]
pub enum Error {
    /// A read addressed an offset below the lowest or at/above the next
    /// offset of the log.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    /// The active segment is at capacity. Internal signal consumed by the
    /// log to trigger rollover; callers of [`crate::Log::append`] never
    /// observe it.
    #[error("segment has reached its maximum size")]
    SegmentMaxed,

    /// An index access went past the in-use prefix, or the index is full.
    #[error("end of file")]
    Eof,

    /// The configured index capacity cannot hold even one entry.
    #[error("index size {0} is below the minimum of one entry")]
    IndexTooSmall(u64),

    /// Stored bytes did not decode as a record.
    #[error("failed to decode record at offset {offset}")]
    Decode {
        offset: u64,
        #[source]
        source: prost::DecodeError,
    },

    /// A replicated command carried a request-type tag this version does
    /// not understand. The tag space is reserved for future commands.
    #[error("unknown request type: {0}")]
    UnknownRequestType(u8),

    #[error(transparent)]
    Raft(#[from] keelson_raft::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
