/// Log configuration.
///
/// Zero values are replaced with defaults when the log is opened, so a
/// `Config::default()` is always valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub segment: SegmentConfig,
}

/// Sizing and placement of individual segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Bytes a segment's store may grow to before the log rolls over.
    ///
    /// Default: 1024.
    pub max_store_bytes: u64,
    /// Bytes a segment's index may grow to before the log rolls over.
    ///
    /// Default: 1024.
    pub max_index_bytes: u64,
    /// Offset the first segment starts at in an empty log.
    pub initial_offset: u64,
}

pub(crate) const DEFAULT_MAX_STORE_BYTES: u64 = 1024;
pub(crate) const DEFAULT_MAX_INDEX_BYTES: u64 = 1024;

impl Config {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.segment.max_store_bytes == 0 {
            self.segment.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.segment.max_index_bytes == 0 {
            self.segment.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        self
    }
}
