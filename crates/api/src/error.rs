use tonic::{Code, Status};

/// A consume addressed an offset that is not (or no longer) in the log.
///
/// Crosses the wire as [`Code::OutOfRange`], which keeps it distinguishable
/// from a generic `NotFound` so that tailing consumers can poll instead of
/// giving up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("offset out of range: {offset}")]
pub struct OffsetOutOfRange {
    pub offset: u64,
}

impl From<OffsetOutOfRange> for Status {
    fn from(err: OffsetOutOfRange) -> Self {
        Status::out_of_range(err.to_string())
    }
}

impl OffsetOutOfRange {
    /// Recover the typed error from a wire status, if that is what it carries.
    pub fn from_status(status: &Status) -> Option<Self> {
        if status.code() != Code::OutOfRange {
            return None;
        }
        let offset = status
            .message()
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())?;
        Some(Self { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let err = OffsetOutOfRange { offset: 42 };
        let status = Status::from(err);
        assert_eq!(status.code(), Code::OutOfRange);
        assert_eq!(OffsetOutOfRange::from_status(&status), Some(err));
    }

    #[test]
    fn from_status_rejects_other_codes() {
        let status = Status::not_found("offset out of range: 7");
        assert_eq!(OffsetOutOfRange::from_status(&status), None);
    }
}
