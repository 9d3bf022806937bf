use std::{fmt, io};

use crate::{snapshot::SnapshotSink, Error, LogEntry};

/// The replicated state machine driven by the runtime.
///
/// `apply` is invoked exactly once per committed entry, in index order, on
/// every voter. The response of the node that proposed the entry is routed
/// back to the caller of [`crate::Raft::apply`]; implementations that can
/// fail return their error as the response value.
pub trait Fsm: Send + 'static {
    type Response: fmt::Debug + Send + 'static;

    fn apply(&mut self, entry: &LogEntry) -> Self::Response;

    /// Capture the current state for shipping to lagging followers.
    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>, Error>;

    /// Replace the current state with the contents of a snapshot.
    fn restore(&mut self, reader: Box<dyn io::Read + Send>) -> Result<(), Error>;
}

/// A point-in-time capture of an [`Fsm`]'s state.
pub trait FsmSnapshot: Send {
    /// Stream the captured state into `sink`. The runtime closes or cancels
    /// the sink depending on the outcome.
    fn persist(&mut self, sink: &mut dyn SnapshotSink) -> Result<(), Error>;

    /// Called once the runtime is done with the capture.
    fn release(&mut self) {}
}
