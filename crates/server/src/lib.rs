//! The gRPC surface of the log.
//!
//! [`LogService`] implements the four-method `log.v1.Log` service over
//! anything that can append and read records; both the plain [`Log`] and
//! the replicated [`DistributedLog`] qualify. An optional [`Authorizer`]
//! gates every call.

mod server;

use std::collections::HashSet;

use async_trait::async_trait;
use keelson_api::Record;
use keelson_commitlog::{DistributedLog, Error, Log};
use tonic::Status;

pub use server::{server, LogService};

pub const OBJECT_WILDCARD: &str = "*";
pub const PRODUCE_ACTION: &str = "produce";
pub const CONSUME_ACTION: &str = "consume";

/// What the service needs from a log.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> Result<u64, Error>;

    fn read(&self, offset: u64) -> Result<Record, Error>;
}

#[async_trait]
impl CommitLog for Log {
    async fn append(&self, record: Record) -> Result<u64, Error> {
        Log::append(self, record)
    }

    fn read(&self, offset: u64) -> Result<Record, Error> {
        Log::read(self, offset)
    }
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> Result<u64, Error> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> Result<Record, Error> {
        DistributedLog::read(self, offset)
    }
}

/// Access-control predicate consulted before every operation.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), Status>;
}

/// Table-driven [`Authorizer`]: a subject may perform an action on an
/// object only if an entry (or an object-wildcard entry) allows it.
#[derive(Clone, Debug, Default)]
pub struct Acl {
    rules: HashSet<(String, String, String)>,
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(
        mut self,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.rules
            .insert((subject.into(), object.into(), action.into()));
        self
    }
}

impl Authorizer for Acl {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), Status> {
        let exact = (subject.to_string(), object.to_string(), action.to_string());
        let wildcard = (
            subject.to_string(),
            OBJECT_WILDCARD.to_string(),
            action.to_string(),
        );
        if self.rules.contains(&exact) || self.rules.contains(&wildcard) {
            return Ok(());
        }
        Err(Status::permission_denied(format!(
            "{subject} not permitted to {action} to {object}"
        )))
    }
}

/// Map log errors onto their mandated wire statuses.
pub(crate) fn error_to_status(err: Error) -> Status {
    match err {
        Error::OffsetOutOfRange(offset) => keelson_api::OffsetOutOfRange { offset }.into(),
        Error::Raft(keelson_raft::Error::NotLeader { leader }) => {
            let mut status = Status::failed_precondition("node is not the leader");
            if let Some((_, addr)) = leader {
                if let Ok(value) = addr.parse() {
                    status.metadata_mut().insert("leader-addr", value);
                }
            }
            status
        }
        Error::Raft(keelson_raft::Error::Timeout) => {
            Status::deadline_exceeded("proposal did not commit in time")
        }
        err => Status::internal(err.to_string()),
    }
}
