use std::collections::HashMap;

use async_trait::async_trait;
use keelson_api::{ConsumeRequest, LogClient, ProduceRequest};
use keelson_discovery::HandlerError;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Mirrors discovered peers into the local log.
///
/// For every peer that joins, a task opens a consume stream against the
/// peer from offset zero and produces each received record to the local
/// server. A peer leaving cancels its task; errors end the task, which is
/// restarted when membership reissues the join.
pub struct Replicator {
    local: LogClient<tonic::transport::Channel>,
    inner: Mutex<Inner>,
    close: CancellationToken,
}

struct Inner {
    servers: HashMap<String, CancellationToken>,
    closed: bool,
}

impl Replicator {
    /// `local` must point at this node's own RPC server; everything pulled
    /// from peers is produced through it.
    pub fn new(local: LogClient<tonic::transport::Channel>) -> Self {
        Self {
            local,
            inner: Mutex::new(Inner {
                servers: HashMap::new(),
                closed: false,
            }),
            close: CancellationToken::new(),
        }
    }

    /// Start replicating from the peer `name` at `addr`. A no-op if the
    /// peer is already being replicated or the replicator is closed.
    pub fn join(&self, name: &str, addr: &str) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.servers.contains_key(name) {
            return;
        }

        let cancel = self.close.child_token();
        inner.servers.insert(name.to_string(), cancel.clone());

        debug!(%name, %addr, "replicating peer");
        tokio::spawn(replicate(addr.to_string(), self.local.clone(), cancel));
    }

    /// Stop replicating from `name`.
    pub fn leave(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.servers.remove(name) {
            cancel.cancel();
        }
    }

    /// Stop every replication task. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.close.cancel();
    }
}

#[async_trait]
impl keelson_discovery::Handler for Replicator {
    async fn join(&self, name: &str, addr: &str) -> Result<(), HandlerError> {
        Replicator::join(self, name, addr);
        Ok(())
    }

    async fn leave(&self, name: &str) -> Result<(), HandlerError> {
        Replicator::leave(self, name);
        Ok(())
    }
}

async fn replicate(
    addr: String,
    mut local: LogClient<tonic::transport::Channel>,
    cancel: CancellationToken,
) {
    let mut client = match LogClient::connect(format!("http://{addr}")).await {
        Ok(client) => client,
        Err(e) => {
            error!(%addr, "failed to dial peer: {e}");
            return;
        }
    };

    let mut stream = match client.consume_stream(ConsumeRequest { offset: 0 }).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            error!(%addr, "failed to open consume stream: {status}");
            return;
        }
    };

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.message() => message,
        };
        let response = match message {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(%addr, "consume stream ended");
                return;
            }
            Err(status) => {
                error!(%addr, "failed to receive from peer: {status}");
                return;
            }
        };

        let request = ProduceRequest {
            record: response.record,
        };
        if let Err(status) = local.produce(request).await {
            error!(%addr, "failed to produce locally: {status}");
            return;
        }
    }
}
