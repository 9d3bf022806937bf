use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context as _;
use keelson_commitlog::{DistributedLog, RaftOptions, StreamLayer};
use keelson_discovery::{Handler, Membership};
use keelson_server::{server, Acl, Authorizer, CommitLog, LogService};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::mux;

/// Everything a node needs to come up.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Unique name advertised through gossip and used as the raft id.
    pub node_name: String,
    /// Gossip bind address, `host:port`.
    pub bind_addr: String,
    /// Port of the multiplexed RPC listener, bound on the gossip host.
    pub rpc_port: u16,
    /// Gossip addresses of existing members, empty for the first node.
    pub start_join_addrs: Vec<String>,
    /// Form a fresh single-node cluster when no state exists on disk.
    pub bootstrap: bool,
    pub log: keelson_commitlog::Config,
    pub acl: Option<Acl>,
    pub server_tls: Option<Arc<rustls::ServerConfig>>,
    pub peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl Config {
    /// The RPC address other nodes dial: the gossip host paired with the
    /// RPC port.
    pub fn rpc_addr(&self) -> anyhow::Result<String> {
        let (host, _) = self
            .bind_addr
            .rsplit_once(':')
            .context("bind address must be host:port")?;
        Ok(format!("{host}:{}", self.rpc_port))
    }
}

/// A running node: multiplexed listener, replicated log, gRPC server, and
/// membership, shut down in that order.
pub struct Agent {
    rpc_addr: String,
    gossip_addr: String,
    log: Arc<DistributedLog>,
    membership: Membership,
    mux_cancel: CancellationToken,
    server_stop: Mutex<Option<oneshot::Sender<()>>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Agent {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.rpc_addr()?)
            .await
            .context("failed to bind the rpc listener")?;
        let rpc_addr = listener.local_addr()?.to_string();

        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (grpc_tx, grpc_rx) = mpsc::channel(64);
        let mux_cancel = CancellationToken::new();
        mux::spawn(
            listener,
            raft_tx,
            grpc_tx,
            config.server_tls.clone(),
            mux_cancel.clone(),
        );

        let layer = StreamLayer::new(
            raft_rx,
            rpc_addr.clone(),
            config.server_tls.clone(),
            config.peer_tls.clone(),
        );
        let log = Arc::new(
            DistributedLog::new(
                &config.data_dir,
                config.log,
                RaftOptions {
                    local_id: config.node_name.clone(),
                    bootstrap: config.bootstrap,
                    ..RaftOptions::default()
                },
                layer,
            )
            .await?,
        );

        let service = LogService::new(
            Arc::clone(&log) as Arc<dyn CommitLog>,
            config
                .acl
                .clone()
                .map(|acl| Arc::new(acl) as Arc<dyn Authorizer>),
        );
        let (server_stop, stopped) = oneshot::channel::<()>();
        let incoming = ReceiverStream::new(grpc_rx);
        let server_task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(server(service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = stopped.await;
                })
                .await;
            if let Err(e) = result {
                error!("rpc server failed: {e}");
            }
        });

        let mut tags = HashMap::new();
        tags.insert("rpc_addr".to_string(), rpc_addr.clone());
        let mut membership_config =
            keelson_discovery::Config::new(config.node_name.clone(), config.bind_addr.clone());
        membership_config.tags = tags;
        membership_config.start_join_addrs = config.start_join_addrs.clone();
        let membership = Membership::new(
            Arc::clone(&log) as Arc<dyn Handler>,
            membership_config,
        )
        .await?;
        let gossip_addr = membership.local_addr()?;

        info!(node = %config.node_name, %rpc_addr, %gossip_addr, "agent up");

        Ok(Self {
            rpc_addr,
            gossip_addr,
            log,
            membership,
            mux_cancel,
            server_stop: Mutex::new(Some(server_stop)),
            server_task: Mutex::new(Some(server_task)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Address of the multiplexed RPC listener.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// Address of the gossip socket, for other nodes' start-join lists.
    pub fn gossip_addr(&self) -> &str {
        &self.gossip_addr
    }

    pub fn log(&self) -> &Arc<DistributedLog> {
        &self.log
    }

    /// Wait for the cluster to have a leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> anyhow::Result<(String, String)> {
        Ok(self.log.wait_for_leader(timeout).await?)
    }

    /// Stop serving, stop consensus, flush the log, and announce the
    /// departure to the cluster. Idempotent.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down");

        if let Some(stop) = self.server_stop.lock().await.take() {
            let _ = stop.send(());
        }
        self.mux_cancel.cancel();
        if let Some(task) = self.server_task.lock().await.take() {
            let _ = task.await;
        }

        self.log.close().await?;
        self.membership.leave().await?;

        Ok(())
    }
}
