use std::path::PathBuf;

use clap::Parser;
use keelson_standalone::{tls, Agent, Config};
use tracing_subscriber::EnvFilter;

/// A distributed commit log node.
#[derive(Debug, Parser)]
#[command(name = "keelson", version)]
struct Cli {
    /// Directory holding the log, consensus state, and snapshots.
    #[arg(long, default_value = "keelson-data")]
    data_dir: PathBuf,

    /// Unique node name; defaults to the host name.
    #[arg(long)]
    node_name: Option<String>,

    /// Gossip bind address.
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: String,

    /// Port for the multiplexed RPC listener, on the gossip host.
    #[arg(long, default_value_t = 8400)]
    rpc_port: u16,

    /// Gossip addresses of existing cluster members.
    #[arg(long, value_delimiter = ',')]
    start_join_addrs: Vec<String>,

    /// Form a new single-node cluster if no state exists yet.
    #[arg(long)]
    bootstrap: bool,

    /// PEM certificate presented by this node's listener.
    #[arg(long, requires = "server_key")]
    server_cert: Option<PathBuf>,

    /// PEM key for the listener certificate.
    #[arg(long, requires = "server_cert")]
    server_key: Option<PathBuf>,

    /// PEM certificate authority used to verify peers when dialing.
    #[arg(long)]
    peer_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let server_tls = match (&cli.server_cert, &cli.server_key) {
        (Some(cert), Some(key)) => Some(tls::server_config(cert, key)?),
        _ => None,
    };
    let peer_tls = cli.peer_ca.as_deref().map(tls::peer_config).transpose()?;

    let node_name = cli.node_name.unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "keelson".to_string())
    });

    let agent = Agent::new(Config {
        data_dir: cli.data_dir,
        node_name,
        bind_addr: cli.bind_addr,
        rpc_port: cli.rpc_port,
        start_join_addrs: cli.start_join_addrs,
        bootstrap: cli.bootstrap,
        log: keelson_commitlog::Config::default(),
        acl: None,
        server_tls,
        peer_tls,
    })
    .await?;

    tokio::signal::ctrl_c().await?;
    agent.shutdown().await
}
