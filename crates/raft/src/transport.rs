use std::{collections::HashMap, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use prost::Message as _;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{proto, Error, ServerAddress};

const TAG_APPEND_ENTRIES: u8 = 1;
const TAG_VOTE: u8 = 2;
const TAG_INSTALL_SNAPSHOT: u8 = 3;

/// A byte stream between two raft peers.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Connectivity between raft peers.
///
/// Implementations own listener setup and any connection-level framing of
/// their own, such as a leading discriminator byte or a TLS handshake.
/// `dial` must produce a stream the remote node's `accept` will hand to its
/// consensus runtime.
#[async_trait]
pub trait StreamLayer: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<Box<dyn Connection>>;

    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>>;

    /// The address peers should dial to reach this node.
    fn local_addr(&self) -> String;
}

/// Plain-TCP [`StreamLayer`] without any connection preamble.
pub struct TcpStreamLayer {
    listener: TcpListener,
}

impl TcpStreamLayer {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

#[async_trait]
impl StreamLayer for TcpStreamLayer {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(TcpStream::connect(addr).await?))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

/// A decoded peer-to-peer message.
#[derive(Debug)]
pub(crate) enum Rpc {
    AppendEntries(proto::AppendEntriesRequest),
    AppendEntriesResponse(proto::AppendEntriesResponse),
    Vote(proto::VoteRequest),
    VoteResponse(proto::VoteResponse),
    InstallSnapshot(proto::InstallSnapshotRequest),
    InstallSnapshotResponse(proto::InstallSnapshotResponse),
}

impl Rpc {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            Rpc::AppendEntries(m) => (TAG_APPEND_ENTRIES, m.encode_to_vec()),
            Rpc::AppendEntriesResponse(m) => (TAG_APPEND_ENTRIES, m.encode_to_vec()),
            Rpc::Vote(m) => (TAG_VOTE, m.encode_to_vec()),
            Rpc::VoteResponse(m) => (TAG_VOTE, m.encode_to_vec()),
            Rpc::InstallSnapshot(m) => (TAG_INSTALL_SNAPSHOT, m.encode_to_vec()),
            Rpc::InstallSnapshotResponse(m) => (TAG_INSTALL_SNAPSHOT, m.encode_to_vec()),
        }
    }

    fn decode_request(tag: u8, bytes: &[u8]) -> Result<Self, Error> {
        match tag {
            TAG_APPEND_ENTRIES => Ok(Rpc::AppendEntries(proto::AppendEntriesRequest::decode(
                bytes,
            )?)),
            TAG_VOTE => Ok(Rpc::Vote(proto::VoteRequest::decode(bytes)?)),
            TAG_INSTALL_SNAPSHOT => Ok(Rpc::InstallSnapshot(
                proto::InstallSnapshotRequest::decode(bytes)?,
            )),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown rpc tag: {tag}"),
            ))),
        }
    }
}

/// An inbound request paired with the channel its response goes out on.
#[derive(Debug)]
pub(crate) struct RpcMessage {
    pub(crate) request: Rpc,
    pub(crate) reply: oneshot::Sender<Rpc>,
}

async fn write_frame(conn: &mut (dyn Connection + '_), tag: u8, bytes: &[u8]) -> io::Result<()> {
    conn.write_all(&[tag]).await?;
    conn.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    conn.write_all(bytes).await?;
    conn.flush().await
}

async fn read_frame(conn: &mut (dyn Connection + '_)) -> io::Result<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    conn.read_exact(&mut tag).await?;
    let mut len = [0u8; 4];
    conn.read_exact(&mut len).await?;
    let mut bytes = vec![0u8; u32::from_be_bytes(len) as usize];
    conn.read_exact(&mut bytes).await?;
    Ok((tag[0], bytes))
}

/// Request-response plumbing over a [`StreamLayer`].
///
/// Inbound connections are served one frame at a time into the runtime's
/// message queue; outbound requests reuse one pooled connection per peer.
pub(crate) struct NetworkTransport {
    layer: Box<dyn StreamLayer>,
    pool: Mutex<HashMap<ServerAddress, Arc<Mutex<Option<Box<dyn Connection>>>>>>,
    timeout: Duration,
}

impl NetworkTransport {
    pub(crate) fn new(layer: Box<dyn StreamLayer>, timeout: Duration) -> Self {
        Self {
            layer,
            pool: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub(crate) fn local_addr(&self) -> String {
        self.layer.local_addr()
    }

    /// Accept and serve inbound consensus connections until cancelled.
    pub(crate) fn serve(
        self: Arc<Self>,
        rpc_tx: mpsc::Sender<RpcMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    conn = self.layer.accept() => conn,
                };
                match conn {
                    Ok(conn) => {
                        let rpc_tx = rpc_tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_conn(conn, rpc_tx, shutdown));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        return;
                    }
                }
            }
        })
    }

    async fn request(&self, addr: &str, rpc: Rpc) -> Result<Rpc, Error> {
        let slot = {
            let mut pool = self.pool.lock().await;
            Arc::clone(pool.entry(addr.to_string()).or_default())
        };
        let mut conn = slot.lock().await;

        let result = tokio::time::timeout(self.timeout, async {
            if conn.is_none() {
                trace!(%addr, "dialing peer");
                *conn = Some(self.layer.dial(addr).await?);
            }
            let stream = conn.as_mut().expect("connection was just established");
            let (tag, bytes) = rpc.encode();
            write_frame(stream.as_mut(), tag, &bytes).await?;
            read_frame(stream.as_mut()).await
        })
        .await;

        let (tag, bytes) = match result {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                *conn = None;
                return Err(Error::Io(e));
            }
            Err(_) => {
                *conn = None;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("rpc to {addr} timed out"),
                )));
            }
        };

        match tag {
            TAG_APPEND_ENTRIES => Ok(Rpc::AppendEntriesResponse(
                proto::AppendEntriesResponse::decode(&bytes[..])?,
            )),
            TAG_VOTE => Ok(Rpc::VoteResponse(proto::VoteResponse::decode(&bytes[..])?)),
            TAG_INSTALL_SNAPSHOT => Ok(Rpc::InstallSnapshotResponse(
                proto::InstallSnapshotResponse::decode(&bytes[..])?,
            )),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown response tag: {tag}"),
            ))),
        }
    }

    pub(crate) async fn append_entries(
        &self,
        addr: &str,
        req: proto::AppendEntriesRequest,
    ) -> Result<proto::AppendEntriesResponse, Error> {
        match self.request(addr, Rpc::AppendEntries(req)).await? {
            Rpc::AppendEntriesResponse(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn vote(
        &self,
        addr: &str,
        req: proto::VoteRequest,
    ) -> Result<proto::VoteResponse, Error> {
        match self.request(addr, Rpc::Vote(req)).await? {
            Rpc::VoteResponse(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn install_snapshot(
        &self,
        addr: &str,
        req: proto::InstallSnapshotRequest,
    ) -> Result<proto::InstallSnapshotResponse, Error> {
        match self.request(addr, Rpc::InstallSnapshot(req)).await? {
            Rpc::InstallSnapshotResponse(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(rpc: Rpc) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("response does not match the request: {rpc:?}"),
    ))
}

async fn handle_conn(
    mut conn: Box<dyn Connection>,
    rpc_tx: mpsc::Sender<RpcMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = read_frame(conn.as_mut()) => frame,
        };
        let (tag, bytes) = match frame {
            Ok(frame) => frame,
            // Peers drop connections freely; only genuine decode trouble is
            // worth a log line.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!("connection closed: {e}");
                return;
            }
        };

        let request = match Rpc::decode_request(tag, &bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping undecodable rpc: {e}");
                return;
            }
        };

        let (reply, rx) = oneshot::channel();
        if rpc_tx.send(RpcMessage { request, reply }).await.is_err() {
            return;
        }
        let Ok(response) = rx.await else {
            return;
        };

        let (tag, bytes) = response.encode();
        if let Err(e) = write_frame(conn.as_mut(), tag, &bytes).await {
            debug!("failed to write response: {e}");
            return;
        }
    }
}
