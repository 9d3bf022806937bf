use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use keelson_commitlog::RAFT_RPC;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Route accepted connections by their first byte: [`RAFT_RPC`] goes to
/// the consensus stream layer (raw, which does its own TLS), everything
/// else to the gRPC server (TLS-wrapped here when configured).
pub(crate) fn spawn(
    listener: TcpListener,
    raft_tx: mpsc::Sender<TcpStream>,
    grpc_tx: mpsc::Sender<Result<MuxStream, io::Error>>,
    server_tls: Option<Arc<rustls::ServerConfig>>,
    cancel: CancellationToken,
) {
    let acceptor = server_tls.map(TlsAcceptor::from);
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (conn, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!(%peer, "accepted connection");

            let raft_tx = raft_tx.clone();
            let grpc_tx = grpc_tx.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut first = [0u8; 1];
                let mut conn = conn;
                if conn.read_exact(&mut first).await.is_err() {
                    return;
                }
                if first[0] == RAFT_RPC {
                    let _ = raft_tx.send(conn).await;
                    return;
                }

                // The sniffed byte belongs to the gRPC byte stream (or the
                // TLS handshake) and has to be replayed.
                let replayed = PrefixedStream {
                    first: Some(first[0]),
                    inner: conn,
                };
                let stream = match &acceptor {
                    Some(acceptor) => match acceptor.accept(replayed).await {
                        Ok(tls) => MuxStream::Tls(Box::new(tls)),
                        Err(e) => {
                            debug!("tls handshake failed: {e}");
                            return;
                        }
                    },
                    None => MuxStream::Plain(replayed),
                };
                let _ = grpc_tx.send(Ok(stream)).await;
            });
        }
    });
}

/// A connection whose sniffed first byte is handed back before the rest.
pub(crate) struct PrefixedStream {
    first: Option<u8>,
    inner: TcpStream,
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(byte) = self.first.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// What the gRPC server is fed: a demultiplexed connection, TLS-wrapped
/// when the node terminates TLS itself.
pub(crate) enum MuxStream {
    Plain(PrefixedStream),
    Tls(Box<tokio_rustls::server::TlsStream<PrefixedStream>>),
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MuxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MuxStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MuxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MuxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MuxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl tonic::transport::server::Connected for MuxStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}
