use std::{pin::Pin, sync::Arc, time::Duration};

use keelson_api::{
    log_server::{Log, LogServer},
    ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse,
};
use keelson_commitlog::Error;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::{
    error_to_status, Authorizer, CommitLog, CONSUME_ACTION, OBJECT_WILDCARD, PRODUCE_ACTION,
};

/// How long a caught-up consume stream sleeps before probing the log
/// again.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The `log.v1.Log` service.
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl LogService {
    pub fn new(commit_log: Arc<dyn CommitLog>, authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self {
            commit_log,
            authorizer,
        }
    }

    fn authorize<T>(&self, request: &Request<T>, object: &str, action: &str) -> Result<(), Status> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        let subject = subject(request);
        authorizer.authorize(&subject, object, action)
    }
}

/// Wrap a service for registration with a tonic router.
pub fn server(service: LogService) -> LogServer<LogService> {
    LogServer::new(service)
}

/// The caller identity, as asserted in request metadata. Transport-level
/// identity (client certificates) is terminated ahead of the service and
/// is expected to populate the same key.
fn subject<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get("subject")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

#[tonic::async_trait]
impl Log for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        self.authorize(&request, OBJECT_WILDCARD, PRODUCE_ACTION)?;
        let record = request.into_inner().record.unwrap_or_default();
        let offset = self
            .commit_log
            .append(record)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        self.authorize(&request, OBJECT_WILDCARD, CONSUME_ACTION)?;
        let record = self
            .commit_log
            .read(request.into_inner().offset)
            .map_err(error_to_status)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream =
        Pin<Box<dyn Stream<Item = Result<ProduceResponse, Status>> + Send + 'static>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, OBJECT_WILDCARD, PRODUCE_ACTION)?;
        let commit_log = Arc::clone(&self.commit_log);
        let mut inbound = request.into_inner();

        let responses = async_stream::try_stream! {
            while let Some(request) = inbound.message().await? {
                let record = request.record.unwrap_or_default();
                let offset = commit_log.append(record).await.map_err(error_to_status)?;
                yield ProduceResponse { offset };
            }
        };
        Ok(Response::new(Box::pin(responses)))
    }

    type ConsumeStreamStream =
        Pin<Box<dyn Stream<Item = Result<ConsumeResponse, Status>> + Send + 'static>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, OBJECT_WILDCARD, CONSUME_ACTION)?;
        let commit_log = Arc::clone(&self.commit_log);
        let mut offset = request.into_inner().offset;
        debug!(offset, "starting consume stream");

        let responses = async_stream::try_stream! {
            loop {
                match commit_log.read(offset) {
                    Ok(record) => {
                        yield ConsumeResponse { record: Some(record) };
                        offset += 1;
                    }
                    // Caught up with the head of the log: tailing consumers
                    // wait for more rather than ending the stream.
                    Err(Error::OffsetOutOfRange(_)) => {
                        tokio::time::sleep(CONSUME_POLL_INTERVAL).await;
                    }
                    Err(e) => Err(error_to_status(e))?,
                }
            }
        };
        Ok(Response::new(Box::pin(responses)))
    }
}

#[cfg(test)]
mod tests {
    use keelson_api::{LogClient, OffsetOutOfRange, Record};
    use keelson_commitlog::{Config, Log as CommitLogImpl, Replicator};
    use pretty_assertions::assert_eq;
    use tokio::{net::TcpListener, task::JoinHandle};
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{transport::Channel, Code};

    use super::*;
    use crate::Acl;

    struct TestServer {
        client: LogClient<Channel>,
        addr: String,
        log: Arc<CommitLogImpl>,
        _server: JoinHandle<()>,
        _tmp: tempfile::TempDir,
    }

    async fn setup(authorizer: Option<Acl>) -> TestServer {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(CommitLogImpl::new(tmp.path().join("log"), Config::default()).unwrap());

        let service = LogService::new(
            Arc::clone(&log) as Arc<dyn CommitLog>,
            authorizer.map(|acl| Arc::new(acl) as Arc<dyn Authorizer>),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let incoming = TcpListenerStream::new(listener);
        let server_task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(server(service))
                .serve_with_incoming(incoming)
                .await
                .unwrap();
        });

        let client = LogClient::connect(format!("http://{addr}")).await.unwrap();

        TestServer {
            client,
            addr,
            log,
            _server: server_task,
            _tmp: tmp,
        }
    }

    fn root_acl() -> Acl {
        Acl::new()
            .allow("root", OBJECT_WILDCARD, PRODUCE_ACTION)
            .allow("root", OBJECT_WILDCARD, CONSUME_ACTION)
    }

    fn as_subject<T>(subject: &str, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert("subject", subject.parse().unwrap());
        request
    }

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn produce_consume_roundtrip() {
        let mut ctx = setup(Some(root_acl())).await;

        let produced = ctx
            .client
            .produce(as_subject(
                "root",
                ProduceRequest {
                    record: Some(record(b"hello world")),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(produced.offset, 0);

        let consumed = ctx
            .client
            .consume(as_subject("root", ConsumeRequest { offset: 0 }))
            .await
            .unwrap()
            .into_inner();
        let got = consumed.record.unwrap();
        assert_eq!(got.value, b"hello world");
        assert_eq!(got.offset, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consume_past_log_boundary_fails() {
        let mut ctx = setup(Some(root_acl())).await;

        ctx.client
            .produce(as_subject(
                "root",
                ProduceRequest {
                    record: Some(record(b"hello world")),
                },
            ))
            .await
            .unwrap();

        let status = ctx
            .client
            .consume(as_subject("root", ConsumeRequest { offset: 1 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::OutOfRange);
        assert_eq!(
            OffsetOutOfRange::from_status(&status),
            Some(OffsetOutOfRange { offset: 1 })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn produce_consume_stream_roundtrip() {
        let mut ctx = setup(Some(root_acl())).await;

        let requests = vec![
            ProduceRequest {
                record: Some(record(b"first message")),
            },
            ProduceRequest {
                record: Some(record(b"second message")),
            },
        ];
        let mut responses = ctx
            .client
            .produce_stream(as_subject("root", tokio_stream::iter(requests)))
            .await
            .unwrap()
            .into_inner();
        for want in 0..2u64 {
            let response = responses.message().await.unwrap().unwrap();
            assert_eq!(response.offset, want);
        }

        let mut stream = ctx
            .client
            .consume_stream(as_subject("root", ConsumeRequest { offset: 0 }))
            .await
            .unwrap()
            .into_inner();
        for (want_offset, want_value) in [(0u64, &b"first message"[..]), (1, b"second message")] {
            let response = stream.message().await.unwrap().unwrap();
            let got = response.record.unwrap();
            assert_eq!(got.offset, want_offset);
            assert_eq!(got.value, want_value);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthorized_subject_is_denied() {
        let mut ctx = setup(Some(root_acl())).await;

        let status = ctx
            .client
            .produce(as_subject(
                "nobody",
                ProduceRequest {
                    record: Some(record(b"hello world")),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);

        let status = ctx
            .client
            .consume(as_subject("nobody", ConsumeRequest { offset: 0 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);

        // Nothing reached the log.
        assert!(ctx.log.read(0).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replicator_mirrors_peer_records() {
        let mut upstream = setup(None).await;
        let local = setup(None).await;

        let replicator = Replicator::new(local.client.clone());
        replicator.join("upstream", &upstream.addr);

        upstream
            .client
            .produce(Request::new(ProduceRequest {
                record: Some(record(b"mirrored")),
            }))
            .await
            .unwrap();

        let mut client = local.client.clone();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let got = loop {
            match client.consume(Request::new(ConsumeRequest { offset: 0 })).await {
                Ok(response) => break response.into_inner().record.unwrap(),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(status) => panic!("record never replicated: {status}"),
            }
        };
        assert_eq!(got.value, b"mirrored");

        // Closing stops the mirror; later upstream records stay put.
        replicator.close();
        upstream
            .client
            .produce(Request::new(ProduceRequest {
                record: Some(record(b"not mirrored")),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(client
            .consume(Request::new(ConsumeRequest { offset: 1 }))
            .await
            .is_err());
    }
}
