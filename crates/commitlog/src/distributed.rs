use std::{
    io::{self, Read as _},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use keelson_api::{ProduceRequest, Record};
use keelson_discovery::HandlerError;
use keelson_raft::{
    has_existing_state, EntryKind, FileSnapshotStore, Fsm, FsmSnapshot, LogEntry, LogStore, Raft,
    SledStore, SnapshotSink,
};
use prost::Message as _;
use tokio::{
    io::AsyncWriteExt as _,
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::{
    commitlog::{Log, LogReader},
    config::Config,
    error::Error,
};

/// Discriminator byte dialed ahead of every consensus connection; the
/// connection multiplexer routes on it.
pub const RAFT_RPC: u8 = 1;

/// Leading byte of a replicated command carrying a produce request.
const APPEND_REQUEST_TYPE: u8 = 0;

/// How long an append may wait for quorum commit.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Consensus tuning carried alongside the log configuration. Unset
/// durations keep the runtime defaults.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub local_id: String,
    pub heartbeat_timeout: Option<Duration>,
    pub election_timeout: Option<Duration>,
    pub leader_lease_timeout: Option<Duration>,
    pub commit_timeout: Option<Duration>,
    /// Form a single-voter cluster when no prior state exists on disk.
    pub bootstrap: bool,
}

/// A log whose appends are agreed on by a cluster before being
/// acknowledged.
///
/// Wraps a local [`Log`] behind a consensus runtime: appends are proposed
/// to the cluster and applied on every voter, reads are served from the
/// local replica without any linearizability guarantee.
pub struct DistributedLog {
    log: Arc<Log>,
    raft: Raft<LogFsm>,
}

impl DistributedLog {
    /// Open the log under `data_dir` and start its consensus runtime.
    ///
    /// Layout inside `data_dir`: `log/` holds the user-facing segments,
    /// `raft/log/` the consensus log (offsets starting at 1), `raft/stable`
    /// the vote/term store, and `raft/*.snap` the snapshots.
    pub async fn new(
        data_dir: impl AsRef<Path>,
        config: Config,
        options: RaftOptions,
        layer: StreamLayer,
    ) -> Result<Self, Error> {
        let data_dir = data_dir.as_ref();

        let log = Arc::new(Log::new(data_dir.join("log"), config)?);

        let mut raft_log_config = config;
        raft_log_config.segment.initial_offset = 1;
        let logs: Arc<dyn LogStore> = Arc::new(LogStoreAdapter {
            log: Log::new(data_dir.join("raft").join("log"), raft_log_config)?,
        });
        let stable = Arc::new(SledStore::new(data_dir.join("raft").join("stable"))?);
        let snapshots = Arc::new(FileSnapshotStore::new(data_dir.join("raft"), 1)?);

        let mut raft_config = keelson_raft::Config::new(options.local_id.clone());
        if let Some(timeout) = options.heartbeat_timeout {
            raft_config.heartbeat_timeout = timeout;
        }
        if let Some(timeout) = options.election_timeout {
            raft_config.election_timeout = timeout;
        }
        if let Some(timeout) = options.leader_lease_timeout {
            raft_config.leader_lease_timeout = timeout;
        }
        if let Some(timeout) = options.commit_timeout {
            raft_config.commit_timeout = timeout;
        }

        let fresh = !has_existing_state(logs.as_ref(), stable.as_ref(), snapshots.as_ref())?;

        let raft = Raft::new(
            raft_config,
            LogFsm {
                log: Arc::clone(&log),
            },
            logs,
            stable,
            snapshots,
            Box::new(layer),
        )?;

        if options.bootstrap && fresh {
            raft.bootstrap_cluster().await?;
        }

        Ok(Self { log, raft })
    }

    /// Propose a record to the cluster and return its assigned offset once
    /// a quorum has committed it. Fails on followers with the leader's
    /// address attached.
    pub async fn append(&self, record: Record) -> Result<u64, Error> {
        let mut command = vec![APPEND_REQUEST_TYPE];
        command.extend(
            ProduceRequest {
                record: Some(record),
            }
            .encode_to_vec(),
        );
        self.raft.apply(command, APPLY_TIMEOUT).await?
    }

    /// Read from the local replica. May lag commits on followers.
    pub fn read(&self, offset: u64) -> Result<Record, Error> {
        self.log.read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.log.lowest_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        self.log.highest_offset()
    }

    /// Add `id` as a voter reachable at `addr`. Leader only.
    pub async fn join(&self, id: &str, addr: &str) -> Result<(), Error> {
        self.raft.add_voter(id.to_string(), addr.to_string()).await?;
        Ok(())
    }

    /// Remove `id` from the cluster. Leader only.
    pub async fn leave(&self, id: &str) -> Result<(), Error> {
        self.raft.remove_server(id.to_string()).await?;
        Ok(())
    }

    /// The current leader's id and transport address, if known.
    pub fn leader(&self) -> Option<(String, String)> {
        self.raft.leader()
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(String, String), Error> {
        Ok(self.raft.wait_for_leader(timeout).await?)
    }

    /// Stop consensus, then close the local log.
    pub async fn close(&self) -> Result<(), Error> {
        self.raft.shutdown().await?;
        self.log.close()
    }
}

#[async_trait]
impl keelson_discovery::Handler for DistributedLog {
    async fn join(&self, name: &str, addr: &str) -> Result<(), HandlerError> {
        DistributedLog::join(self, name, addr)
            .await
            .map_err(Error::into_handler_error)
    }

    async fn leave(&self, name: &str) -> Result<(), HandlerError> {
        DistributedLog::leave(self, name)
            .await
            .map_err(Error::into_handler_error)
    }
}

impl Error {
    fn into_handler_error(self) -> HandlerError {
        match self {
            Error::Raft(keelson_raft::Error::NotLeader { .. }) => HandlerError::NotLeader,
            other => HandlerError::Other(Box::new(other)),
        }
    }
}

/// The state machine consensus drives: committed commands are appended to
/// the wrapped log.
struct LogFsm {
    log: Arc<Log>,
}

impl Fsm for LogFsm {
    type Response = Result<u64, Error>;

    fn apply(&mut self, entry: &LogEntry) -> Self::Response {
        let Some((&tag, payload)) = entry.data.split_first() else {
            return Err(Error::UnknownRequestType(0));
        };
        match tag {
            APPEND_REQUEST_TYPE => {
                let request = ProduceRequest::decode(payload).map_err(|source| Error::Decode {
                    offset: entry.index,
                    source,
                })?;
                self.log.append(request.record.unwrap_or_default())
            }
            tag => Err(Error::UnknownRequestType(tag)),
        }
    }

    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>, keelson_raft::Error> {
        let reader = self.log.reader().map_err(keelson_raft::Error::storage)?;
        Ok(Box::new(LogSnapshot { reader }))
    }

    fn restore(&mut self, mut reader: Box<dyn io::Read + Send>) -> Result<(), keelson_raft::Error> {
        let mut len = [0u8; 8];
        let mut first = true;
        loop {
            match reader.read_exact(&mut len) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut payload = vec![0u8; u64::from_be_bytes(len) as usize];
            reader.read_exact(&mut payload)?;
            let record = Record::decode(&payload[..])?;

            if first {
                // The stream dictates where the rebuilt log starts.
                self.log
                    .reset_to(record.offset)
                    .map_err(keelson_raft::Error::storage)?;
                first = false;
            }
            self.log
                .append(record)
                .map_err(keelson_raft::Error::storage)?;
        }
        Ok(())
    }
}

/// Snapshot of the wrapped log: the raw store bytes, which use the same
/// length-prefixed framing the restore path expects.
struct LogSnapshot {
    reader: LogReader,
}

impl FsmSnapshot for LogSnapshot {
    fn persist(&mut self, sink: &mut dyn SnapshotSink) -> Result<(), keelson_raft::Error> {
        io::copy(&mut self.reader, sink)?;
        Ok(())
    }
}

/// [`LogStore`] over a second [`Log`] instance.
///
/// Consensus assigns dense indexes starting at 1 and the log assigns
/// offsets the same way, so indexes and offsets coincide; the adapter
/// checks that invariant on every append. Prefix deletions map to the
/// log's segment-granular truncation; suffix deletions (a conflicting
/// leader's leftovers) rebuild the retained prefix.
struct LogStoreAdapter {
    log: Log,
}

impl LogStoreAdapter {
    fn entry_of(record: Record) -> LogEntry {
        LogEntry {
            index: record.offset,
            term: record.term,
            kind: EntryKind::from_u32(record.r#type),
            data: record.value,
        }
    }

    fn is_empty(&self) -> bool {
        // The raft log starts at offset 1, so an empty log is the only way
        // the highest offset can sit below the lowest.
        self.log.highest_offset() < self.log.lowest_offset()
    }
}

impl LogStore for LogStoreAdapter {
    fn first_index(&self) -> Result<u64, keelson_raft::Error> {
        Ok(self.log.lowest_offset())
    }

    fn last_index(&self) -> Result<u64, keelson_raft::Error> {
        Ok(self.log.highest_offset())
    }

    fn get_log(&self, index: u64) -> Result<LogEntry, keelson_raft::Error> {
        match self.log.read(index) {
            Ok(record) => Ok(Self::entry_of(record)),
            Err(Error::OffsetOutOfRange(offset)) => Err(keelson_raft::Error::LogNotFound(offset)),
            Err(e) => Err(keelson_raft::Error::storage(e)),
        }
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<(), keelson_raft::Error> {
        for entry in entries {
            // After a full compaction the fresh log must pick up at
            // whatever index consensus writes next.
            if self.is_empty() && self.log.lowest_offset() != entry.index {
                self.log
                    .reset_to(entry.index)
                    .map_err(keelson_raft::Error::storage)?;
            }
            let record = Record {
                value: entry.data.clone(),
                offset: 0,
                term: entry.term,
                r#type: entry.kind.as_u32(),
            };
            let offset = self
                .log
                .append(record)
                .map_err(keelson_raft::Error::storage)?;
            if offset != entry.index {
                return Err(keelson_raft::Error::Storage(
                    format!("log assigned offset {offset} to entry {}", entry.index).into(),
                ));
            }
        }
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<(), keelson_raft::Error> {
        let lowest = self.log.lowest_offset();
        if min > lowest {
            // Exact suffix discard: rebuild the retained prefix.
            let mut retained = Vec::with_capacity((min - lowest) as usize);
            for offset in lowest..min {
                retained.push(self.log.read(offset).map_err(keelson_raft::Error::storage)?);
            }
            self.log
                .reset_to(lowest)
                .map_err(keelson_raft::Error::storage)?;
            for record in retained {
                self.log
                    .append(record)
                    .map_err(keelson_raft::Error::storage)?;
            }
            Ok(())
        } else {
            // Prefix reclamation; whole segments only, keeping the tail.
            self.log.truncate(max).map_err(keelson_raft::Error::storage)
        }
    }
}

/// Byte-discriminated connection plumbing for the consensus runtime.
///
/// Inbound connections arrive from the multiplexer with their leading
/// [`RAFT_RPC`] byte already consumed, optionally getting wrapped in
/// server-side TLS here. Outbound dials write the byte first, then
/// optionally negotiate TLS with the peer configuration.
pub struct StreamLayer {
    incoming: Mutex<mpsc::Receiver<TcpStream>>,
    local_addr: String,
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
}

impl StreamLayer {
    pub fn new(
        incoming: mpsc::Receiver<TcpStream>,
        local_addr: String,
        server_tls: Option<Arc<rustls::ServerConfig>>,
        peer_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            incoming: Mutex::new(incoming),
            local_addr,
            server_tls: server_tls.map(TlsAcceptor::from),
            peer_tls: peer_tls.map(TlsConnector::from),
        }
    }
}

#[async_trait]
impl keelson_raft::StreamLayer for StreamLayer {
    async fn accept(&self) -> io::Result<Box<dyn keelson_raft::Connection>> {
        let conn = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "multiplexer closed"))?;
        match &self.server_tls {
            Some(acceptor) => Ok(Box::new(acceptor.accept(conn).await?)),
            None => Ok(Box::new(conn)),
        }
    }

    async fn dial(&self, addr: &str) -> io::Result<Box<dyn keelson_raft::Connection>> {
        let mut conn = TcpStream::connect(addr).await?;
        conn.write_all(&[RAFT_RPC]).await?;
        debug!(%addr, "dialed consensus peer");
        match &self.peer_tls {
            Some(connector) => {
                let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(Box::new(connector.connect(server_name, conn).await?))
            }
            None => Ok(Box::new(conn)),
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncReadExt as _, net::TcpListener};

    use super::*;
    use crate::config::SegmentConfig;

    /// Minimal stand-in for the agent's connection multiplexer: accepts,
    /// strips the discriminator byte, and forwards consensus connections.
    async fn spawn_mux() -> (String, mpsc::Receiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut first = [0u8; 1];
                    if conn.read_exact(&mut first).await.is_ok() && first[0] == RAFT_RPC {
                        let _ = tx.send(conn).await;
                    }
                });
            }
        });
        (addr, rx)
    }

    struct TestNode {
        log: DistributedLog,
        _tmp: tempfile::TempDir,
    }

    async fn spawn_log(i: usize, bootstrap: bool) -> TestNode {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, rx) = spawn_mux().await;
        let layer = StreamLayer::new(rx, addr, None, None);

        let config = Config {
            segment: SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        };
        let options = RaftOptions {
            local_id: format!("node-{i}"),
            heartbeat_timeout: Some(Duration::from_millis(200)),
            election_timeout: Some(Duration::from_millis(200)),
            leader_lease_timeout: Some(Duration::from_millis(600)),
            commit_timeout: Some(Duration::from_millis(25)),
            bootstrap,
        };

        let log = DistributedLog::new(tmp.path(), config, options, layer)
            .await
            .unwrap();
        TestNode { log, _tmp: tmp }
    }

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    async fn eventually(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn multiple_nodes_replicate_appends() {
        let leader = spawn_log(0, true).await;
        leader
            .log
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let f1 = spawn_log(1, false).await;
        let f2 = spawn_log(2, false).await;
        leader
            .log
            .join("node-1", f1.log.raft.local_addr())
            .await
            .unwrap();
        leader
            .log
            .join("node-2", f2.log.raft.local_addr())
            .await
            .unwrap();

        let mut offsets = Vec::new();
        for i in 0..3u8 {
            offsets.push(leader.log.append(record(&[i])).await.unwrap());
        }
        assert_eq!(offsets, vec![0, 1, 2]);

        for node in [&leader, &f1, &f2] {
            assert!(
                eventually(Duration::from_secs(5), || {
                    (0..3u64).all(|off| {
                        node.log
                            .read(off)
                            .map(|r| r.value == [off as u8] && r.offset == off)
                            .unwrap_or(false)
                    })
                })
                .await,
                "appends did not replicate"
            );
        }

        // Followers refuse appends but know where to go.
        let err = f1.log.append(record(b"nope")).await.unwrap_err();
        match err {
            Error::Raft(keelson_raft::Error::NotLeader { leader: Some(_) }) => {}
            other => panic!("expected a not-leader error, got {other:?}"),
        }

        // A removed server stops receiving appends.
        leader.log.leave("node-1").await.unwrap();
        let last = leader.log.append(record(b"after-leave")).await.unwrap();
        assert!(
            eventually(Duration::from_secs(5), || {
                f2.log.read(last).is_ok()
            })
            .await,
            "remaining follower fell behind"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f1.log.read(last).is_err(), "removed node kept replicating");

        leader.log.close().await.unwrap();
        f1.log.close().await.unwrap();
        f2.log.close().await.unwrap();
    }

    struct VecSink {
        data: Vec<u8>,
    }

    impl io::Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for VecSink {
        fn id(&self) -> &str {
            "test"
        }

        fn close(self: Box<Self>) -> Result<(), keelson_raft::Error> {
            Ok(())
        }

        fn cancel(self: Box<Self>) -> Result<(), keelson_raft::Error> {
            Ok(())
        }
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::new(tmp.path().join("log"), Config::default()).unwrap());
        let mut fsm = LogFsm {
            log: Arc::clone(&log),
        };

        for value in [&b"first"[..], b"second", b"third"] {
            log.append(record(value)).unwrap();
        }

        let mut sink = Box::new(VecSink { data: Vec::new() });
        fsm.snapshot().unwrap().persist(sink.as_mut()).unwrap();
        let snapshot = sink.data;

        let restored_dir = tempfile::tempdir().unwrap();
        let restored = Arc::new(Log::new(restored_dir.path().join("log"), Config::default()).unwrap());
        let mut restored_fsm = LogFsm {
            log: Arc::clone(&restored),
        };
        restored_fsm
            .restore(Box::new(io::Cursor::new(snapshot)))
            .unwrap();

        assert_eq!(restored.lowest_offset(), 0);
        assert_eq!(restored.highest_offset(), 2);
        for (offset, value) in [(0u64, &b"first"[..]), (1, b"second"), (2, b"third")] {
            let got = restored.read(offset).unwrap();
            assert_eq!(got.value, value);
            assert_eq!(got.offset, offset);
        }
    }

    #[test]
    fn log_store_adapter_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.segment.initial_offset = 1;
        let store = LogStoreAdapter {
            log: Log::new(tmp.path().join("raft-log"), config).unwrap(),
        };

        assert_eq!(store.last_index().unwrap(), 0);

        let entries: Vec<LogEntry> = (1..=5u64)
            .map(|index| LogEntry {
                index,
                term: 1,
                kind: EntryKind::Command,
                data: vec![index as u8],
            })
            .collect();
        store.store_logs(&entries).unwrap();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 5);

        let got = store.get_log(3).unwrap();
        assert_eq!(got, entries[2]);
        assert!(matches!(
            store.get_log(6),
            Err(keelson_raft::Error::LogNotFound(6))
        ));

        // Suffix discard, as after a leader conflict: entries 4..=5 go,
        // 1..=3 stay, and new entries continue at 4.
        store.delete_range(4, 5).unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.get_log(3).unwrap(), entries[2]);
        store
            .store_logs(&[LogEntry {
                index: 4,
                term: 2,
                kind: EntryKind::Command,
                data: b"replacement".to_vec(),
            }])
            .unwrap();
        assert_eq!(store.get_log(4).unwrap().term, 2);

        // A fresh log after full compaction realigns with whatever index
        // consensus writes next.
        let tmp2 = tempfile::tempdir().unwrap();
        let store = LogStoreAdapter {
            log: Log::new(tmp2.path().join("raft-log"), config).unwrap(),
        };
        store
            .store_logs(&[LogEntry {
                index: 42,
                term: 7,
                kind: EntryKind::Command,
                data: b"late start".to_vec(),
            }])
            .unwrap();
        assert_eq!(store.first_index().unwrap(), 42);
        assert_eq!(store.get_log(42).unwrap().term, 7);
    }

    #[test]
    fn fsm_rejects_unknown_request_types() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::new(tmp.path().join("log"), Config::default()).unwrap());
        let mut fsm = LogFsm {
            log: Arc::clone(&log),
        };

        let entry = LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Command,
            data: vec![42, 1, 2, 3],
        };
        assert!(matches!(
            fsm.apply(&entry),
            Err(Error::UnknownRequestType(42))
        ));
        assert_eq!(log.highest_offset(), 0);
    }
}
