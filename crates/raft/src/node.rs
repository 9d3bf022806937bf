use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Read as _,
    sync::Arc,
    time::Duration,
};

use prost::Message as _;
use rand::Rng as _;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    fsm::Fsm,
    log::{EntryKind, LogEntry, LogStore},
    proto,
    snapshot::SnapshotStore,
    stable::{StableStore, KEY_CURRENT_TERM, KEY_LAST_APPLIED, KEY_VOTED_FOR},
    transport::{NetworkTransport, Rpc, RpcMessage, StreamLayer},
    Error, ServerAddress, ServerId,
};

/// Whether a node with prior on-disk state exists in these stores.
///
/// Governs the bootstrap decision: a node configured to bootstrap only
/// forms a single-voter cluster when nothing has been persisted yet.
pub fn has_existing_state(
    logs: &dyn LogStore,
    stable: &dyn StableStore,
    snapshots: &dyn SnapshotStore,
) -> Result<bool, Error> {
    Ok(logs.last_index()? > 0
        || stable.get_u64(KEY_CURRENT_TERM)?.is_some()
        || !snapshots.list()?.is_empty())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

enum ApiMessage<R> {
    Apply {
        data: Vec<u8>,
        tx: oneshot::Sender<Result<R, Error>>,
    },
    AddVoter {
        id: ServerId,
        addr: ServerAddress,
        tx: oneshot::Sender<Result<(), Error>>,
    },
    RemoveServer {
        id: ServerId,
        tx: oneshot::Sender<Result<(), Error>>,
    },
    Bootstrap {
        tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Event {
    AppendResult {
        peer: ServerId,
        term: u64,
        last_index_sent: u64,
        result: Result<proto::AppendEntriesResponse, Error>,
    },
    VoteResult {
        term: u64,
        peer: ServerId,
        result: Result<proto::VoteResponse, Error>,
    },
    SnapshotResult {
        peer: ServerId,
        term: u64,
        snapshot_index: u64,
        result: Result<proto::InstallSnapshotResponse, Error>,
    },
}

struct Shared {
    local_id: ServerId,
    local_addr: ServerAddress,
    leader_tx: watch::Sender<Option<(ServerId, ServerAddress)>>,
}

/// Handle to a running consensus node.
///
/// Dropping the handle without calling [`Raft::shutdown`] aborts the
/// runtime without a graceful stop.
pub struct Raft<F: Fsm> {
    api_tx: mpsc::UnboundedSender<ApiMessage<F::Response>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    runtime: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Fsm> Raft<F> {
    /// Start a consensus node over the given storage and transport.
    ///
    /// Recovers term, vote, apply cursor, snapshot, and cluster
    /// configuration from the stores before serving.
    pub fn new(
        config: Config,
        mut fsm: F,
        logs: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        snapshots: Arc<dyn SnapshotStore>,
        layer: Box<dyn StreamLayer>,
    ) -> Result<Self, Error> {
        let local_addr = layer.local_addr();
        let transport = Arc::new(NetworkTransport::new(layer, Duration::from_secs(10)));

        let current_term = stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0);
        let voted_for = match stable.get(KEY_VOTED_FOR)? {
            Some(bytes) => Some(String::from_utf8(bytes).map_err(Error::storage)?),
            None => None,
        };
        let mut last_applied = stable.get_u64(KEY_LAST_APPLIED)?.unwrap_or(0);

        let mut last_snapshot_index = 0;
        let mut last_snapshot_term = 0;
        let mut configuration = proto::Configuration::default();
        let mut configuration_index = 0;

        if let Some(meta) = snapshots.list()?.into_iter().next() {
            if meta.index > last_applied {
                info!(id = %meta.id, "restoring state machine from snapshot");
                let (_, reader) = snapshots.open(&meta.id)?;
                fsm.restore(reader)?;
                last_applied = meta.index;
                stable.set_u64(KEY_LAST_APPLIED, last_applied)?;
            }
            last_snapshot_index = meta.index;
            last_snapshot_term = meta.term;
            configuration = meta.configuration();
            configuration_index = meta.index;
        }

        // Configuration entries later in the log supersede the snapshot's.
        let first = logs.first_index()?.max(1);
        let last = logs.last_index()?;
        for index in first..=last {
            let Ok(entry) = logs.get_log(index) else {
                continue;
            };
            if entry.kind == EntryKind::Configuration && index > configuration_index {
                configuration = proto::Configuration::decode(&entry.data[..])?;
                configuration_index = index;
            }
        }

        let (leader_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            local_id: config.local_id.clone(),
            local_addr,
            leader_tx,
        });

        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let _listener = Arc::clone(&transport).serve(rpc_tx, shutdown.clone());

        let election_deadline = Instant::now() + random_timeout(config.heartbeat_timeout);
        let node = Node {
            config,
            fsm,
            logs,
            stable,
            snapshots,
            transport,
            shared: Arc::clone(&shared),
            shutdown: shutdown.clone(),
            role: Role::Follower,
            current_term,
            voted_for,
            commit_index: last_applied,
            last_applied,
            last_snapshot_index,
            last_snapshot_term,
            configuration,
            configuration_index,
            leader: None,
            last_contact: Instant::now(),
            votes_granted: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight: HashSet::new(),
            leader_contact: HashMap::new(),
            pending: BTreeMap::new(),
            config_pending: BTreeMap::new(),
            election_deadline,
            api_rx,
            rpc_rx,
            events_tx,
            events_rx,
        };
        let runtime = tokio::spawn(node.run());

        Ok(Self {
            api_tx,
            shared,
            shutdown,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Propose a command and wait for it to commit and apply, up to
    /// `timeout`. Only succeeds on the leader.
    pub async fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<F::Response, Error> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(ApiMessage::Apply { data, tx })
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Form a single-voter cluster out of this fresh node.
    pub async fn bootstrap_cluster(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(ApiMessage::Bootstrap { tx })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Add (or re-address) a voter. Waits for the configuration change to
    /// commit.
    pub async fn add_voter(&self, id: ServerId, addr: ServerAddress) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(ApiMessage::AddVoter { id, addr, tx })
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(Duration::from_secs(10), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Remove a server from the voting configuration.
    pub async fn remove_server(&self, id: ServerId) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(ApiMessage::RemoveServer { id, tx })
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(Duration::from_secs(10), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// The leader this node currently believes in, if any.
    pub fn leader(&self) -> Option<(ServerId, ServerAddress)> {
        self.shared.leader_tx.borrow().clone()
    }

    /// Block until some node is known to be leader, or `timeout` elapses.
    pub async fn wait_for_leader(
        &self,
        timeout: Duration,
    ) -> Result<(ServerId, ServerAddress), Error> {
        let mut rx = self.shared.leader_tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|l| l.is_some())).await;
        match result {
            Ok(Ok(leader)) => leader.clone().ok_or(Error::Timeout),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    /// The address peers use to reach this node's consensus transport.
    pub fn local_addr(&self) -> &str {
        &self.shared.local_addr
    }

    /// Stop the runtime and wait for it to wind down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        if let Some(handle) = self.runtime.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

struct Node<F: Fsm> {
    config: Config,
    fsm: F,
    logs: Arc<dyn LogStore>,
    stable: Arc<dyn StableStore>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<NetworkTransport>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,

    role: Role,
    current_term: u64,
    voted_for: Option<ServerId>,
    commit_index: u64,
    last_applied: u64,

    last_snapshot_index: u64,
    last_snapshot_term: u64,

    configuration: proto::Configuration,
    configuration_index: u64,

    leader: Option<(ServerId, ServerAddress)>,
    /// When the current leader was last heard from.
    last_contact: Instant,

    votes_granted: HashSet<ServerId>,

    next_index: HashMap<ServerId, u64>,
    match_index: HashMap<ServerId, u64>,
    inflight: HashSet<ServerId>,
    leader_contact: HashMap<ServerId, Instant>,

    pending: BTreeMap<u64, oneshot::Sender<Result<F::Response, Error>>>,
    config_pending: BTreeMap<u64, oneshot::Sender<Result<(), Error>>>,

    election_deadline: Instant,

    api_rx: mpsc::UnboundedReceiver<ApiMessage<F::Response>>,
    rpc_rx: mpsc::Receiver<RpcMessage>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

fn random_timeout(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
    base + Duration::from_millis(jitter)
}

impl<F: Fsm> Node<F> {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.commit_timeout);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot_tick = tokio::time::interval(self.config.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.api_rx.recv() => match msg {
                    Some(msg) => self.handle_api(msg),
                    // Every handle is gone; wind down.
                    None => break,
                },
                Some(msg) = self.rpc_rx.recv() => self.handle_rpc(msg),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tokio::time::sleep_until(self.election_deadline),
                    if self.role != Role::Leader => self.election_timeout_elapsed(),
                _ = heartbeat.tick(), if self.role == Role::Leader => self.heartbeat(),
                _ = snapshot_tick.tick() => self.maybe_snapshot(),
            }
        }

        self.shutdown.cancel();
        self.fail_pending(Error::Shutdown);
        debug!(id = %self.shared.local_id, "runtime stopped");
    }

    // ---- role and term bookkeeping -------------------------------------

    fn quorum(&self) -> usize {
        self.configuration.servers.len() / 2 + 1
    }

    fn is_voter(&self, id: &str) -> bool {
        self.configuration.servers.iter().any(|s| s.id == id)
    }

    fn addr_of(&self, id: &str) -> Option<ServerAddress> {
        self.configuration
            .servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.address.clone())
    }

    fn set_leader(&mut self, leader: Option<(ServerId, ServerAddress)>) {
        if self.leader != leader {
            self.leader = leader.clone();
            self.shared.leader_tx.send_replace(leader);
        }
    }

    fn persist_term(&mut self) {
        if let Err(e) = self.stable.set_u64(KEY_CURRENT_TERM, self.current_term) {
            error!("failed to persist current term: {e}");
        }
        let voted = self.voted_for.clone().unwrap_or_default();
        if let Err(e) = self.stable.set(KEY_VOTED_FOR, voted.as_bytes()) {
            error!("failed to persist vote: {e}");
        }
    }

    /// Observe a higher term: adopt it and fall back to follower.
    fn step_down(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_term();
        }
        if self.role == Role::Leader {
            self.fail_pending(Error::NotLeader {
                leader: self.leader.clone(),
            });
        }
        self.role = Role::Follower;
        self.set_leader(None);
        self.votes_granted.clear();
        self.reset_election_deadline(self.config.heartbeat_timeout);
    }

    fn fail_pending(&mut self, err: Error) {
        // Error is not Clone; rebuild a comparable value per waiter.
        let describe = |e: &Error| match e {
            Error::NotLeader { leader } => Error::NotLeader {
                leader: leader.clone(),
            },
            Error::Shutdown => Error::Shutdown,
            _ => Error::Shutdown,
        };
        for (_, tx) in std::mem::take(&mut self.pending) {
            let _ = tx.send(Err(describe(&err)));
        }
        for (_, tx) in std::mem::take(&mut self.config_pending) {
            let _ = tx.send(Err(describe(&err)));
        }
    }

    fn reset_election_deadline(&mut self, base: Duration) {
        self.election_deadline = Instant::now() + random_timeout(base);
    }

    fn last_log_index(&self) -> u64 {
        self.logs
            .last_index()
            .unwrap_or(0)
            .max(self.last_snapshot_index)
    }

    fn term_at(&self, index: u64) -> Result<u64, Error> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.last_snapshot_index {
            return Ok(self.last_snapshot_term);
        }
        Ok(self.logs.get_log(index)?.term)
    }

    // ---- client-facing messages ----------------------------------------

    fn handle_api(&mut self, msg: ApiMessage<F::Response>) {
        match msg {
            ApiMessage::Apply { data, tx } => {
                if self.role != Role::Leader {
                    let _ = tx.send(Err(Error::NotLeader {
                        leader: self.leader.clone(),
                    }));
                    return;
                }
                match self.append_local(EntryKind::Command, data) {
                    Ok(index) => {
                        self.pending.insert(index, tx);
                        self.post_append();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
            ApiMessage::AddVoter { id, addr, tx } => {
                if self.role != Role::Leader {
                    let _ = tx.send(Err(Error::NotLeader {
                        leader: self.leader.clone(),
                    }));
                    return;
                }
                let mut servers = self.configuration.servers.clone();
                if servers.iter().any(|s| s.id == id && s.address == addr) {
                    let _ = tx.send(Ok(()));
                    return;
                }
                servers.retain(|s| s.id != id);
                servers.push(proto::Server {
                    id: id.clone(),
                    address: addr,
                });
                match self.append_configuration(servers) {
                    Ok(index) => {
                        info!(%id, "adding voter");
                        self.next_index.insert(id.clone(), self.last_log_index() + 1);
                        self.match_index.insert(id.clone(), 0);
                        // Grace period before the lease check may count the
                        // newcomer against the quorum.
                        self.leader_contact.insert(id, Instant::now());
                        self.config_pending.insert(index, tx);
                        self.post_append();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
            ApiMessage::RemoveServer { id, tx } => {
                if self.role != Role::Leader {
                    let _ = tx.send(Err(Error::NotLeader {
                        leader: self.leader.clone(),
                    }));
                    return;
                }
                if !self.is_voter(&id) {
                    let _ = tx.send(Ok(()));
                    return;
                }
                let mut servers = self.configuration.servers.clone();
                servers.retain(|s| s.id != id);
                match self.append_configuration(servers) {
                    Ok(index) => {
                        info!(%id, "removing server");
                        self.next_index.remove(&id);
                        self.match_index.remove(&id);
                        self.inflight.remove(&id);
                        self.config_pending.insert(index, tx);
                        self.post_append();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
            ApiMessage::Bootstrap { tx } => {
                let _ = tx.send(self.bootstrap());
            }
        }
    }

    fn append_local(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<u64, Error> {
        let index = self.last_log_index() + 1;
        self.logs.store_logs(&[LogEntry {
            index,
            term: self.current_term,
            kind,
            data,
        }])?;
        Ok(index)
    }

    fn append_configuration(&mut self, servers: Vec<proto::Server>) -> Result<u64, Error> {
        let configuration = proto::Configuration { servers };
        let index = self.append_local(EntryKind::Configuration, configuration.encode_to_vec())?;
        // Effective as soon as it is appended, not when it commits.
        self.configuration = configuration;
        self.configuration_index = index;
        Ok(index)
    }

    fn post_append(&mut self) {
        self.advance_commit();
        self.broadcast_append();
    }

    fn bootstrap(&mut self) -> Result<(), Error> {
        if self.last_log_index() > 0 || self.current_term > 0 || self.last_snapshot_index > 0 {
            return Err(Error::CantBootstrap);
        }
        let configuration = proto::Configuration {
            servers: vec![proto::Server {
                id: self.shared.local_id.clone(),
                address: self.shared.local_addr.clone(),
            }],
        };
        self.logs.store_logs(&[LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Configuration,
            data: configuration.encode_to_vec(),
        }])?;
        self.current_term = 1;
        self.persist_term();
        self.configuration = configuration;
        self.configuration_index = 1;
        info!(id = %self.shared.local_id, "bootstrapped single-voter cluster");
        // Run for leadership without waiting out a full timeout.
        self.election_deadline = Instant::now();
        Ok(())
    }

    // ---- elections -----------------------------------------------------

    fn election_timeout_elapsed(&mut self) {
        if !self.is_voter(&self.shared.local_id) {
            // Not part of the cluster (yet); keep waiting for contact.
            self.reset_election_deadline(self.config.heartbeat_timeout);
            return;
        }

        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.shared.local_id.clone());
        self.persist_term();
        self.set_leader(None);
        self.votes_granted.clear();
        self.votes_granted.insert(self.shared.local_id.clone());
        self.reset_election_deadline(self.config.election_timeout);
        debug!(term = self.current_term, "starting election");

        if self.votes_granted.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let last_log_index = self.last_log_index();
        let last_log_term = self.term_at(last_log_index).unwrap_or(0);
        let request = proto::VoteRequest {
            term: self.current_term,
            candidate_id: self.shared.local_id.clone(),
            last_log_index,
            last_log_term,
        };

        for server in &self.configuration.servers {
            if server.id == self.shared.local_id {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let events = self.events_tx.clone();
            let peer = server.id.clone();
            let addr = server.address.clone();
            let term = self.current_term;
            let request = request.clone();
            tokio::spawn(async move {
                let result = transport.vote(&addr, request).await;
                let _ = events.send(Event::VoteResult { term, peer, result });
            });
        }
    }

    fn become_leader(&mut self) {
        info!(term = self.current_term, id = %self.shared.local_id, "became leader");
        self.role = Role::Leader;
        self.set_leader(Some((
            self.shared.local_id.clone(),
            self.shared.local_addr.clone(),
        )));

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        self.leader_contact.clear();
        // The election itself counts as contact, otherwise the first lease
        // check could depose the leader before any response arrives.
        let now = Instant::now();
        for server in &self.configuration.servers {
            if server.id != self.shared.local_id {
                self.next_index.insert(server.id.clone(), next);
                self.match_index.insert(server.id.clone(), 0);
                self.leader_contact.insert(server.id.clone(), now);
            }
        }
        self.inflight.clear();

        // A no-op in the new term lets entries from earlier terms commit.
        match self.append_local(EntryKind::Noop, Vec::new()) {
            Ok(_) => self.post_append(),
            Err(e) => error!("failed to append no-op: {e}"),
        }
    }

    fn heartbeat(&mut self) {
        if !self.check_lease() {
            return;
        }
        let peers: Vec<ServerId> = self
            .configuration
            .servers
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| *id != self.shared.local_id)
            .collect();
        for peer in peers {
            self.send_append(&peer);
        }
    }

    /// Step down when a quorum has been out of contact for too long.
    fn check_lease(&mut self) -> bool {
        let lease = self.config.leader_lease_timeout;
        let now = Instant::now();
        let contacted = self
            .configuration
            .servers
            .iter()
            .filter(|s| {
                s.id == self.shared.local_id
                    || self
                        .leader_contact
                        .get(&s.id)
                        .is_some_and(|at| now.duration_since(*at) < lease)
            })
            .count();
        if contacted < self.quorum() && self.configuration.servers.len() > 1 {
            warn!("lost contact with quorum; stepping down");
            self.step_down(self.current_term);
            return false;
        }
        true
    }

    // ---- replication (leader side) -------------------------------------

    fn broadcast_append(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let peers: Vec<ServerId> = self
            .configuration
            .servers
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| *id != self.shared.local_id)
            .collect();
        for peer in peers {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &str) {
        if self.inflight.contains(peer) {
            return;
        }
        let Some(addr) = self.addr_of(peer) else {
            return;
        };

        let last = self.last_log_index();
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(last + 1)
            .max(1);

        if next <= self.last_snapshot_index {
            self.send_snapshot(peer, addr);
            return;
        }

        let prev_log_index = next - 1;
        let prev_log_term = match self.term_at(prev_log_index) {
            Ok(term) => term,
            Err(Error::LogNotFound(_)) => {
                self.send_snapshot(peer, addr);
                return;
            }
            Err(e) => {
                error!("failed to read log term: {e}");
                return;
            }
        };

        let high = last.min(next.saturating_add(self.config.max_append_entries as u64 - 1));
        let mut entries = Vec::new();
        for index in next..=high {
            match self.logs.get_log(index) {
                Ok(entry) => entries.push(proto::Entry::from(entry)),
                Err(Error::LogNotFound(_)) => {
                    self.send_snapshot(peer, addr);
                    return;
                }
                Err(e) => {
                    error!("failed to read log entry {index}: {e}");
                    return;
                }
            }
        }
        let last_index_sent = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

        let request = proto::AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.shared.local_id.clone(),
            leader_address: self.shared.local_addr.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        self.inflight.insert(peer.to_string());
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let peer = peer.to_string();
        let term = self.current_term;
        tokio::spawn(async move {
            let result = transport.append_entries(&addr, request).await;
            let _ = events.send(Event::AppendResult {
                peer,
                term,
                last_index_sent,
                result,
            });
        });
    }

    fn send_snapshot(&mut self, peer: &str, addr: ServerAddress) {
        let meta = match self.snapshots.list() {
            Ok(metas) => metas.into_iter().next(),
            Err(e) => {
                error!("failed to list snapshots: {e}");
                return;
            }
        };
        let Some(meta) = meta else {
            warn!(%peer, "peer needs a snapshot but none exists");
            return;
        };

        self.inflight.insert(peer.to_string());
        let snapshots = Arc::clone(&self.snapshots);
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let peer = peer.to_string();
        let term = self.current_term;
        let leader_id = self.shared.local_id.clone();
        let leader_address = self.shared.local_addr.clone();
        info!(%peer, index = meta.index, "shipping snapshot");
        tokio::spawn(async move {
            let result = async {
                let (meta, mut reader) = snapshots.open(&meta.id)?;
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                let request = proto::InstallSnapshotRequest {
                    term,
                    leader_id,
                    leader_address,
                    last_index: meta.index,
                    last_term: meta.term,
                    configuration: Some(meta.configuration()),
                    data,
                };
                transport.install_snapshot(&addr, request).await
            }
            .await;
            let _ = events.send(Event::SnapshotResult {
                peer,
                term,
                snapshot_index: meta.index,
                result,
            });
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AppendResult {
                peer,
                term,
                last_index_sent,
                result,
            } => {
                self.inflight.remove(&peer);
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        trace!(%peer, "append failed: {e}");
                        return;
                    }
                };
                if response.term > self.current_term {
                    self.step_down(response.term);
                    return;
                }
                if self.role != Role::Leader || term != self.current_term {
                    return;
                }
                self.leader_contact.insert(peer.clone(), Instant::now());
                if response.success {
                    self.next_index.insert(peer.clone(), last_index_sent + 1);
                    self.match_index.insert(peer.clone(), last_index_sent);
                    self.advance_commit();
                    if last_index_sent < self.last_log_index() {
                        self.send_append(&peer);
                    }
                } else {
                    let current = self.next_index.get(&peer).copied().unwrap_or(1);
                    let next = current
                        .saturating_sub(1)
                        .min(response.last_log_index + 1)
                        .max(1);
                    self.next_index.insert(peer.clone(), next);
                    self.send_append(&peer);
                }
            }
            Event::VoteResult { term, peer, result } => {
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        trace!(%peer, "vote request failed: {e}");
                        return;
                    }
                };
                if response.term > self.current_term {
                    self.step_down(response.term);
                    return;
                }
                if self.role != Role::Candidate || term != self.current_term {
                    return;
                }
                if response.granted {
                    self.votes_granted.insert(peer);
                    if self.votes_granted.len() >= self.quorum() {
                        self.become_leader();
                    }
                }
            }
            Event::SnapshotResult {
                peer,
                term,
                snapshot_index,
                result,
            } => {
                self.inflight.remove(&peer);
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        trace!(%peer, "snapshot install failed: {e}");
                        return;
                    }
                };
                if response.term > self.current_term {
                    self.step_down(response.term);
                    return;
                }
                if self.role != Role::Leader || term != self.current_term {
                    return;
                }
                self.leader_contact.insert(peer.clone(), Instant::now());
                if response.success {
                    self.next_index.insert(peer.clone(), snapshot_index + 1);
                    self.match_index.insert(peer.clone(), snapshot_index);
                    self.advance_commit();
                    if snapshot_index < self.last_log_index() {
                        self.send_append(&peer);
                    }
                }
            }
        }
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader || self.configuration.servers.is_empty() {
            return;
        }
        let mut indexes: Vec<u64> = self
            .configuration
            .servers
            .iter()
            .map(|s| {
                if s.id == self.shared.local_id {
                    self.last_log_index()
                } else {
                    self.match_index.get(&s.id).copied().unwrap_or(0)
                }
            })
            .collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indexes[self.quorum() - 1];

        // Only entries of the current term commit by counting.
        if candidate > self.commit_index && self.term_at(candidate).unwrap_or(0) == self.current_term
        {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            if index <= self.last_snapshot_index {
                self.last_applied = self.last_snapshot_index;
                continue;
            }
            let entry = match self.logs.get_log(index) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("cannot apply entry {index}: {e}");
                    return;
                }
            };
            match entry.kind {
                EntryKind::Command => {
                    let response = self.fsm.apply(&entry);
                    if let Some(tx) = self.pending.remove(&index) {
                        let _ = tx.send(Ok(response));
                    }
                }
                EntryKind::Configuration => {
                    if let Some(tx) = self.config_pending.remove(&index) {
                        let _ = tx.send(Ok(()));
                    }
                    if self.role == Role::Leader && !self.is_voter(&self.shared.local_id) {
                        info!("removed from the cluster; stepping down");
                        self.step_down(self.current_term);
                        return;
                    }
                }
                EntryKind::Noop => {}
            }
            self.last_applied = index;
            if let Err(e) = self.stable.set_u64(KEY_LAST_APPLIED, index) {
                warn!("failed to persist apply cursor: {e}");
            }
        }
    }

    // ---- inbound rpcs --------------------------------------------------

    fn handle_rpc(&mut self, msg: RpcMessage) {
        let response = match msg.request {
            Rpc::Vote(req) => Rpc::VoteResponse(self.handle_vote(req)),
            Rpc::AppendEntries(req) => {
                Rpc::AppendEntriesResponse(self.handle_append_entries(req))
            }
            Rpc::InstallSnapshot(req) => {
                Rpc::InstallSnapshotResponse(self.handle_install_snapshot(req))
            }
            other => {
                warn!("ignoring response frame arriving as a request: {other:?}");
                return;
            }
        };
        let _ = msg.reply.send(response);
    }

    fn handle_vote(&mut self, req: proto::VoteRequest) -> proto::VoteResponse {
        // A server with a fresh leader refuses to be deposed by a stray
        // candidate, such as one that was just removed from the cluster.
        // The reply does not adopt the candidate's term.
        let leader_is_fresh = match self.role {
            Role::Leader => true,
            _ => {
                self.leader.is_some()
                    && self.last_contact.elapsed() < self.config.heartbeat_timeout
            }
        };
        let from_leader = self
            .leader
            .as_ref()
            .is_some_and(|(id, _)| *id == req.candidate_id);
        if leader_is_fresh && !from_leader {
            debug!(candidate = %req.candidate_id, "rejecting vote; leader is current");
            return proto::VoteResponse {
                term: self.current_term,
                granted: false,
            };
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        let mut granted = false;
        if req.term == self.current_term {
            let last_log_index = self.last_log_index();
            let last_log_term = self.term_at(last_log_index).unwrap_or(0);
            let up_to_date = req.last_log_term > last_log_term
                || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
            let can_vote = match &self.voted_for {
                None => true,
                Some(candidate) => *candidate == req.candidate_id,
            };
            if up_to_date && can_vote {
                granted = true;
                self.voted_for = Some(req.candidate_id.clone());
                self.persist_term();
                self.reset_election_deadline(self.config.heartbeat_timeout);
                debug!(candidate = %req.candidate_id, term = req.term, "granted vote");
            }
        }

        proto::VoteResponse {
            term: self.current_term,
            granted,
        }
    }

    fn handle_append_entries(
        &mut self,
        req: proto::AppendEntriesRequest,
    ) -> proto::AppendEntriesResponse {
        let failure = |term: u64, last: u64| proto::AppendEntriesResponse {
            term,
            success: false,
            last_log_index: last,
        };

        if req.term < self.current_term {
            return failure(self.current_term, self.last_log_index());
        }
        if req.term > self.current_term {
            self.step_down(req.term);
        }
        self.role = Role::Follower;
        self.votes_granted.clear();
        self.set_leader(Some((req.leader_id.clone(), req.leader_address.clone())));
        self.last_contact = Instant::now();
        self.reset_election_deadline(self.config.heartbeat_timeout);

        // The entry before the shipped batch must match, or the leader has
        // to walk back.
        if req.prev_log_index > 0 && req.prev_log_index != self.last_snapshot_index {
            match self.logs.get_log(req.prev_log_index) {
                Ok(entry) if entry.term == req.prev_log_term => {}
                Ok(_) | Err(Error::LogNotFound(_)) => {
                    return failure(self.current_term, self.last_log_index());
                }
                Err(e) => {
                    error!("failed to check log consistency: {e}");
                    return failure(self.current_term, self.last_log_index());
                }
            }
        }

        let mut to_store: Vec<LogEntry> = Vec::new();
        for entry in req.entries {
            let entry = LogEntry::from(entry);
            if entry.index <= self.last_snapshot_index {
                continue;
            }
            if !to_store.is_empty() {
                to_store.push(entry);
                continue;
            }
            match self.logs.get_log(entry.index) {
                Ok(existing) if existing.term == entry.term => {}
                Ok(_) => {
                    // A conflicting suffix from a deposed leader; discard it.
                    let last = self.last_log_index();
                    if let Err(e) = self.logs.delete_range(entry.index, last) {
                        error!("failed to discard conflicting entries: {e}");
                        return failure(self.current_term, self.last_log_index());
                    }
                    to_store.push(entry);
                }
                Err(Error::LogNotFound(_)) => to_store.push(entry),
                Err(e) => {
                    error!("failed to read log entry: {e}");
                    return failure(self.current_term, self.last_log_index());
                }
            }
        }
        if !to_store.is_empty() {
            if let Err(e) = self.logs.store_logs(&to_store) {
                error!("failed to store entries: {e}");
                return failure(self.current_term, self.last_log_index());
            }
            for entry in &to_store {
                if entry.kind == EntryKind::Configuration {
                    match proto::Configuration::decode(&entry.data[..]) {
                        Ok(configuration) => {
                            self.configuration = configuration;
                            self.configuration_index = entry.index;
                        }
                        Err(e) => error!("undecodable configuration entry: {e}"),
                    }
                }
            }
        }

        let last = self.last_log_index();
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last);
            self.apply_committed();
        }

        proto::AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_log_index: last,
        }
    }

    fn handle_install_snapshot(
        &mut self,
        req: proto::InstallSnapshotRequest,
    ) -> proto::InstallSnapshotResponse {
        if req.term < self.current_term {
            return proto::InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            };
        }
        if req.term > self.current_term {
            self.step_down(req.term);
        }
        self.role = Role::Follower;
        self.set_leader(Some((req.leader_id.clone(), req.leader_address.clone())));
        self.last_contact = Instant::now();
        self.reset_election_deadline(self.config.heartbeat_timeout);

        if req.last_index <= self.last_snapshot_index {
            return proto::InstallSnapshotResponse {
                term: self.current_term,
                success: true,
            };
        }

        info!(index = req.last_index, "installing snapshot");
        let configuration = req.configuration.clone().unwrap_or_default();

        // Keep a local copy so this node can in turn seed others.
        let stored = self
            .snapshots
            .create(req.last_index, req.last_term, &configuration)
            .and_then(|mut sink| {
                use std::io::Write as _;
                sink.write_all(&req.data)?;
                sink.close()
            });
        if let Err(e) = stored {
            error!("failed to store shipped snapshot: {e}");
            return proto::InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            };
        }

        if let Err(e) = self.fsm.restore(Box::new(std::io::Cursor::new(req.data))) {
            error!("failed to restore state machine: {e}");
            return proto::InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            };
        }

        self.last_snapshot_index = req.last_index;
        self.last_snapshot_term = req.last_term;
        self.last_applied = req.last_index;
        self.commit_index = self.commit_index.max(req.last_index);
        if let Err(e) = self.stable.set_u64(KEY_LAST_APPLIED, self.last_applied) {
            warn!("failed to persist apply cursor: {e}");
        }
        self.configuration = configuration;
        self.configuration_index = req.last_index;

        // Everything the snapshot covers is no longer needed in the log.
        let first = self.logs.first_index().unwrap_or(0);
        if first > 0 {
            if let Err(e) = self.logs.delete_range(first, req.last_index) {
                warn!("failed to compact log after snapshot install: {e}");
            }
        }

        proto::InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        }
    }

    // ---- snapshots (local) ---------------------------------------------

    fn maybe_snapshot(&mut self) {
        let outstanding = self.last_applied.saturating_sub(self.last_snapshot_index);
        if outstanding < self.config.snapshot_threshold {
            return;
        }
        let index = self.last_applied;
        let term = match self.term_at(index) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot determine snapshot term: {e}");
                return;
            }
        };

        info!(index, "taking snapshot");
        let mut capture = match self.fsm.snapshot() {
            Ok(capture) => capture,
            Err(e) => {
                error!("state machine refused to snapshot: {e}");
                return;
            }
        };
        let mut sink = match self.snapshots.create(index, term, &self.configuration) {
            Ok(sink) => sink,
            Err(e) => {
                error!("failed to create snapshot sink: {e}");
                return;
            }
        };
        match capture.persist(sink.as_mut()) {
            Ok(()) => {
                if let Err(e) = sink.close() {
                    error!("failed to finalize snapshot: {e}");
                    return;
                }
            }
            Err(e) => {
                error!("failed to persist snapshot: {e}");
                let _ = sink.cancel();
                return;
            }
        }
        capture.release();

        self.last_snapshot_index = index;
        self.last_snapshot_term = term;

        let first = self.logs.first_index().unwrap_or(0);
        if first > 0 {
            if let Err(e) = self.logs.delete_range(first, index) {
                warn!("failed to compact log after snapshot: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex as StdMutex, time::Duration};

    use super::*;
    use crate::{
        log::mem::MemLogStore, snapshot::FileSnapshotStore, stable::mem::MemStableStore,
        transport::TcpStreamLayer, FsmSnapshot, SnapshotSink,
    };

    #[derive(Default)]
    struct VecFsm {
        applied: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    struct VecSnapshot {
        data: Vec<u8>,
    }

    impl FsmSnapshot for VecSnapshot {
        fn persist(&mut self, sink: &mut dyn SnapshotSink) -> Result<(), Error> {
            use std::io::Write as _;
            sink.write_all(&self.data)?;
            Ok(())
        }
    }

    impl Fsm for VecFsm {
        type Response = u64;

        fn apply(&mut self, entry: &LogEntry) -> u64 {
            let mut applied = self.applied.lock().unwrap();
            applied.push(entry.data.clone());
            applied.len() as u64
        }

        fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>, Error> {
            let applied = self.applied.lock().unwrap();
            let data = serde_json::to_vec(&*applied).map_err(Error::storage)?;
            Ok(Box::new(VecSnapshot { data }))
        }

        fn restore(&mut self, mut reader: Box<dyn io::Read + Send>) -> Result<(), Error> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            *self.applied.lock().unwrap() =
                serde_json::from_slice(&data).map_err(Error::storage)?;
            Ok(())
        }
    }

    struct TestNode {
        raft: Raft<VecFsm>,
        applied: Arc<StdMutex<Vec<Vec<u8>>>>,
        _tmp: tempfile::TempDir,
    }

    async fn spawn_node(i: usize) -> TestNode {
        let tmp = tempfile::tempdir().unwrap();
        let fsm = VecFsm::default();
        let applied = Arc::clone(&fsm.applied);

        let mut config = Config::new(format!("node-{i}"));
        config.heartbeat_timeout = Duration::from_millis(200);
        config.election_timeout = Duration::from_millis(200);
        config.leader_lease_timeout = Duration::from_millis(600);
        config.commit_timeout = Duration::from_millis(25);

        let layer = TcpStreamLayer::bind("127.0.0.1:0").await.unwrap();
        let raft = Raft::new(
            config,
            fsm,
            Arc::new(MemLogStore::default()),
            Arc::new(MemStableStore::default()),
            Arc::new(FileSnapshotStore::new(tmp.path().join("snapshots"), 1).unwrap()),
            Box::new(layer),
        )
        .unwrap();

        TestNode {
            raft,
            applied,
            _tmp: tmp,
        }
    }

    async fn eventually<T>(
        timeout: Duration,
        mut probe: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = probe() {
                return Some(value);
            }
            if tokio::time::Instant::now() > deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_applies_after_bootstrap() {
        let node = spawn_node(0).await;
        node.raft.bootstrap_cluster().await.unwrap();
        node.raft
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let count = node
            .raft
            .apply(b"hello".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(node.applied.lock().unwrap().as_slice(), &[b"hello".to_vec()]);

        node.raft.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_twice_fails() {
        let node = spawn_node(0).await;
        node.raft.bootstrap_cluster().await.unwrap();
        assert!(matches!(
            node.raft.bootstrap_cluster().await,
            Err(Error::CantBootstrap)
        ));
        node.raft.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn follower_rejects_apply_with_leader_hint() {
        let leader = spawn_node(0).await;
        leader.raft.bootstrap_cluster().await.unwrap();
        leader
            .raft
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let follower = spawn_node(1).await;
        leader
            .raft
            .add_voter(
                follower.raft.local_id().to_string(),
                follower.raft.local_addr().to_string(),
            )
            .await
            .unwrap();

        follower
            .raft
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let err = follower
            .raft
            .apply(b"nope".to_vec(), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            Error::NotLeader { leader: Some((id, addr)) } => {
                assert_eq!(id, leader.raft.local_id());
                assert_eq!(addr, leader.raft.local_addr());
            }
            other => panic!("expected a leader hint, got {other:?}"),
        }

        leader.raft.shutdown().await.unwrap();
        follower.raft.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn three_nodes_replicate_and_fail_over() {
        let n0 = spawn_node(0).await;
        n0.raft.bootstrap_cluster().await.unwrap();
        n0.raft.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let n1 = spawn_node(1).await;
        let n2 = spawn_node(2).await;
        for n in [&n1, &n2] {
            n0.raft
                .add_voter(n.raft.local_id().to_string(), n.raft.local_addr().to_string())
                .await
                .unwrap();
        }

        for i in 0..3u8 {
            n0.raft
                .apply(vec![i], Duration::from_secs(5))
                .await
                .unwrap();
        }

        for n in [&n0, &n1, &n2] {
            let got = eventually(Duration::from_secs(5), || {
                let applied = n.applied.lock().unwrap();
                (applied.len() == 3).then(|| applied.clone())
            })
            .await
            .expect("entries did not replicate in time");
            assert_eq!(got, vec![vec![0], vec![1], vec![2]]);
        }

        // Kill the leader; the survivors hold a quorum and elect a new one.
        n0.raft.shutdown().await.unwrap();
        let leader = eventually(Duration::from_secs(10), || {
            n1.raft
                .leader()
                .or_else(|| n2.raft.leader())
                .filter(|(id, _)| id != "node-0")
        })
        .await
        .expect("no new leader emerged");

        let survivor = if leader.0 == n1.raft.local_id() { &n1 } else { &n2 };
        survivor
            .raft
            .apply(vec![9], Duration::from_secs(5))
            .await
            .unwrap();

        n1.raft.shutdown().await.unwrap();
        n2.raft.shutdown().await.unwrap();
    }
}
