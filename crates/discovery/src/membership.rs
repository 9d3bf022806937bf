use std::{collections::HashMap, io, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::seq::SliceRandom as _;
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{Handler, HandlerError};

/// Membership configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique name this node advertises.
    pub node_name: String,
    /// UDP address the gossip socket binds to.
    pub bind_addr: String,
    /// Arbitrary metadata gossiped along with the member; `rpc_addr` is
    /// what handlers receive as the member's address.
    pub tags: HashMap<String, String>,
    /// Existing members to contact on startup. Empty for the first node.
    pub start_join_addrs: Vec<String>,
    /// How often a random peer is probed.
    pub probe_interval: Duration,
    /// Silence from a member before it is declared failed.
    pub failure_timeout: Duration,
}

impl Config {
    pub fn new(node_name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr: bind_addr.into(),
            tags: HashMap::new(),
            start_join_addrs: Vec::new(),
            probe_interval: Duration::from_millis(500),
            failure_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

/// A node as seen through gossip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip (UDP) address.
    pub addr: String,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    /// Refutation counter: a member that hears rumors of its own demise
    /// reasserts itself with a higher incarnation.
    pub incarnation: u64,
}

impl Member {
    pub fn rpc_addr(&self) -> &str {
        self.tags.get("rpc_addr").map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Gossip {
    /// First contact; the receiver replies with a full state sync.
    Join { from: Member },
    Sync { members: Vec<Member> },
    Ping { from: Member, members: Vec<Member> },
    Ack { from: Member, members: Vec<Member> },
    Leave { name: String, incarnation: u64 },
}

enum Observation {
    Joined(Member),
    Left(String),
}

struct State {
    members: HashMap<String, Member>,
    last_heard: HashMap<String, Instant>,
}

/// SWIM-style gossip membership over UDP.
///
/// Periodically pings a random live peer, piggybacking the full member
/// list; a member that stays silent past the failure timeout is declared
/// failed. Joins and leaves of non-local members are reported to the
/// registered [`Handler`].
pub struct Membership {
    config: Config,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<State>>,
    shutdown: CancellationToken,
}

impl Membership {
    pub async fn new(handler: Arc<dyn Handler>, config: Config) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        let local_addr = socket.local_addr()?.to_string();

        let local = Member {
            name: config.node_name.clone(),
            addr: local_addr,
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
            incarnation: 0,
        };
        let mut members = HashMap::new();
        members.insert(local.name.clone(), local.clone());
        let state = Arc::new(Mutex::new(State {
            members,
            last_heard: HashMap::new(),
        }));

        let membership = Self {
            config,
            socket,
            state,
            shutdown: CancellationToken::new(),
        };

        for seed in &membership.config.start_join_addrs {
            membership
                .send(seed, &Gossip::Join { from: local.clone() })
                .await;
        }

        membership.spawn_gossip(handler);

        Ok(membership)
    }

    /// All members this node currently knows about, itself included.
    pub fn members(&self) -> Vec<Member> {
        self.state.lock().members.values().cloned().collect()
    }

    /// The address of the local gossip socket.
    pub fn local_addr(&self) -> io::Result<String> {
        Ok(self.socket.local_addr()?.to_string())
    }

    /// Announce departure to the cluster and stop gossiping.
    pub async fn leave(&self) -> io::Result<()> {
        let (leave, peers) = {
            let mut state = self.state.lock();
            let incarnation = state
                .members
                .get_mut(&self.config.node_name)
                .map(|local| {
                    local.status = MemberStatus::Left;
                    local.incarnation += 1;
                    local.incarnation
                })
                .unwrap_or_default();
            let peers: Vec<String> = state
                .members
                .values()
                .filter(|m| m.name != self.config.node_name && m.status == MemberStatus::Alive)
                .map(|m| m.addr.clone())
                .collect();
            (
                Gossip::Leave {
                    name: self.config.node_name.clone(),
                    incarnation,
                },
                peers,
            )
        };
        for peer in peers {
            self.send(&peer, &leave).await;
        }
        self.shutdown.cancel();
        Ok(())
    }

    async fn send(&self, addr: &str, message: &Gossip) {
        send_message(&self.socket, addr, message).await;
    }

    fn spawn_gossip(&self, handler: Arc<dyn Handler>) {
        let config = self.config.clone();
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut probe = tokio::time::interval(config.probe_interval);
            probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut buf = vec![0u8; 64 * 1024];

            loop {
                let observations = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = socket.recv_from(&mut buf) => {
                        let (len, src) = match received {
                            Ok(received) => received,
                            Err(e) => {
                                warn!("gossip socket error: {e}");
                                continue;
                            }
                        };
                        let message = match serde_json::from_slice(&buf[..len]) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!(%src, "dropping undecodable gossip: {e}");
                                continue;
                            }
                        };
                        handle_message(&config, &socket, &state, message, src.to_string()).await
                    }
                    _ = probe.tick() => {
                        probe_peer(&config, &socket, &state).await;
                        sweep_failures(&config, &state)
                    }
                };

                for observation in observations {
                    dispatch(&config, handler.as_ref(), observation).await;
                }
            }
        });
    }
}

async fn dispatch(config: &Config, handler: &dyn Handler, observation: Observation) {
    let result = match &observation {
        Observation::Joined(member) => {
            trace!(name = %member.name, "member joined");
            handler.join(&member.name, member.rpc_addr()).await
        }
        Observation::Left(name) => {
            trace!(%name, "member left");
            handler.leave(name).await
        }
    };
    if let Err(e) = result {
        let name = match &observation {
            Observation::Joined(member) => member.name.as_str(),
            Observation::Left(name) => name.as_str(),
        };
        match e {
            // Followers cannot mutate the cluster; the leader will handle
            // the same event.
            HandlerError::NotLeader => debug!(%name, "failed to handle membership change: {e}"),
            e => error!(%name, "failed to handle membership change: {e}"),
        }
    }
}

async fn send_message(socket: &UdpSocket, addr: &str, message: &Gossip) {
    let bytes = match serde_json::to_vec(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to encode gossip: {e}");
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, addr).await {
        debug!(%addr, "failed to send gossip: {e}");
    }
}

async fn handle_message(
    config: &Config,
    socket: &UdpSocket,
    state: &Mutex<State>,
    message: Gossip,
    src: String,
) -> Vec<Observation> {
    match message {
        Gossip::Join { from } => {
            let (observations, members) = {
                let mut state = state.lock();
                state.last_heard.insert(from.name.clone(), Instant::now());
                let observations = merge(config, &mut state, vec![from]);
                (observations, state.members.values().cloned().collect())
            };
            send_message(socket, &src, &Gossip::Sync { members }).await;
            observations
        }
        Gossip::Sync { members } => {
            let mut state = state.lock();
            merge(config, &mut state, members)
        }
        Gossip::Ping { from, members } => {
            let (observations, reply) = {
                let mut state = state.lock();
                state.last_heard.insert(from.name.clone(), Instant::now());
                let mut incoming = members;
                incoming.push(from);
                let observations = merge(config, &mut state, incoming);
                let local = state.members.get(&config.node_name).cloned();
                let members: Vec<Member> = state.members.values().cloned().collect();
                (observations, local.map(|local| Gossip::Ack { from: local, members }))
            };
            if let Some(reply) = reply {
                send_message(socket, &src, &reply).await;
            }
            observations
        }
        Gossip::Ack { from, members } => {
            let mut state = state.lock();
            state.last_heard.insert(from.name.clone(), Instant::now());
            let mut incoming = members;
            incoming.push(from);
            merge(config, &mut state, incoming)
        }
        Gossip::Leave { name, incarnation } => {
            let mut state = state.lock();
            let mut observations = Vec::new();
            if let Some(member) = state.members.get_mut(&name) {
                if incarnation >= member.incarnation && member.status == MemberStatus::Alive {
                    member.status = MemberStatus::Left;
                    member.incarnation = incarnation;
                    if name != config.node_name {
                        observations.push(Observation::Left(name));
                    }
                }
            }
            observations
        }
    }
}

/// Fold gossiped member views into ours. Higher incarnations win; at equal
/// incarnation a death notice beats liveness, which is what makes failure
/// reports spread.
fn merge(config: &Config, state: &mut State, incoming: Vec<Member>) -> Vec<Observation> {
    let mut observations = Vec::new();

    for member in incoming {
        // Rumors of our own demise: refute by reasserting a higher
        // incarnation, which then outranks the rumor everywhere.
        if member.name == config.node_name {
            if member.status != MemberStatus::Alive {
                if let Some(local) = state.members.get_mut(&config.node_name) {
                    if local.status == MemberStatus::Alive
                        && member.incarnation >= local.incarnation
                    {
                        local.incarnation = member.incarnation + 1;
                    }
                }
            }
            continue;
        }

        match state.members.get_mut(&member.name) {
            None => {
                if member.status == MemberStatus::Alive {
                    observations.push(Observation::Joined(member.clone()));
                }
                state.members.insert(member.name.clone(), member);
            }
            Some(known) => {
                let supersedes = member.incarnation > known.incarnation
                    || (member.incarnation == known.incarnation
                        && member.status != MemberStatus::Alive
                        && known.status == MemberStatus::Alive);
                if !supersedes {
                    continue;
                }
                let was_alive = known.status == MemberStatus::Alive;
                let is_alive = member.status == MemberStatus::Alive;
                *known = member.clone();
                if !was_alive && is_alive {
                    observations.push(Observation::Joined(member));
                } else if was_alive && !is_alive {
                    observations.push(Observation::Left(member.name));
                }
            }
        }
    }

    observations
}

async fn probe_peer(config: &Config, socket: &UdpSocket, state: &Mutex<State>) {
    let (target, ping) = {
        let state = state.lock();
        let peers: Vec<&Member> = state
            .members
            .values()
            .filter(|m| m.name != config.node_name && m.status == MemberStatus::Alive)
            .collect();
        let Some(target) = peers.choose(&mut rand::thread_rng()) else {
            return;
        };
        let Some(local) = state.members.get(&config.node_name) else {
            return;
        };
        let members: Vec<Member> = state.members.values().cloned().collect();
        (
            target.addr.clone(),
            Gossip::Ping {
                from: local.clone(),
                members,
            },
        )
    };
    send_message(socket, &target, &ping).await;
}

fn sweep_failures(config: &Config, state: &Mutex<State>) -> Vec<Observation> {
    let mut state = state.lock();
    let now = Instant::now();
    let mut observations = Vec::new();

    let overdue: Vec<String> = state
        .members
        .values()
        .filter(|m| m.name != config.node_name && m.status == MemberStatus::Alive)
        .filter(|m| {
            state
                .last_heard
                .get(&m.name)
                .is_none_or(|at| now.duration_since(*at) > config.failure_timeout)
        })
        .map(|m| m.name.clone())
        .collect();

    for name in overdue {
        // A member we have never heard from directly gets the benefit of
        // the doubt until a full timeout has passed since we learned of it.
        if !state.last_heard.contains_key(&name) {
            state.last_heard.insert(name.clone(), now);
            continue;
        }
        if let Some(member) = state.members.get_mut(&name) {
            warn!(%name, "member failed to answer probes");
            member.status = MemberStatus::Failed;
            observations.push(Observation::Left(name));
        }
    }

    observations
}
