//! The swarm coordinator.
//!
//! One actor task owns the topic set and the connection registry.
//! Callers enqueue intents (`join`, `leave`, `flush`, `destroy`) and
//! observe results through futures and a typed event stream; the
//! connection set is mutated only by the actor itself.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};
use tracing::{debug, trace, warn, Instrument};

use keel_base::{PublicKey, Topic};
use keel_dht::{
    AnnounceError, ConnectError, Connection, HandshakeError, Node, PeerRecord, RejectReason, Role,
    Server, ServerOptions, Transport,
};

use crate::lifecycle::{Lifecycle, LifecycleState};

/// Channel capacity for swarm events.
const EVENTS_CAP: usize = 256;
/// Channel capacity for the actor's intent queue.
const TO_ACTOR_CAP: usize = 64;

/// Tuning for a [`Swarm`].
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// How often client topics are looked up for new peers.
    pub lookup_interval: Duration,
    /// Options for the stream server: firewall, relay, bind address.
    pub server: ServerOptions,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            lookup_interval: Duration::from_secs(2),
            server: ServerOptions::default(),
        }
    }
}

/// Participation mode for a joined topic.
///
/// At least one participant across the whole swarm must join with
/// `server: true`; a population of client-only participants can never
/// discover one another. That is a structural property of the discovery
/// protocol, not something to work around at the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOpts {
    /// Look up peers for the topic and connect to them.
    pub client: bool,
    /// Announce this node under the topic so others can find it.
    pub server: bool,
}

impl Default for JoinOpts {
    fn default() -> Self {
        Self {
            client: true,
            server: true,
        }
    }
}

/// Lifecycle of a joined topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    /// Announcement in flight.
    Joining,
    /// Membership established; lookups and announces running.
    Active,
    /// Leave requested, not yet settled.
    Leaving,
    /// Left. Existing connections remain open.
    Left,
}

/// Runtime record of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The remote's public key, proven during the handshake.
    pub public_key: PublicKey,
    /// Whether we accepted or dialed the connection.
    pub role: Role,
    /// Direct or relayed transport.
    pub transport: Transport,
    /// The topic whose discovery produced this connection, when dialed.
    pub topic: Option<Topic>,
}

/// A connection handed out by the swarm.
///
/// Reads and writes hit the encrypted stream directly. Dropping it
/// closes the session and fires a [`SwarmEvent::Disconnect`].
#[derive(Debug)]
pub struct SwarmConnection {
    inner: Connection,
    info: PeerInfo,
    _guard: ConnGuard,
}

impl SwarmConnection {
    /// The peer record for this connection.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// The remote's public key.
    pub fn remote(&self) -> PublicKey {
        self.info.public_key
    }

    /// The initiator's handshake payload, on accepted connections.
    pub fn handshake_payload(&self) -> &bytes::Bytes {
        self.inner.handshake_payload()
    }
}

#[derive(Debug)]
struct ConnGuard {
    conn_id: u64,
    closed_tx: mpsc::UnboundedSender<u64>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(self.conn_id);
    }
}

impl AsyncRead for SwarmConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SwarmConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Events observed from a [`Swarm`].
///
/// Delivered over an MPMC channel: each event reaches exactly one
/// receiver, so hand the receiver to the one task driving connections.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A new session was established, before any replication begins.
    Connection {
        /// The encrypted stream.
        connection: SwarmConnection,
        /// Who it reaches and how.
        info: PeerInfo,
    },
    /// A session ended.
    Disconnect {
        /// The record of the closed connection.
        info: PeerInfo,
    },
    /// An inbound or outbound attempt was refused by policy, as opposed
    /// to failing transiently.
    PeerRejected {
        /// Remote address of the attempt.
        addr: Option<SocketAddr>,
        /// The identity involved, when known.
        peer: Option<PublicKey>,
        /// `firewalled` or `handshake-failed`.
        reason: RejectReason,
    },
}

/// Error from swarm operations.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum SwarmError {
    #[error("swarm is destroyed")]
    Destroyed,
}

/// Error resolving [`Discovery::flushed`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum DiscoveryError {
    #[error(transparent)]
    Announce(#[from] AnnounceError),
    #[error("swarm is destroyed")]
    Destroyed,
}

/// Handle for a topic join.
#[derive(Debug)]
pub struct Discovery {
    topic: Topic,
    flushed_rx: oneshot::Receiver<Result<(), DiscoveryError>>,
}

impl Discovery {
    /// The joined topic.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Resolves once the server-side announcement has propagated to the
    /// responsible overlay nodes. Peers relying on a freshly joined
    /// topic can only find this node afterwards. Resolves immediately
    /// for client-only joins.
    pub async fn flushed(self) -> Result<(), DiscoveryError> {
        self.flushed_rx
            .await
            .unwrap_or(Err(DiscoveryError::Destroyed))
    }
}

enum ToActor {
    Join {
        topic: Topic,
        opts: JoinOpts,
        flushed: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    Leave {
        topic: Topic,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    TopicStatus {
        topic: Topic,
        reply: oneshot::Sender<Option<TopicStatus>>,
    },
    TopicActive {
        topic: Topic,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Coordinates topic membership and the connections that result.
///
/// Cheap to clone. Join topics, watch [`SwarmEvent`]s, and hand the
/// resulting streams to replication.
#[derive(Debug, Clone)]
pub struct Swarm {
    to_actor: mpsc::Sender<ToActor>,
    events_rx: async_channel::Receiver<SwarmEvent>,
    lifecycle: Lifecycle,
    public: PublicKey,
}

impl Swarm {
    /// Spawn a swarm over an overlay node. The stream server starts
    /// immediately; announcements begin per topic on
    /// [`Swarm::join`].
    pub async fn spawn(
        node: Node,
        lifecycle: Lifecycle,
        config: SwarmConfig,
    ) -> io::Result<Swarm> {
        let public = node.public_key();
        let server = node.create_server(config.server.clone()).await?;
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let (events_tx, events_rx) = async_channel::bounded(EVENTS_CAP);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (pause_tx, _) = watch::channel(false);

        let actor = Actor {
            node,
            server,
            config,
            topics: HashMap::new(),
            conns: HashMap::new(),
            next_conn_id: 0,
            connected_keys: HashMap::new(),
            dialing: HashSet::new(),
            events_tx,
            closed_tx,
            closed_rx,
            pause_tx,
            lifecycle_rx: lifecycle.subscribe(),
            to_actor_tx: to_actor_tx.clone(),
            to_actor_rx,
            lookups: JoinSet::new(),
            dials: JoinSet::new(),
            announce_tasks: JoinSet::new(),
            flush_waiters: Vec::new(),
            suspended: matches!(lifecycle.state(), LifecycleState::Suspended),
        };
        let me = public.fmt_short();
        tokio::spawn(
            actor
                .run()
                .instrument(tracing::error_span!("swarm", node = %me)),
        );

        Ok(Swarm {
            to_actor: to_actor_tx,
            events_rx,
            lifecycle,
            public,
        })
    }

    /// This node's public key.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The swarm's event stream.
    pub fn events(&self) -> async_channel::Receiver<SwarmEvent> {
        self.events_rx.clone()
    }

    /// Join a topic. See [`JoinOpts`] for the client/server split.
    pub async fn join(&self, topic: Topic, opts: JoinOpts) -> Result<Discovery, SwarmError> {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        self.to_actor
            .send(ToActor::Join {
                topic,
                opts,
                flushed: flushed_tx,
            })
            .await
            .map_err(|_| SwarmError::Destroyed)?;
        Ok(Discovery {
            topic,
            flushed_rx,
        })
    }

    /// Stop announcing and looking up a topic. Existing connections
    /// remain open; discovery and connection lifecycle are decoupled.
    pub async fn leave(&self, topic: Topic) -> Result<(), SwarmError> {
        self.to_actor
            .send(ToActor::Leave { topic })
            .await
            .map_err(|_| SwarmError::Destroyed)
    }

    /// Resolves once all currently pending discovery and connection
    /// attempts have settled, successfully or not. This does not
    /// guarantee a peer was found, only that the current round has
    /// quiesced.
    pub async fn flush(&self) -> Result<(), SwarmError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToActor::Flush { reply })
            .await
            .map_err(|_| SwarmError::Destroyed)?;
        rx.await.map_err(|_| SwarmError::Destroyed)
    }

    /// The lifecycle status of a topic, if it was ever joined.
    pub async fn topic_status(&self, topic: Topic) -> Result<Option<TopicStatus>, SwarmError> {
        let (reply, rx) = oneshot::channel();
        self.to_actor
            .send(ToActor::TopicStatus { topic, reply })
            .await
            .map_err(|_| SwarmError::Destroyed)?;
        rx.await.map_err(|_| SwarmError::Destroyed)
    }

    /// Park all network activity, keeping membership and connection
    /// state for [`Swarm::resume`].
    pub fn suspend(&self) {
        self.lifecycle.suspend();
    }

    /// Resume after [`Swarm::suspend`].
    pub fn resume(&self) {
        self.lifecycle.resume();
    }

    /// Leave all topics, close all connections and release the
    /// underlying overlay node. Idempotent.
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.to_actor.send(ToActor::Destroy { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct TopicState {
    status: TopicStatus,
    opts: JoinOpts,
}

struct DialOutcome {
    topic: Topic,
    record: PeerRecord,
    result: Result<Connection, ConnectError>,
}

struct Actor {
    node: Node,
    server: Server,
    config: SwarmConfig,
    topics: HashMap<Topic, TopicState>,
    conns: HashMap<u64, PeerInfo>,
    next_conn_id: u64,
    /// Live connection count per remote key, for dial deduplication.
    connected_keys: HashMap<PublicKey, usize>,
    dialing: HashSet<PublicKey>,
    events_tx: async_channel::Sender<SwarmEvent>,
    closed_tx: mpsc::UnboundedSender<u64>,
    closed_rx: mpsc::UnboundedReceiver<u64>,
    pause_tx: watch::Sender<bool>,
    lifecycle_rx: watch::Receiver<LifecycleState>,
    to_actor_tx: mpsc::Sender<ToActor>,
    to_actor_rx: mpsc::Receiver<ToActor>,
    lookups: JoinSet<(Topic, Vec<PeerRecord>)>,
    dials: JoinSet<DialOutcome>,
    announce_tasks: JoinSet<()>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    suspended: bool,
}

impl Actor {
    async fn run(mut self) {
        let rejections = self.server.rejections();
        let mut tick = tokio::time::interval(self.config.lookup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.to_actor_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(ToActor::Destroy { reply }) => {
                            self.destroy().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                accepted = self.server.accept(), if !self.suspended => {
                    match accepted {
                        Some(connection) => self.register_connection(connection, None),
                        None => {
                            debug!("server closed, stopping swarm actor");
                            break;
                        }
                    }
                }
                rejection = rejections.recv() => {
                    if let Ok(rejection) = rejection {
                        trace!(addr = %rejection.addr, reason = %rejection.reason, "peer rejected");
                        self.emit(SwarmEvent::PeerRejected {
                            addr: Some(rejection.addr),
                            peer: rejection.peer,
                            reason: rejection.reason,
                        });
                    }
                }
                Some(conn_id) = self.closed_rx.recv() => {
                    self.handle_closed(conn_id);
                }
                Some(joined) = self.lookups.join_next(), if !self.lookups.is_empty() => {
                    if let Ok((topic, records)) = joined {
                        self.handle_lookup_result(topic, records);
                    }
                    self.check_flush();
                }
                Some(joined) = self.dials.join_next(), if !self.dials.is_empty() => {
                    if let Ok(outcome) = joined {
                        self.handle_dial_outcome(outcome);
                    }
                    self.check_flush();
                }
                Some(_) = self.announce_tasks.join_next(), if !self.announce_tasks.is_empty() => {}
                changed = self.lifecycle_rx.changed() => {
                    if changed.is_err() {
                        // The lifecycle handle is gone; keep running.
                        continue;
                    }
                    let suspended =
                        matches!(*self.lifecycle_rx.borrow_and_update(), LifecycleState::Suspended);
                    self.set_suspended(suspended).await;
                }
                _ = tick.tick(), if !self.suspended => {
                    self.lookup_round();
                }
            }
        }
        debug!("swarm actor stopped");
    }

    async fn handle_command(&mut self, cmd: ToActor) {
        match cmd {
            ToActor::Join {
                topic,
                opts,
                flushed,
            } => self.handle_join(topic, opts, flushed).await,
            ToActor::Leave { topic } => {
                if let Some(state) = self.topics.get_mut(&topic) {
                    state.status = TopicStatus::Leaving;
                }
                let _ = self.node.unannounce(topic).await;
                if let Some(state) = self.topics.get_mut(&topic) {
                    state.status = TopicStatus::Left;
                }
                debug!(topic = %topic.fmt_short(), "left topic");
            }
            ToActor::Flush { reply } => {
                if !self.suspended {
                    self.lookup_round();
                }
                if self.lookups.is_empty() && self.dials.is_empty() {
                    let _ = reply.send(());
                } else {
                    self.flush_waiters.push(reply);
                }
            }
            ToActor::TopicStatus { topic, reply } => {
                let _ = reply.send(self.topics.get(&topic).map(|s| s.status));
            }
            ToActor::TopicActive { topic } => {
                if let Some(state) = self.topics.get_mut(&topic) {
                    if state.status == TopicStatus::Joining {
                        state.status = TopicStatus::Active;
                    }
                }
            }
            ToActor::Destroy { .. } => unreachable!("handled in run loop"),
        }
    }

    async fn handle_join(
        &mut self,
        topic: Topic,
        opts: JoinOpts,
        flushed: oneshot::Sender<Result<(), DiscoveryError>>,
    ) {
        debug!(topic = %topic.fmt_short(), ?opts, "joining topic");
        self.topics.insert(
            topic,
            TopicState {
                status: TopicStatus::Joining,
                opts,
            },
        );
        if opts.server {
            match self.node.announce(topic, self.server.record()).await {
                Ok(handle) => {
                    let to_actor = self.to_actor_tx.clone();
                    self.announce_tasks.spawn(async move {
                        let result = handle.flushed().await;
                        let _ = to_actor.send(ToActor::TopicActive { topic }).await;
                        let _ = flushed.send(result.map_err(DiscoveryError::from));
                    });
                }
                Err(_) => {
                    let _ = flushed.send(Err(DiscoveryError::Destroyed));
                }
            }
        } else {
            // Nothing to propagate for a client-only join.
            if let Some(state) = self.topics.get_mut(&topic) {
                state.status = TopicStatus::Active;
            }
            let _ = flushed.send(Ok(()));
        }
        if opts.client && !self.suspended {
            self.spawn_lookup(topic);
        }
    }

    fn lookup_round(&mut self) {
        let topics: Vec<Topic> = self
            .topics
            .iter()
            .filter(|(_, state)| {
                state.opts.client
                    && matches!(state.status, TopicStatus::Joining | TopicStatus::Active)
            })
            .map(|(topic, _)| *topic)
            .collect();
        for topic in topics {
            self.spawn_lookup(topic);
        }
    }

    fn spawn_lookup(&mut self, topic: Topic) {
        let node = self.node.clone();
        self.lookups.spawn(async move {
            let records = node.lookup(topic).await.unwrap_or_default();
            (topic, records)
        });
    }

    fn handle_lookup_result(&mut self, topic: Topic, records: Vec<PeerRecord>) {
        if self.suspended {
            return;
        }
        let still_wanted = self
            .topics
            .get(&topic)
            .is_some_and(|state| {
                state.opts.client
                    && matches!(state.status, TopicStatus::Joining | TopicStatus::Active)
            });
        if !still_wanted {
            return;
        }
        for record in records {
            let key = record.public_key;
            if key == self.node.public_key()
                || self.connected_keys.contains_key(&key)
                || self.dialing.contains(&key)
            {
                continue;
            }
            trace!(topic = %topic.fmt_short(), peer = %key.fmt_short(), "dialing discovered peer");
            self.dialing.insert(key);
            let node = self.node.clone();
            self.dials.spawn(async move {
                let result = node.connect_record(&record).await;
                DialOutcome {
                    topic,
                    record,
                    result,
                }
            });
        }
    }

    fn handle_dial_outcome(&mut self, outcome: DialOutcome) {
        let key = outcome.record.public_key;
        self.dialing.remove(&key);
        match outcome.result {
            Ok(connection) => {
                self.register_connection(connection, Some(outcome.topic));
            }
            Err(ConnectError::Handshake(
                err @ (HandshakeError::BadSignature | HandshakeError::PeerMismatch { .. }),
            )) => {
                debug!(peer = %key.fmt_short(), "dial rejected: {err}");
                self.emit(SwarmEvent::PeerRejected {
                    addr: outcome.record.addrs.first().copied(),
                    peer: Some(key),
                    reason: RejectReason::HandshakeFailed,
                });
            }
            Err(err) => {
                trace!(peer = %key.fmt_short(), "dial failed: {err}");
            }
        }
    }

    fn register_connection(&mut self, mut connection: Connection, topic: Option<Topic>) {
        connection.set_pause(self.pause_tx.subscribe());
        let info = PeerInfo {
            public_key: connection.remote(),
            role: connection.role(),
            transport: connection.transport(),
            topic,
        };
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(conn_id, info.clone());
        *self.connected_keys.entry(info.public_key).or_insert(0) += 1;
        debug!(peer = %info.public_key.fmt_short(), role = ?info.role, transport = ?info.transport, "connection up");
        let connection = SwarmConnection {
            inner: connection,
            info: info.clone(),
            _guard: ConnGuard {
                conn_id,
                closed_tx: self.closed_tx.clone(),
            },
        };
        self.emit(SwarmEvent::Connection { connection, info });
    }

    fn handle_closed(&mut self, conn_id: u64) {
        if let Some(info) = self.conns.remove(&conn_id) {
            if let Some(count) = self.connected_keys.get_mut(&info.public_key) {
                *count -= 1;
                if *count == 0 {
                    self.connected_keys.remove(&info.public_key);
                }
            }
            debug!(peer = %info.public_key.fmt_short(), "connection down");
            self.emit(SwarmEvent::Disconnect { info });
        }
    }

    fn check_flush(&mut self) {
        if self.lookups.is_empty() && self.dials.is_empty() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn set_suspended(&mut self, suspended: bool) {
        if self.suspended == suspended {
            return;
        }
        self.suspended = suspended;
        let _ = self.pause_tx.send(suspended);
        if suspended {
            debug!("swarm suspended");
            let _ = self.node.suspend().await;
        } else {
            debug!("swarm resumed");
            let _ = self.node.resume().await;
        }
    }

    fn emit(&mut self, event: SwarmEvent) {
        if let Err(err) = self.events_tx.try_send(event) {
            warn!("dropping swarm event, no receiver keeping up: {err}");
        }
    }

    async fn destroy(&mut self) {
        debug!("destroying swarm");
        let topics: Vec<Topic> = self.topics.keys().copied().collect();
        for topic in topics {
            let _ = self.node.unannounce(topic).await;
            if let Some(state) = self.topics.get_mut(&topic) {
                state.status = TopicStatus::Left;
            }
        }
        self.lookups.abort_all();
        self.dials.abort_all();
        self.announce_tasks.abort_all();
        self.server.close();
        self.conns.clear();
        self.connected_keys.clear();
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.events_tx.close();
        self.node.shutdown().await;
    }
}
