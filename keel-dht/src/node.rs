//! The overlay node: membership, announce/lookup, and stream
//! establishment.
//!
//! One actor task owns the routing table and the announce store; every
//! mutation flows through its channel. Iterative lookups, announce
//! rounds and bootstrap run as spawned tasks that talk UDP directly and
//! report discovered or dead nodes back to the actor.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::{mpsc, oneshot, watch}, task::JoinSet};
use tracing::{debug, trace, warn, Instrument};

use keel_base::{PublicKey, SecretKey, Topic};

use crate::{
    config::DhtConfig,
    connect::{dial_record, start_server, ConnectError, Connection, Server, ServerOptions},
    id::{Distance, Id},
    proto::{NodeRecord, PeerRecord, RpcMessage, SignedPeerRecord, MAX_DATAGRAM_SIZE},
    routing::{AddOutcome, RoutingTable},
};

/// The overlay could not be joined: no bootstrap node answered within
/// the retry budget.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("overlay unreachable: no responsive bootstrap node")]
pub struct OverlayUnreachable;

/// Errors from node operations.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum NodeError {
    #[error("node is shut down")]
    Shutdown,
}

/// Error resolving an announce handle.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum AnnounceError {
    #[error("no overlay node acknowledged the announcement for topic {topic}")]
    NoPeersReached { topic: Topic },
    #[error("node is shut down")]
    Shutdown,
}

/// Handle for an announcement in flight.
#[derive(Debug)]
pub struct AnnounceHandle {
    topic: Topic,
    flushed_rx: oneshot::Receiver<Result<(), AnnounceError>>,
}

impl AnnounceHandle {
    /// The announced topic.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Resolves once the announcement has propagated to the responsible
    /// overlay nodes. Await this before expecting peers to find fresh
    /// topics.
    pub async fn flushed(self) -> Result<(), AnnounceError> {
        self.flushed_rx.await.unwrap_or(Err(AnnounceError::Shutdown))
    }
}

/// A Kademlia-style overlay node.
///
/// Cheap to clone; the clone shares the running node.
#[derive(Debug, Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<ToActor>,
    secret: SecretKey,
    public: PublicKey,
    udp_addr: SocketAddr,
    bootstrapped_rx: watch::Receiver<Option<Result<(), OverlayUnreachable>>>,
}

impl Node {
    /// Bind the overlay socket and join the overlay through the
    /// configured bootstrap nodes. An empty bootstrap list starts an
    /// isolated root for a private overlay.
    pub async fn spawn(secret: SecretKey, config: DhtConfig) -> io::Result<Node> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let udp_addr = socket.local_addr()?;
        let public = secret.public();
        let id = Id::from(public);
        let local = NodeRecord { id, addr: udp_addr };
        let rpc = RpcClient {
            socket: socket.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            local,
            timeout: config.request_timeout,
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (bootstrapped_tx, bootstrapped_rx) = watch::channel(None);

        let actor = Actor {
            socket,
            rpc: rpc.clone(),
            table: RoutingTable::new(id),
            store: AnnounceStore::new(config.announce_ttl, config.max_records_per_topic),
            announced: HashMap::new(),
            secret: secret.clone(),
            local,
            config: config.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            suspended: false,
            last_reannounce: Instant::now(),
            last_refresh: Instant::now(),
            tasks: JoinSet::new(),
        };
        let me = public.fmt_short();
        tokio::spawn(
            actor
                .run()
                .instrument(tracing::error_span!("dht", node = %me)),
        );

        // Joining runs in the background; `bootstrapped()` reports it.
        let bootstrap = config.bootstrap.clone();
        let boot_rpc = rpc;
        let boot_cmd = cmd_tx.clone();
        let boot_config = config;
        tokio::spawn(async move {
            let result = bootstrap_overlay(boot_rpc, boot_cmd, bootstrap, boot_config).await;
            let _ = bootstrapped_tx.send(Some(result));
        });

        Ok(Node {
            cmd_tx,
            secret,
            public,
            udp_addr,
            bootstrapped_rx,
        })
    }

    /// This node's public key: its overlay identifier and stream
    /// identity.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// This node's position in the overlay keyspace.
    pub fn id(&self) -> Id {
        Id::from(self.public)
    }

    /// The bound UDP address of the overlay socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Wait for the overlay join to settle. `Err(OverlayUnreachable)`
    /// after no bootstrap node answered within the retry budget; `Ok`
    /// immediately for an isolated root.
    pub async fn bootstrapped(&self) -> Result<(), OverlayUnreachable> {
        let mut rx = self.bootstrapped_rx.clone();
        loop {
            if let Some(result) = *rx.borrow() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(OverlayUnreachable);
            }
        }
    }

    /// Publish `record` as this node's reachability under `topic`.
    ///
    /// The record is re-published periodically until
    /// [`Node::unannounce`]. Await [`AnnounceHandle::flushed`] before
    /// peers relying on a freshly joined topic can find it.
    pub async fn announce(
        &self,
        topic: Topic,
        record: PeerRecord,
    ) -> Result<AnnounceHandle, NodeError> {
        let (reply, flushed_rx) = oneshot::channel();
        self.cmd_tx
            .send(ToActor::Announce {
                topic,
                record,
                reply,
            })
            .await
            .map_err(|_| NodeError::Shutdown)?;
        Ok(AnnounceHandle { topic, flushed_rx })
    }

    /// Stop re-publishing this node under `topic`. Stored records on
    /// other nodes expire on their own.
    pub async fn unannounce(&self, topic: Topic) -> Result<(), NodeError> {
        self.cmd_tx
            .send(ToActor::Unannounce { topic })
            .await
            .map_err(|_| NodeError::Shutdown)
    }

    /// Query the overlay for peers announced under `topic`.
    pub async fn lookup(&self, topic: Topic) -> Result<Vec<PeerRecord>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ToActor::Lookup { topic, reply })
            .await
            .map_err(|_| NodeError::Shutdown)?;
        rx.await.map_err(|_| NodeError::Shutdown)
    }

    /// Start accepting inbound authenticated streams.
    ///
    /// The server's reachability is announced under this node's own
    /// discovery key so that [`Node::connect`] by public key works.
    pub async fn create_server(&self, options: ServerOptions) -> io::Result<Server> {
        let server = start_server(self.secret.clone(), options).await?;
        let own_topic = Topic::from_public_key(&self.public);
        if let Ok(handle) = self.announce(own_topic, server.record()).await {
            if let Err(err) = handle.flushed().await {
                warn!("announcing own discovery key failed: {err}");
            }
        }
        Ok(server)
    }

    /// Open an authenticated encrypted stream to `remote`, located via
    /// the overlay. Falls back to relayed transport when no direct
    /// address is reachable.
    pub async fn connect(&self, remote: PublicKey) -> Result<Connection, ConnectError> {
        let records = self.lookup(Topic::from_public_key(&remote)).await?;
        let record = records
            .into_iter()
            .find(|r| r.public_key == remote)
            .ok_or(ConnectError::PeerNotFound(remote))?;
        self.connect_record(&record).await
    }

    /// Open an authenticated encrypted stream to the peer described by
    /// `record`.
    pub async fn connect_record(&self, record: &PeerRecord) -> Result<Connection, ConnectError> {
        self.connect_record_with_payload(record, Bytes::new()).await
    }

    /// Like [`Node::connect_record`], with an application payload for the
    /// remote's firewall callback.
    pub async fn connect_record_with_payload(
        &self,
        record: &PeerRecord,
        payload: Bytes,
    ) -> Result<Connection, ConnectError> {
        dial_record(&self.secret, record, payload).await
    }

    /// Pause overlay maintenance and stop reacting to overlay traffic.
    /// All state is retained; [`Node::resume`] picks up where this left
    /// off.
    pub async fn suspend(&self) -> Result<(), NodeError> {
        self.cmd_tx
            .send(ToActor::Suspend)
            .await
            .map_err(|_| NodeError::Shutdown)
    }

    /// Resume after [`Node::suspend`].
    pub async fn resume(&self) -> Result<(), NodeError> {
        self.cmd_tx
            .send(ToActor::Resume)
            .await
            .map_err(|_| NodeError::Shutdown)
    }

    /// Stop the node and release the socket. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ToActor::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

enum ToActor {
    Announce {
        topic: Topic,
        record: PeerRecord,
        reply: oneshot::Sender<Result<(), AnnounceError>>,
    },
    Unannounce {
        topic: Topic,
    },
    Lookup {
        topic: Topic,
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    NodesSeen(Vec<NodeRecord>),
    NodeDead(Id),
    Suspend,
    Resume,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Request/response plumbing shared by the actor and lookup tasks.
#[derive(Clone)]
pub(crate) struct RpcClient {
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>,
    local: NodeRecord,
    timeout: Duration,
}

impl RpcClient {
    /// Send a request and await the matching response.
    async fn request(
        &self,
        to: SocketAddr,
        build: impl FnOnce(u64, NodeRecord) -> RpcMessage,
    ) -> Result<RpcMessage, RpcTimeout> {
        let txid: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(txid, tx);
        let message = build(txid, self.local);
        let result = async {
            self.send(to, &message).await.map_err(|_| RpcTimeout)?;
            tokio::time::timeout(self.timeout, rx)
                .await
                .map_err(|_| RpcTimeout)?
                .map_err(|_| RpcTimeout)
        }
        .await;
        self.pending.lock().remove(&txid);
        result
    }

    async fn send(&self, to: SocketAddr, message: &RpcMessage) -> io::Result<()> {
        let bytes = postcard::to_stdvec(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    /// Route a response to its waiting request. Returns whether a
    /// request was waiting.
    fn resolve(&self, message: RpcMessage) -> bool {
        if let Some(tx) = self.pending.lock().remove(&message.txid()) {
            tx.send(message).is_ok()
        } else {
            false
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("rpc timed out")]
struct RpcTimeout;

/// Stored announcements, newest first per peer, expired by TTL.
struct AnnounceStore {
    ttl: Duration,
    max_per_topic: usize,
    topics: HashMap<Topic, BTreeMap<PublicKey, (SignedPeerRecord, Instant)>>,
}

impl AnnounceStore {
    fn new(ttl: Duration, max_per_topic: usize) -> Self {
        Self {
            ttl,
            max_per_topic,
            topics: HashMap::new(),
        }
    }

    fn insert(&mut self, topic: Topic, record: SignedPeerRecord) {
        let records = self.topics.entry(topic).or_default();
        if records.len() >= self.max_per_topic
            && !records.contains_key(&record.record.public_key)
        {
            // Make room by dropping the stalest entry.
            if let Some(stalest) = records
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| *k)
            {
                records.remove(&stalest);
            }
        }
        records.insert(record.record.public_key, (record, Instant::now()));
    }

    fn get(&self, topic: &Topic) -> Vec<SignedPeerRecord> {
        self.topics
            .get(topic)
            .map(|records| {
                records
                    .values()
                    .filter(|(_, at)| at.elapsed() < self.ttl)
                    .map(|(record, _)| record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire(&mut self) {
        let ttl = self.ttl;
        self.topics.retain(|_, records| {
            records.retain(|_, (_, at)| at.elapsed() < ttl);
            !records.is_empty()
        });
    }
}

struct Actor {
    socket: Arc<UdpSocket>,
    rpc: RpcClient,
    table: RoutingTable,
    store: AnnounceStore,
    /// Topics this node re-publishes itself under.
    announced: HashMap<Topic, PeerRecord>,
    secret: SecretKey,
    local: NodeRecord,
    config: DhtConfig,
    cmd_rx: mpsc::Receiver<ToActor>,
    cmd_tx: mpsc::Sender<ToActor>,
    suspended: bool,
    last_reannounce: Instant,
    last_refresh: Instant,
    tasks: JoinSet<()>,
}

impl Actor {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut tick = tokio::time::interval(self.config.refresh_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                datagram = self.socket.recv_from(&mut buf) => {
                    match datagram {
                        Ok((len, from_addr)) => {
                            if self.suspended {
                                continue;
                            }
                            self.handle_datagram(&buf[..len], from_addr).await;
                        }
                        Err(err) => {
                            warn!("overlay socket error: {err}");
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(ToActor::Shutdown { reply }) => {
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = tick.tick() => {
                    if !self.suspended {
                        self.maintenance();
                    }
                }
                // Drain finished background tasks.
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }
        debug!("overlay actor stopped");
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from_addr: SocketAddr) {
        let message: RpcMessage = match postcard::from_bytes(bytes) {
            Ok(message) => message,
            Err(err) => {
                trace!(%from_addr, "undecodable datagram: {err}");
                return;
            }
        };
        // The claimed id paired with the observed address feeds the
        // routing table on every message.
        let sender_id = message.from().id;
        self.observe(sender_id, from_addr);

        if message.is_response() {
            if !self.rpc.resolve(message) {
                trace!(%from_addr, "response without pending request");
            }
            return;
        }
        match message {
            RpcMessage::Ping { txid, .. } => {
                let pong = RpcMessage::Pong {
                    txid,
                    from: self.local,
                };
                let _ = self.rpc.send(from_addr, &pong).await;
            }
            RpcMessage::FindNode { txid, target, .. } => {
                let nodes = self.closest_records(&target);
                let response = RpcMessage::Nodes {
                    txid,
                    from: self.local,
                    nodes,
                };
                let _ = self.rpc.send(from_addr, &response).await;
            }
            RpcMessage::Announce {
                txid,
                topic,
                record,
                ..
            } => {
                if record.verify(&topic) {
                    trace!(topic = %topic.fmt_short(), peer = %record.record.public_key.fmt_short(), "storing announce");
                    self.store.insert(topic, record);
                    let ack = RpcMessage::Announced {
                        txid,
                        from: self.local,
                    };
                    let _ = self.rpc.send(from_addr, &ack).await;
                } else {
                    debug!(topic = %topic.fmt_short(), "announce with invalid signature dropped");
                }
            }
            RpcMessage::Lookup { txid, topic, .. } => {
                let peers = self.store.get(&topic);
                let nodes = self.closest_records(&Id::from(topic));
                let response = RpcMessage::Peers {
                    txid,
                    from: self.local,
                    peers,
                    nodes,
                };
                let _ = self.rpc.send(from_addr, &response).await;
            }
            // Responses were handled above.
            _ => {}
        }
    }

    fn handle_command(&mut self, cmd: ToActor) {
        match cmd {
            ToActor::Announce {
                topic,
                record,
                reply,
            } => {
                self.announced.insert(topic, record.clone());
                let signed = SignedPeerRecord::sign(&self.secret, &topic, record);
                // The announcing node always keeps its own record; small
                // overlays then resolve lookups locally.
                self.store.insert(topic, signed.clone());
                self.spawn_announce(topic, signed, Some(reply));
            }
            ToActor::Unannounce { topic } => {
                self.announced.remove(&topic);
            }
            ToActor::Lookup { topic, reply } => {
                let local: Vec<SignedPeerRecord> = self.store.get(&topic);
                let seeds = self.table.closest(&Id::from(topic), self.config.k);
                let rpc = self.rpc.clone();
                let cmd_tx = self.cmd_tx.clone();
                let config = self.config.clone();
                self.tasks.spawn(async move {
                    let peers = lookup_task(rpc, cmd_tx, topic, seeds, local, config).await;
                    let _ = reply.send(peers);
                });
            }
            ToActor::NodesSeen(nodes) => {
                for node in nodes {
                    self.observe(node.id, node.addr);
                }
            }
            ToActor::NodeDead(id) => {
                self.table.remove(&id);
            }
            ToActor::Suspend => {
                debug!("overlay suspended");
                self.suspended = true;
            }
            ToActor::Resume => {
                debug!("overlay resumed");
                self.suspended = false;
            }
            ToActor::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    /// Offer a node to the routing table, pinging the oldest entry of a
    /// full bucket before eviction, per the standard protocol.
    fn observe(&mut self, id: Id, addr: SocketAddr) {
        match self.table.offer(id, addr) {
            AddOutcome::Added | AddOutcome::Refreshed | AddOutcome::IsSelf => {}
            AddOutcome::BucketFull { oldest } => {
                let Some(oldest_addr) = self.table.addr(&oldest) else {
                    self.table.evict_and_add(oldest, id, addr);
                    return;
                };
                let rpc = self.rpc.clone();
                let cmd_tx = self.cmd_tx.clone();
                self.tasks.spawn(async move {
                    let alive = rpc
                        .request(oldest_addr, |txid, from| RpcMessage::Ping { txid, from })
                        .await
                        .is_ok();
                    if !alive {
                        let _ = cmd_tx.send(ToActor::NodeDead(oldest)).await;
                        let _ = cmd_tx.send(ToActor::NodesSeen(vec![NodeRecord { id, addr }])).await;
                    }
                });
            }
        }
    }

    fn closest_records(&self, target: &Id) -> Vec<NodeRecord> {
        self.table
            .closest(target, self.config.k)
            .into_iter()
            .map(|(id, addr)| NodeRecord { id, addr })
            .collect()
    }

    fn maintenance(&mut self) {
        self.store.expire();
        if self.last_reannounce.elapsed() >= self.config.reannounce_interval {
            self.last_reannounce = Instant::now();
            for (topic, record) in self.announced.clone() {
                let signed = SignedPeerRecord::sign(&self.secret, &topic, record);
                self.store.insert(topic, signed.clone());
                self.spawn_announce(topic, signed, None);
            }
        }
        if !self.table.is_empty() && self.last_refresh.elapsed() >= self.config.refresh_interval {
            self.last_refresh = Instant::now();
            // A self-lookup keeps our neighborhood fresh.
            let rpc = self.rpc.clone();
            let cmd_tx = self.cmd_tx.clone();
            let seeds = self.table.closest(&self.local.id, self.config.k);
            let target = self.local.id;
            let config = self.config.clone();
            self.tasks.spawn(async move {
                iterative_find_node(&rpc, &cmd_tx, target, seeds, &config).await;
            });
        }
    }

    fn spawn_announce(
        &mut self,
        topic: Topic,
        signed: SignedPeerRecord,
        reply: Option<oneshot::Sender<Result<(), AnnounceError>>>,
    ) {
        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        let seeds = self.table.closest(&Id::from(topic), self.config.k);
        let config = self.config.clone();
        self.tasks.spawn(async move {
            let result = announce_task(rpc, cmd_tx, topic, signed, seeds, config).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }
}

/// Iterative Kademlia lookup: query α unvisited candidates closest to
/// the target until the k best answers stop improving. Returns the
/// closest responsive nodes.
async fn iterative_find_node(
    rpc: &RpcClient,
    cmd_tx: &mpsc::Sender<ToActor>,
    target: Id,
    seeds: Vec<(Id, SocketAddr)>,
    config: &DhtConfig,
) -> Vec<(Id, SocketAddr)> {
    let mut addrs: HashMap<Id, SocketAddr> = seeds.iter().copied().collect();
    let mut candidates: BTreeSet<(Distance, Id)> = seeds
        .iter()
        .map(|(id, _)| (target.distance(id), *id))
        .collect();
    let mut queried: HashSet<Id> = HashSet::new();
    queried.insert(rpc.local.id);
    let mut results: BTreeSet<(Distance, Id)> = BTreeSet::new();

    loop {
        let to_query: Vec<Id> = candidates
            .iter()
            .filter(|(_, id)| !queried.contains(id))
            .take(config.alpha)
            .map(|(_, id)| *id)
            .collect();
        if to_query.is_empty() {
            break;
        }

        let mut queries = JoinSet::new();
        for id in to_query {
            queried.insert(id);
            let Some(addr) = addrs.get(&id).copied() else {
                continue;
            };
            let rpc = rpc.clone();
            queries.spawn(async move {
                let response = rpc
                    .request(addr, |txid, from| RpcMessage::FindNode {
                        txid,
                        from,
                        target,
                    })
                    .await;
                (id, addr, response)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let Ok((id, addr, response)) = joined else {
                continue;
            };
            match response {
                Ok(RpcMessage::Nodes { nodes, .. }) => {
                    results.insert((target.distance(&id), id));
                    addrs.insert(id, addr);
                    let mut seen = Vec::new();
                    for node in nodes {
                        if node.id != rpc.local.id && !queried.contains(&node.id) {
                            candidates.insert((target.distance(&node.id), node.id));
                            addrs.insert(node.id, node.addr);
                        }
                        seen.push(node);
                    }
                    seen.push(NodeRecord { id, addr });
                    let _ = cmd_tx.send(ToActor::NodesSeen(seen)).await;
                }
                Ok(other) => {
                    trace!(?other, "unexpected find-node response");
                }
                Err(_) => {
                    let _ = cmd_tx.send(ToActor::NodeDead(id)).await;
                }
            }
        }

        while results.len() > config.k {
            results.pop_last();
        }
        let kth_best = results.iter().nth(config.k.saturating_sub(1)).map(|(d, _)| *d);
        let best_candidate = candidates
            .iter()
            .find(|(_, id)| !queried.contains(id))
            .map(|(d, _)| *d);
        match (kth_best, best_candidate) {
            (Some(kth), Some(best)) if best >= kth => break,
            (_, None) => break,
            _ => continue,
        }
    }

    results
        .into_iter()
        .filter_map(|(_, id)| addrs.get(&id).map(|addr| (id, *addr)))
        .collect()
}

/// Push an announcement to the k closest nodes, retrying the round with
/// capped exponential backoff while nobody acknowledges.
async fn announce_task(
    rpc: RpcClient,
    cmd_tx: mpsc::Sender<ToActor>,
    topic: Topic,
    signed: SignedPeerRecord,
    seeds: Vec<(Id, SocketAddr)>,
    config: DhtConfig,
) -> Result<(), AnnounceError> {
    if seeds.is_empty() {
        // Isolated root: the local store is the responsible node.
        return Ok(());
    }
    let round = || {
        let rpc = rpc.clone();
        let cmd_tx = cmd_tx.clone();
        let signed = signed.clone();
        let seeds = seeds.clone();
        let config = config.clone();
        async move {
            let closest =
                iterative_find_node(&rpc, &cmd_tx, Id::from(topic), seeds, &config).await;
            let mut acks = 0usize;
            let mut pushes = JoinSet::new();
            for (_, addr) in closest.into_iter().take(config.k) {
                let rpc = rpc.clone();
                let signed = signed.clone();
                pushes.spawn(async move {
                    rpc.request(addr, |txid, from| RpcMessage::Announce {
                        txid,
                        from,
                        topic,
                        record: signed,
                    })
                    .await
                });
            }
            while let Some(joined) = pushes.join_next().await {
                if matches!(joined, Ok(Ok(RpcMessage::Announced { .. }))) {
                    acks += 1;
                }
            }
            if acks == 0 {
                Err(AnnounceError::NoPeersReached { topic })
            } else {
                trace!(topic = %topic.fmt_short(), acks, "announce round done");
                Ok(())
            }
        }
    };
    round
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(config.backoff_base)
                .with_max_delay(config.backoff_cap)
                .with_max_times(config.bootstrap_attempts),
        )
        .await
}

/// Query the nodes closest to the topic for announced peers and merge
/// with locally stored records.
async fn lookup_task(
    rpc: RpcClient,
    cmd_tx: mpsc::Sender<ToActor>,
    topic: Topic,
    seeds: Vec<(Id, SocketAddr)>,
    local: Vec<SignedPeerRecord>,
    config: DhtConfig,
) -> Vec<PeerRecord> {
    let mut merged: BTreeMap<PublicKey, PeerRecord> = local
        .into_iter()
        .map(|signed| (signed.record.public_key, signed.record))
        .collect();

    let closest = iterative_find_node(&rpc, &cmd_tx, Id::from(topic), seeds, &config).await;
    let mut queries = JoinSet::new();
    for (_, addr) in closest.into_iter().take(config.k) {
        let rpc = rpc.clone();
        queries.spawn(async move {
            rpc.request(addr, |txid, from| RpcMessage::Lookup { txid, from, topic })
                .await
        });
    }
    while let Some(joined) = queries.join_next().await {
        if let Ok(Ok(RpcMessage::Peers { peers, .. })) = joined {
            for signed in peers {
                if signed.verify(&topic) {
                    merged
                        .entry(signed.record.public_key)
                        .or_insert(signed.record);
                } else {
                    debug!(topic = %topic.fmt_short(), "dropping peer record with bad signature");
                }
            }
        }
    }
    trace!(topic = %topic.fmt_short(), peers = merged.len(), "lookup done");
    merged.into_values().collect()
}

/// Join the overlay: find any responsive bootstrap node, then flood our
/// neighborhood with a self-lookup. Retries with capped exponential
/// backoff before giving up.
async fn bootstrap_overlay(
    rpc: RpcClient,
    cmd_tx: mpsc::Sender<ToActor>,
    bootstrap: Vec<SocketAddr>,
    config: DhtConfig,
) -> Result<(), OverlayUnreachable> {
    if bootstrap.is_empty() {
        debug!("no bootstrap nodes, running as isolated root");
        return Ok(());
    }
    let round = || {
        let rpc = rpc.clone();
        let cmd_tx = cmd_tx.clone();
        let bootstrap = bootstrap.clone();
        async move {
            let mut queries = JoinSet::new();
            for addr in bootstrap {
                let rpc = rpc.clone();
                let target = rpc.local.id;
                queries.spawn(async move {
                    let response = rpc
                        .request(addr, |txid, from| RpcMessage::FindNode {
                            txid,
                            from,
                            target,
                        })
                        .await;
                    (addr, response)
                });
            }
            let mut contacts: Vec<NodeRecord> = Vec::new();
            while let Some(joined) = queries.join_next().await {
                if let Ok((addr, Ok(RpcMessage::Nodes { from, nodes, .. }))) = joined {
                    contacts.push(NodeRecord { id: from.id, addr });
                    contacts.extend(nodes);
                }
            }
            if contacts.is_empty() {
                return Err(OverlayUnreachable);
            }
            let _ = cmd_tx.send(ToActor::NodesSeen(contacts.clone())).await;
            Ok(contacts)
        }
    };
    let contacts = round
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(config.backoff_base)
                .with_max_delay(config.backoff_cap)
                .with_max_times(config.bootstrap_attempts),
        )
        .await?;

    let seeds: Vec<(Id, SocketAddr)> = contacts
        .into_iter()
        .map(|record| (record.id, record.addr))
        .collect();
    let found = iterative_find_node(&rpc, &cmd_tx, rpc.local.id, seeds, &config).await;
    debug!(neighbors = found.len(), "bootstrap complete");
    Ok(())
}
