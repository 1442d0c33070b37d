//! The log handle and its fetch coordination.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use keel_base::{PublicKey, SecretKey, Topic};

use crate::{
    net::{ReplicationConfig, SessionCmd},
    store::{MemoryStore, Store},
    tree::{self, Hash, SignedHead},
};

/// An append-only, partially replicable sequence of immutable blocks.
///
/// Cheaply cloneable handle; all clones share one underlying log. The log
/// is writable only when created from the secret key whose public half
/// identifies it.
#[derive(Clone)]
pub struct Log {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Log({})", self.shared.public.fmt_short())
    }
}

pub(crate) struct Shared {
    pub(crate) public: PublicKey,
    pub(crate) secret: Option<SecretKey>,
    pub(crate) discovery_key: Topic,
    pub(crate) config: ReplicationConfig,
    pub(crate) state: Mutex<State>,
    /// Woken whenever the session set or the finding-peers count changes.
    pub(crate) sessions_changed: Notify,
}

pub(crate) struct State {
    pub(crate) store: Box<dyn Store>,
    /// Leaf hashes for the contiguous block prefix `0..leaf_hashes.len()`.
    /// Proofs can be served only while this covers the whole head.
    pub(crate) leaf_hashes: Vec<Hash>,
    pub(crate) head: Option<SignedHead>,
    pub(crate) sessions: HashMap<u64, SessionInfo>,
    next_session: u64,
    next_waiter: u64,
    pub(crate) finding_peers: usize,
    /// get/download drivers waiting for a block to arrive, by index.
    block_waiters: HashMap<u64, HashMap<u64, oneshot::Sender<Bytes>>>,
    /// Fetch attempts waiting for a miss signal, by (session, index).
    miss_waiters: HashMap<(u64, u64), oneshot::Sender<Miss>>,
    subscribers: Vec<async_channel::Sender<LogEvent>>,
    pub(crate) closed: bool,
}

pub(crate) struct SessionInfo {
    pub(crate) remote_head: Option<SignedHead>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    pub(crate) peer: Option<PublicKey>,
}

/// Why a fetch attempt against one session did not produce a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Miss {
    /// The session answered that it cannot serve the index.
    DontHave,
    /// The session went away.
    SessionClosed,
}

/// Events emitted by a log, observable via [`Log::subscribe`].
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// A replication session completed its handshake.
    SessionOpened {
        /// Internal session id.
        session: u64,
        /// Remote identity, when the transport knew it.
        peer: Option<PublicKey>,
    },
    /// A replication session ended.
    SessionClosed {
        /// Internal session id.
        session: u64,
    },
    /// A session was terminated for sending a block whose proof did not
    /// verify. The session is dead; the log is unaffected.
    SessionBanned {
        /// Internal session id.
        session: u64,
        /// Remote identity, when the transport knew it.
        peer: Option<PublicKey>,
    },
    /// The log adopted a longer verified head.
    HeadUpdated {
        /// New block count.
        length: u64,
    },
}

/// Error from [`Log::append`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum AppendError {
    #[error("log is not writable")]
    NotWritable,
    #[error("log is closed")]
    Closed,
}

/// Error from [`Log::get`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum GetError {
    #[error("request for block {index} timed out")]
    RequestTimeout { index: u64 },
    #[error("no active session can supply block {index} and none is expected")]
    BlockUnavailable { index: u64 },
    #[error("all sessions exhausted fetching block {index}")]
    PeerSetExhausted { index: u64 },
    #[error("log is closed")]
    Closed,
}

/// Error from [`Log::update`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum UpdateError {
    #[error("log is closed")]
    Closed,
}

/// Error from a [`DownloadHandle`].
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum DownloadError {
    #[error("all sessions exhausted fetching block {index}")]
    PeerSetExhausted { index: u64 },
    #[error("log is closed")]
    Closed,
}

/// A range of block indices to download eagerly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadRange {
    /// First index to fetch.
    pub start: u64,
    /// One past the last index to fetch; `None` means the current head
    /// length at the time the download starts.
    pub end: Option<u64>,
    /// Fetch strictly in ascending index order, one block at a time.
    /// Useful when the payloads are consumed as a stream.
    pub linear: bool,
}

/// Handle for an eager range download started with [`Log::download`].
#[derive(Debug)]
pub struct DownloadHandle {
    rx: oneshot::Receiver<Result<(), DownloadError>>,
}

impl DownloadHandle {
    /// Resolves when every requested block is verified and stored.
    pub async fn done(self) -> Result<(), DownloadError> {
        self.rx.await.unwrap_or(Err(DownloadError::Closed))
    }
}

/// Token signalling that peer discovery for this log is in progress.
///
/// While at least one token is outstanding, [`Log::update`] waits for a
/// replication session to appear instead of returning `false` against an
/// empty session set. Release the token when the current peer-finding
/// attempt is over, typically after the swarm's discovery flush.
pub struct FindingPeers {
    shared: Arc<Shared>,
    released: bool,
}

impl std::fmt::Debug for FindingPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindingPeers")
            .field("log", &self.shared.public.fmt_short())
            .field("released", &self.released)
            .finish()
    }
}

impl FindingPeers {
    /// Signal that this peer-finding attempt is over.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.shared.state.lock();
            state.finding_peers -= 1;
            drop(state);
            self.shared.sessions_changed.notify_waiters();
        }
    }
}

impl Drop for FindingPeers {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl Log {
    /// Create a writable log from a secret key, backed by memory.
    pub fn create(secret: SecretKey) -> Self {
        Self::new(Some(secret), None, Box::new(MemoryStore::new()), Default::default())
    }

    /// Open a read-only log identified by a public key, backed by memory.
    pub fn open(public: PublicKey) -> Self {
        Self::new(None, Some(public), Box::new(MemoryStore::new()), Default::default())
    }

    /// Create a writable log with an explicit store and configuration.
    pub fn create_with(secret: SecretKey, store: Box<dyn Store>, config: ReplicationConfig) -> Self {
        Self::new(Some(secret), None, store, config)
    }

    /// Open a read-only log with an explicit store and configuration.
    pub fn open_with(public: PublicKey, store: Box<dyn Store>, config: ReplicationConfig) -> Self {
        Self::new(None, Some(public), store, config)
    }

    fn new(
        secret: Option<SecretKey>,
        public: Option<PublicKey>,
        store: Box<dyn Store>,
        config: ReplicationConfig,
    ) -> Self {
        let public = public
            .or_else(|| secret.as_ref().map(|s| s.public()))
            .expect("either key half");
        // Rebuild the contiguous leaf-hash prefix from preloaded storage.
        let mut leaf_hashes = Vec::new();
        while let Some(payload) = store.get_block(leaf_hashes.len() as u64) {
            leaf_hashes.push(tree::leaf_hash(&payload));
        }
        let discovery_key = Topic::from_public_key(&public);
        Self {
            shared: Arc::new(Shared {
                public,
                secret,
                discovery_key,
                config,
                state: Mutex::new(State {
                    store,
                    leaf_hashes,
                    head: None,
                    sessions: HashMap::new(),
                    next_session: 0,
                    next_waiter: 0,
                    finding_peers: 0,
                    block_waiters: HashMap::new(),
                    miss_waiters: HashMap::new(),
                    subscribers: Vec::new(),
                    closed: false,
                }),
                sessions_changed: Notify::new(),
            }),
        }
    }

    /// The public key identifying this log.
    pub fn public_key(&self) -> PublicKey {
        self.shared.public
    }

    /// The topic under which peers of this log discover each other.
    ///
    /// Derived one-way from the public key: safe to hand to discovery
    /// infrastructure without granting the ability to verify log content.
    pub fn discovery_key(&self) -> Topic {
        self.shared.discovery_key
    }

    /// Whether this handle holds the writing key.
    pub fn is_writable(&self) -> bool {
        self.shared.secret.is_some()
    }

    /// Number of blocks in the log, per the latest verified head.
    pub fn len(&self) -> u64 {
        self.shared.state.lock().head.map_or(0, |h| h.length)
    }

    /// Whether the log has no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes in the log, per the latest verified head.
    pub fn byte_len(&self) -> u64 {
        self.shared.state.lock().head.map_or(0, |h| h.byte_len)
    }

    /// The latest verified head, if any. Suitable for out-of-band
    /// transport; [`SignedHead::verify`] checks it against the log key.
    pub fn signed_head(&self) -> Option<SignedHead> {
        self.shared.state.lock().head
    }

    /// Subscribe to log events.
    pub fn subscribe(&self) -> async_channel::Receiver<LogEvent> {
        let (tx, rx) = async_channel::bounded(128);
        self.shared.state.lock().subscribers.push(tx);
        rx
    }

    /// Append a single payload. Returns the new length.
    pub fn append(&self, payload: impl Into<Bytes>) -> Result<u64, AppendError> {
        self.append_batch([payload.into()])
    }

    /// Append a batch of payloads as one head update. Indistinguishable,
    /// after the fact, from appending them one by one; the accumulator
    /// and signature are updated once.
    pub fn append_batch(
        &self,
        payloads: impl IntoIterator<Item = impl Into<Bytes>>,
    ) -> Result<u64, AppendError> {
        let secret = self.shared.secret.as_ref().ok_or(AppendError::NotWritable)?;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(AppendError::Closed);
        }
        let mut byte_len = state.head.map_or(0, |h| h.byte_len);
        let mut appended = Vec::new();
        for payload in payloads {
            let payload: Bytes = payload.into();
            let index = state.leaf_hashes.len() as u64;
            state.leaf_hashes.push(tree::leaf_hash(&payload));
            byte_len += payload.len() as u64;
            state.store.put_block(index, payload.clone());
            appended.push((index, payload));
        }
        if appended.is_empty() {
            return Ok(state.head.map_or(0, |h| h.length));
        }
        let length = state.leaf_hashes.len() as u64;
        let root = tree::root(&state.leaf_hashes);
        let head = SignedHead::sign(secret, length, byte_len, root);
        state.head = Some(head);
        for (index, payload) in &appended {
            state.wake_block_waiters(*index, payload);
        }
        for session in state.sessions.values() {
            let _ = session.cmd_tx.send(SessionCmd::Head(head));
        }
        state.emit(LogEvent::HeadUpdated { length });
        trace!(log = %self.shared.public.fmt_short(), length, "appended");
        Ok(length)
    }

    /// Returns the payload at `index` if it is already verified and
    /// stored locally. Never touches the network.
    pub fn get_local(&self, index: u64) -> Option<Bytes> {
        self.shared.state.lock().store.get_block(index)
    }

    /// Returns the payload at `index`.
    ///
    /// Local storage is checked first. Otherwise, while replication
    /// sessions are active, a fetch request is issued and the caller
    /// suspends until the block arrives and verifies, `timeout` elapses,
    /// or no session can supply the block and none is expected.
    pub async fn get(&self, index: u64, timeout: Option<Duration>) -> Result<Bytes, GetError> {
        match timeout {
            None => self.fetch(index).await,
            Some(t) => match tokio::time::timeout(t, self.fetch(index)).await {
                Ok(res) => res,
                Err(_) => Err(GetError::RequestTimeout { index }),
            },
        }
    }

    /// Ask the active replication sessions for the remote head and adopt
    /// it if it is longer and verifiable. Returns whether local state
    /// advanced.
    ///
    /// Performs no peer discovery of its own: with no active session and
    /// no outstanding [`FindingPeers`] token this returns `false`
    /// immediately. While a token is outstanding it waits for at least
    /// one session to appear and report a head first.
    pub async fn update(&self) -> Result<bool, UpdateError> {
        loop {
            let notified = self.shared.sessions_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(UpdateError::Closed);
                }
                if !state.sessions.is_empty() {
                    // Every registered session has reported its head as
                    // part of the open exchange; `None` means the remote
                    // log is empty.
                    let best = state
                        .sessions
                        .values()
                        .filter_map(|s| s.remote_head)
                        .max_by_key(|h| h.length);
                    let local = state.head.map_or(0, |h| h.length);
                    match best {
                        Some(best) if best.length > local => {
                            state.head = Some(best);
                            state.emit(LogEvent::HeadUpdated { length: best.length });
                            debug!(
                                log = %self.shared.public.fmt_short(),
                                length = best.length,
                                "update adopted remote head"
                            );
                            return Ok(true);
                        }
                        _ => return Ok(false),
                    }
                } else if state.finding_peers == 0 {
                    return Ok(false);
                }
            }
            notified.await;
        }
    }

    /// Eagerly fetch a range of blocks. The returned handle resolves when
    /// the whole range is verified and stored.
    pub fn download(&self, range: DownloadRange) -> DownloadHandle {
        let (tx, rx) = oneshot::channel();
        let log = self.clone();
        tokio::spawn(async move {
            let res = log.run_download(range).await;
            let _ = tx.send(res);
        });
        DownloadHandle { rx }
    }

    async fn run_download(&self, range: DownloadRange) -> Result<(), DownloadError> {
        let end = match range.end {
            Some(end) => end,
            None => self.len(),
        };
        let missing: Vec<u64> = {
            let state = self.shared.state.lock();
            (range.start..end)
                .filter(|i| !state.store.has_block(*i))
                .collect()
        };
        if range.linear {
            for index in missing {
                self.fetch(index).await.map_err(into_download_error)?;
            }
        } else {
            let parallel = self.shared.config.max_parallel_downloads.max(1);
            let mut pending = missing.into_iter();
            let mut tasks = tokio::task::JoinSet::new();
            loop {
                while tasks.len() < parallel {
                    match pending.next() {
                        Some(index) => {
                            let log = self.clone();
                            tasks.spawn(async move { log.fetch(index).await });
                        }
                        None => break,
                    }
                }
                match tasks.join_next().await {
                    None => break,
                    Some(Ok(Ok(_))) => {}
                    Some(Ok(Err(err))) => {
                        tasks.abort_all();
                        return Err(into_download_error(err));
                    }
                    Some(Err(_)) => {
                        tasks.abort_all();
                        return Err(DownloadError::Closed);
                    }
                }
            }
        }
        Ok(())
    }

    /// Obtain a finding-peers token. See [`FindingPeers`].
    pub fn find_peers(&self) -> FindingPeers {
        self.shared.state.lock().finding_peers += 1;
        FindingPeers {
            shared: self.shared.clone(),
            released: false,
        }
    }

    /// Close the log: terminate all replication sessions and refuse
    /// further operations. Stored data is released, never deleted.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for session in state.sessions.values() {
            let _ = session.cmd_tx.send(SessionCmd::Close);
        }
        state.block_waiters.clear();
        state.miss_waiters.clear();
        state.subscribers.clear();
        drop(state);
        self.shared.sessions_changed.notify_waiters();
    }

    /// One round-trip of the fetch loop: try local storage, then request
    /// the block from sessions that advertise it, retrying across the
    /// session set.
    async fn fetch(&self, index: u64) -> Result<Bytes, GetError> {
        let shared = &self.shared;
        let mut tried: HashSet<u64> = HashSet::new();
        let mut rounds = 0usize;
        loop {
            enum Plan {
                Attempt {
                    sid: u64,
                    waiter: u64,
                    block_rx: oneshot::Receiver<Bytes>,
                    miss_rx: oneshot::Receiver<Miss>,
                },
                WaitForSessions,
                RoundComplete,
            }

            let notified = shared.sessions_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let plan = {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(GetError::Closed);
                }
                if let Some(payload) = state.store.get_block(index) {
                    return Ok(payload);
                }
                let candidate = state
                    .sessions
                    .iter()
                    .filter(|(sid, s)| {
                        !tried.contains(*sid)
                            && s.remote_head.is_some_and(|h| h.length > index)
                    })
                    .map(|(sid, _)| *sid)
                    .min();
                match candidate {
                    Some(sid) => {
                        let (block_tx, block_rx) = oneshot::channel();
                        let (miss_tx, miss_rx) = oneshot::channel();
                        let waiter = state.next_waiter;
                        state.next_waiter += 1;
                        state
                            .block_waiters
                            .entry(index)
                            .or_default()
                            .insert(waiter, block_tx);
                        state.miss_waiters.insert((sid, index), miss_tx);
                        let _ = state.sessions[&sid]
                            .cmd_tx
                            .send(SessionCmd::Request { index });
                        Plan::Attempt {
                            sid,
                            waiter,
                            block_rx,
                            miss_rx,
                        }
                    }
                    None => {
                        // Sessions that could serve exist but were all
                        // tried this round: start another round. An
                        // outstanding finding-peers token means supply may
                        // yet appear.
                        let any_supplier = state
                            .sessions
                            .values()
                            .any(|s| s.remote_head.is_some_and(|h| h.length > index));
                        let any_expected = state.finding_peers > 0;
                        if any_supplier {
                            Plan::RoundComplete
                        } else if any_expected {
                            Plan::WaitForSessions
                        } else {
                            return Err(GetError::BlockUnavailable { index });
                        }
                    }
                }
            };

            match plan {
                Plan::Attempt {
                    sid,
                    waiter,
                    block_rx,
                    miss_rx,
                } => {
                    let outcome = tokio::time::timeout(shared.config.request_timeout, async {
                        tokio::select! {
                            block = block_rx => block.ok(),
                            miss = miss_rx => {
                                trace!(index, session = sid, miss = ?miss, "fetch attempt missed");
                                None
                            }
                        }
                    })
                    .await;
                    // Drop our waiter registrations before deciding.
                    {
                        let mut state = shared.state.lock();
                        let now_empty = state
                            .block_waiters
                            .get_mut(&index)
                            .map(|waiters| {
                                waiters.remove(&waiter);
                                waiters.is_empty()
                            })
                            .unwrap_or(false);
                        if now_empty {
                            state.block_waiters.remove(&index);
                        }
                        state.miss_waiters.remove(&(sid, index));
                    }
                    match outcome {
                        Ok(Some(payload)) => return Ok(payload),
                        Ok(None) => {
                            tried.insert(sid);
                        }
                        Err(_) => {
                            // Attempt timed out; withdraw the request and
                            // move to another session.
                            let state = shared.state.lock();
                            if let Some(session) = state.sessions.get(&sid) {
                                let _ = session.cmd_tx.send(SessionCmd::Cancel { index });
                            }
                            drop(state);
                            tried.insert(sid);
                        }
                    }
                }
                Plan::RoundComplete => {
                    rounds += 1;
                    if rounds >= shared.config.max_fetch_rounds {
                        warn!(index, rounds, "fetch exhausted the session set");
                        return Err(GetError::PeerSetExhausted { index });
                    }
                    tried.clear();
                    tokio::time::sleep(shared.config.retry_delay).await;
                }
                Plan::WaitForSessions => {
                    notified.await;
                }
            }
        }
    }
}

fn into_download_error(err: GetError) -> DownloadError {
    match err {
        GetError::Closed => DownloadError::Closed,
        GetError::PeerSetExhausted { index }
        | GetError::BlockUnavailable { index }
        | GetError::RequestTimeout { index } => DownloadError::PeerSetExhausted { index },
    }
}

impl State {
    pub(crate) fn emit(&mut self, event: LogEvent) {
        self.subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn wake_block_waiters(&mut self, index: u64, payload: &Bytes) {
        if let Some(waiters) = self.block_waiters.remove(&index) {
            for (_, tx) in waiters {
                let _ = tx.send(payload.clone());
            }
        }
    }

    /// Register a session that completed its open exchange.
    pub(crate) fn register_session(
        &mut self,
        remote_head: Option<SignedHead>,
        cmd_tx: mpsc::UnboundedSender<SessionCmd>,
        peer: Option<PublicKey>,
    ) -> u64 {
        let sid = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            sid,
            SessionInfo {
                remote_head,
                cmd_tx,
                peer,
            },
        );
        self.emit(LogEvent::SessionOpened { session: sid, peer });
        sid
    }

    pub(crate) fn unregister_session(&mut self, sid: u64, banned: bool) {
        let info = self.sessions.remove(&sid);
        let keys: Vec<(u64, u64)> = self
            .miss_waiters
            .keys()
            .filter(|(s, _)| *s == sid)
            .copied()
            .collect();
        for key in keys {
            if let Some(tx) = self.miss_waiters.remove(&key) {
                let _ = tx.send(Miss::SessionClosed);
            }
        }
        if banned {
            self.emit(LogEvent::SessionBanned {
                session: sid,
                peer: info.and_then(|i| i.peer),
            });
        } else {
            self.emit(LogEvent::SessionClosed { session: sid });
        }
    }

    pub(crate) fn set_remote_head(&mut self, sid: u64, head: SignedHead) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            let longer = session.remote_head.map_or(true, |h| head.length > h.length);
            if longer {
                session.remote_head = Some(head);
            }
        }
    }

    /// Store a block whose proof already verified, extend the contiguous
    /// leaf-hash prefix, adopt a longer head, and wake waiters.
    pub(crate) fn store_verified_block(
        &mut self,
        index: u64,
        payload: Bytes,
        head: SignedHead,
    ) -> Option<LogEvent> {
        self.store.put_block(index, payload.clone());
        while let Some(block) = self.store.get_block(self.leaf_hashes.len() as u64) {
            self.leaf_hashes.push(tree::leaf_hash(&block));
        }
        self.wake_block_waiters(index, &payload);
        let local = self.head.map_or(0, |h| h.length);
        if head.length > local {
            self.head = Some(head);
            let event = LogEvent::HeadUpdated {
                length: head.length,
            };
            self.emit(event.clone());
            return Some(event);
        }
        None
    }

    /// Build a response for a block request: the payload plus its proof
    /// against our head. Serving requires the contiguous leaf-hash prefix
    /// to cover the head, i.e. a writer or a fully synced replica.
    pub(crate) fn serve(&self, index: u64) -> Option<(Bytes, Vec<Hash>, SignedHead)> {
        let head = self.head?;
        if index >= head.length || (self.leaf_hashes.len() as u64) < head.length {
            return None;
        }
        let payload = self.store.get_block(index)?;
        let path = tree::proof_path(&self.leaf_hashes[..head.length as usize], index);
        Some((payload, path, head))
    }

    pub(crate) fn resolve_miss(&mut self, sid: u64, index: u64) {
        if let Some(tx) = self.miss_waiters.remove(&(sid, index)) {
            let _ = tx.send(Miss::DontHave);
        }
    }
}
