//! Authenticated connections: dialing, accepting, and the server role.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, trace, warn, Instrument};

use keel_base::{PublicKey, SecretKey};

use crate::{
    frames::read_frame,
    handshake::{self, HandshakeError},
    proto::{PeerRecord, Preamble},
    relay::{self, RelayState},
    stream::SecureStream,
    Firewall,
};

const MAX_PREAMBLE_FRAME: usize = 256;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We accepted it.
    Inbound,
    /// We dialed it.
    Outbound,
}

/// How the bytes travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// A direct socket between the two peers.
    Direct,
    /// Spliced through a relay; still end-to-end encrypted.
    Relayed,
}

/// An established, authenticated, encrypted stream to a peer.
///
/// Reads and writes go through the stream cipher; the type implements
/// [`AsyncRead`] and [`AsyncWrite`] so it can be handed directly to a
/// replication session.
#[derive(Debug)]
pub struct Connection {
    stream: SecureStream<TcpStream>,
    remote: PublicKey,
    role: Role,
    transport: Transport,
    payload: Bytes,
}

impl Connection {
    /// The remote's public key, proven during the handshake.
    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    /// Which side opened the connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Direct or relayed transport.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The initiator's handshake payload (empty on the initiating side).
    pub fn handshake_payload(&self) -> &Bytes {
        &self.payload
    }

    /// Attach a pause signal to the underlying stream.
    pub fn set_pause(&mut self, pause: watch::Receiver<bool>) {
        self.stream.set_pause(pause);
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Why an inbound connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The firewall callback returned `false`.
    Firewalled,
    /// The initiator failed to prove the identity it claimed.
    HandshakeFailed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Firewalled => write!(f, "firewalled"),
            RejectReason::HandshakeFailed => write!(f, "handshake-failed"),
        }
    }
}

/// An inbound connection attempt that was refused before it produced a
/// [`Connection`].
#[derive(Debug, Clone)]
pub struct PeerRejection {
    /// Remote socket address of the attempt.
    pub addr: SocketAddr,
    /// The identity the initiator claimed, when it got that far.
    pub peer: Option<PublicKey>,
    /// Why it was refused.
    pub reason: RejectReason,
}

/// Options for [`crate::Node::create_server`].
#[derive(Clone, Default, derive_more::Debug)]
pub struct ServerOptions {
    /// Invoked per inbound attempt with the claimed public key and the
    /// initiator's handshake payload, before any data is exchanged.
    /// Returning `false` aborts the attempt with no response.
    #[debug(skip)]
    pub firewall: Option<Firewall>,
    /// Register at this relay and include it in announced records, for
    /// peers that cannot reach us directly.
    pub relay: Option<SocketAddr>,
    /// Also act as a relay for other peers.
    pub enable_relay: bool,
    /// TCP address to listen on.
    pub bind_addr: Option<SocketAddr>,
    /// Address to put into announce records when the bind address is
    /// not the externally reachable one (e.g. bound to a wildcard).
    pub advertise_addr: Option<SocketAddr>,
}

/// Accepts inbound authenticated streams.
///
/// Dropping the server stops the accept loop and, if registered, the
/// relay registration; established connections are unaffected.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    advertise_addr: Option<SocketAddr>,
    relay: Option<SocketAddr>,
    public_key: PublicKey,
    incoming: async_channel::Receiver<Connection>,
    rejections: async_channel::Receiver<PeerRejection>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// The TCP address this server accepts streams on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The reachability record to announce for this server.
    pub fn record(&self) -> PeerRecord {
        PeerRecord {
            public_key: self.public_key,
            addrs: vec![self.advertise_addr.unwrap_or(self.local_addr)],
            relay: self.relay,
        }
    }

    /// The next accepted connection; `None` once the server is closed.
    pub async fn accept(&self) -> Option<Connection> {
        self.incoming.recv().await.ok()
    }

    /// Stream of refused connection attempts.
    pub fn rejections(&self) -> async_channel::Receiver<PeerRejection> {
        self.rejections.clone()
    }

    /// Stop accepting. Idempotent.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.incoming.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) async fn start_server(
    secret: SecretKey,
    options: ServerOptions,
) -> io::Result<Server> {
    let bind_addr = options
        .bind_addr
        .unwrap_or_else(|| ([0, 0, 0, 0], 0).into());
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let (incoming_tx, incoming_rx) = async_channel::bounded(64);
    let (rejections_tx, rejections_rx) = async_channel::bounded(64);
    let relay_state = options.enable_relay.then(RelayState::new);

    let mut tasks = Vec::new();
    let accept_task = {
        let secret = secret.clone();
        let firewall = options.firewall.clone();
        let incoming_tx = incoming_tx.clone();
        let rejections_tx = rejections_tx.clone();
        tokio::spawn(
            async move {
                loop {
                    let (socket, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("accept failed: {err}");
                            continue;
                        }
                    };
                    trace!(%addr, "inbound socket");
                    let secret = secret.clone();
                    let firewall = firewall.clone();
                    let incoming_tx = incoming_tx.clone();
                    let rejections_tx = rejections_tx.clone();
                    let relay_state = relay_state.clone();
                    tokio::spawn(async move {
                        handle_inbound(
                            socket,
                            addr,
                            secret,
                            firewall,
                            relay_state,
                            incoming_tx,
                            rejections_tx,
                        )
                        .await;
                    });
                }
            }
            .instrument(tracing::error_span!("server", addr = %local_addr)),
        )
    };
    tasks.push(accept_task);

    if let Some(relay_addr) = options.relay {
        let task = tokio::spawn(
            run_relay_registration(
                relay_addr,
                secret.clone(),
                options.firewall.clone(),
                incoming_tx,
                rejections_tx,
            )
            .instrument(tracing::error_span!("relay-client", relay = %relay_addr)),
        );
        tasks.push(task);
    }

    Ok(Server {
        local_addr,
        advertise_addr: options.advertise_addr,
        relay: options.relay,
        public_key: secret.public(),
        incoming: incoming_rx,
        rejections: rejections_rx,
        tasks,
    })
}

async fn handle_inbound(
    mut socket: TcpStream,
    addr: SocketAddr,
    secret: SecretKey,
    firewall: Option<Firewall>,
    relay_state: Option<std::sync::Arc<RelayState>>,
    incoming_tx: async_channel::Sender<Connection>,
    rejections_tx: async_channel::Sender<PeerRejection>,
) {
    let preamble: Preamble = match read_frame(&mut socket, MAX_PREAMBLE_FRAME).await {
        Ok(preamble) => preamble,
        Err(err) => {
            trace!(%addr, "bad preamble: {err}");
            return;
        }
    };
    match preamble {
        Preamble::Connect => {
            match accept_handshake(socket, secret, firewall.as_ref(), Transport::Direct).await {
                Ok(connection) => {
                    let _ = incoming_tx.send(connection).await;
                }
                Err(rejection) => {
                    if let Some(rejection) = rejection.at(addr) {
                        let _ = rejections_tx.send(rejection).await;
                    }
                }
            }
        }
        Preamble::RelayRegister { public_key } => {
            if let Some(state) = relay_state {
                state.serve_register(socket, public_key).await;
            }
        }
        Preamble::RelayConnect { target } => {
            if let Some(state) = relay_state {
                state.serve_connect(socket, target).await;
            }
        }
        Preamble::RelayAccept { pair_id } => {
            if let Some(state) = relay_state {
                state.serve_accept(socket, pair_id).await;
            }
        }
    }
}

/// A refused inbound attempt, before the address is attached.
struct Refusal {
    peer: Option<PublicKey>,
    reason: Option<RejectReason>,
}

impl Refusal {
    fn at(self, addr: SocketAddr) -> Option<PeerRejection> {
        self.reason.map(|reason| PeerRejection {
            addr,
            peer: self.peer,
            reason,
        })
    }
}

async fn accept_handshake(
    mut socket: TcpStream,
    secret: SecretKey,
    firewall: Option<&Firewall>,
    transport: Transport,
) -> Result<Connection, Refusal> {
    match handshake::respond(&mut socket, &secret, firewall).await {
        Ok(outcome) => {
            debug!(remote = %outcome.remote.fmt_short(), ?transport, "inbound connection");
            Ok(Connection {
                stream: SecureStream::new(socket, outcome.send, outcome.recv),
                remote: outcome.remote,
                role: Role::Inbound,
                transport,
                payload: outcome.payload,
            })
        }
        Err(HandshakeError::Firewalled { claimed }) => Err(Refusal {
            peer: Some(*claimed),
            reason: Some(RejectReason::Firewalled),
        }),
        Err(HandshakeError::BadSignature) => Err(Refusal {
            peer: None,
            reason: Some(RejectReason::HandshakeFailed),
        }),
        Err(err) => {
            trace!("inbound handshake failed: {err}");
            Err(Refusal {
                peer: None,
                reason: None,
            })
        }
    }
}

async fn run_relay_registration(
    relay_addr: SocketAddr,
    secret: SecretKey,
    firewall: Option<Firewall>,
    incoming_tx: async_channel::Sender<Connection>,
    rejections_tx: async_channel::Sender<PeerRejection>,
) {
    let mut backoff = std::time::Duration::from_millis(500);
    loop {
        match relay::register_at_relay(relay_addr, secret.public()).await {
            Ok(mut control) => {
                debug!("registered at relay");
                backoff = std::time::Duration::from_millis(500);
                loop {
                    match relay::next_control(&mut control).await {
                        Ok(crate::proto::RelayControl::Incoming { pair_id }) => {
                            let secret = secret.clone();
                            let firewall = firewall.clone();
                            let incoming_tx = incoming_tx.clone();
                            let rejections_tx = rejections_tx.clone();
                            tokio::spawn(async move {
                                let socket = match relay::accept_via_relay(relay_addr, pair_id).await
                                {
                                    Ok(socket) => socket,
                                    Err(err) => {
                                        debug!("relay callback failed: {err}");
                                        return;
                                    }
                                };
                                match accept_handshake(
                                    socket,
                                    secret,
                                    firewall.as_ref(),
                                    Transport::Relayed,
                                )
                                .await
                                {
                                    Ok(connection) => {
                                        let _ = incoming_tx.send(connection).await;
                                    }
                                    Err(refusal) => {
                                        if let Some(rejection) = refusal.at(relay_addr) {
                                            let _ = rejections_tx.send(rejection).await;
                                        }
                                    }
                                }
                            });
                        }
                        Ok(other) => trace!(?other, "ignoring relay control frame"),
                        Err(err) => {
                            debug!("relay control stream ended: {err}");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                debug!("relay registration failed: {err}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(std::time::Duration::from_secs(30));
    }
}

/// Errors from dialing a peer.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ConnectError {
    #[error("no announce record found for peer {0}")]
    PeerNotFound(PublicKey),
    #[error("peer unreachable on {tried} advertised addresses")]
    Unreachable { tried: usize },
    #[error(transparent)]
    Handshake(HandshakeError),
    #[error("overlay lookup failed: {0}")]
    Lookup(#[from] crate::node::NodeError),
}

/// Dial the peer described by `record`: direct addresses first, relay
/// fallback second. The resulting connection is tagged with the
/// transport that worked.
pub(crate) async fn dial_record(
    secret: &SecretKey,
    record: &PeerRecord,
    payload: Bytes,
) -> Result<Connection, ConnectError> {
    let mut tried = 0usize;
    for addr in &record.addrs {
        tried += 1;
        match dial_direct(secret, *addr, record.public_key, payload.clone()).await {
            Ok(connection) => return Ok(connection),
            // Identity and signature failures are authoritative for the
            // peer, not the path; trying more addresses would dial the
            // same wrong peer.
            Err(ConnectError::Handshake(err @ HandshakeError::PeerMismatch { .. }))
            | Err(ConnectError::Handshake(err @ HandshakeError::BadSignature)) => {
                return Err(ConnectError::Handshake(err));
            }
            Err(err) => {
                trace!(%addr, "direct dial failed: {err}");
            }
        }
    }
    if let Some(relay_addr) = record.relay {
        tried += 1;
        match dial_relayed(secret, relay_addr, record.public_key, payload).await {
            Ok(connection) => return Ok(connection),
            Err(err) => trace!(relay = %relay_addr, "relayed dial failed: {err}"),
        }
    }
    Err(ConnectError::Unreachable { tried })
}

async fn dial_direct(
    secret: &SecretKey,
    addr: SocketAddr,
    expected: PublicKey,
    payload: Bytes,
) -> Result<Connection, ConnectError> {
    let mut socket = TcpStream::connect(addr)
        .await
        .map_err(|e| ConnectError::Handshake(HandshakeError::Io(e)))?;
    crate::frames::write_frame(&mut socket, &Preamble::Connect)
        .await
        .map_err(|e| ConnectError::Handshake(HandshakeError::Io(e)))?;
    let outcome = handshake::initiate(&mut socket, secret, Some(expected), payload)
        .await
        .map_err(ConnectError::Handshake)?;
    debug!(remote = %outcome.remote.fmt_short(), %addr, "outbound connection");
    Ok(Connection {
        stream: SecureStream::new(socket, outcome.send, outcome.recv),
        remote: outcome.remote,
        role: Role::Outbound,
        transport: Transport::Direct,
        payload: Bytes::new(),
    })
}

async fn dial_relayed(
    secret: &SecretKey,
    relay_addr: SocketAddr,
    expected: PublicKey,
    payload: Bytes,
) -> Result<Connection, ConnectError> {
    let mut socket = relay::connect_via_relay(relay_addr, expected)
        .await
        .map_err(|e| ConnectError::Handshake(HandshakeError::Io(e)))?;
    let outcome = handshake::initiate(&mut socket, secret, Some(expected), payload)
        .await
        .map_err(ConnectError::Handshake)?;
    debug!(remote = %outcome.remote.fmt_short(), relay = %relay_addr, "outbound relayed connection");
    Ok(Connection {
        stream: SecureStream::new(socket, outcome.send, outcome.recv),
        remote: outcome.remote,
        role: Role::Outbound,
        transport: Transport::Relayed,
        payload: Bytes::new(),
    })
}
