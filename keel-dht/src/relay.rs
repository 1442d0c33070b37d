//! Minimal stream relay.
//!
//! Any server node can relay. A peer behind an unreachable address keeps
//! a control connection registered at a relay; a dialer that fails direct
//! traversal asks the relay to splice it to the target. The relay only
//! copies bytes: the handshake and all traffic stay end-to-end encrypted
//! between the two peers, so a relay learns who talks, never what.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, trace, warn};

use keel_base::PublicKey;

use crate::{
    frames::{read_frame, write_frame},
    proto::{Preamble, RelayControl},
};

const MAX_CONTROL_FRAME: usize = 256;
/// How long a half-open splice waits for the target to call back.
const SPLICE_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared state of the relay role of a server.
#[derive(Default)]
pub(crate) struct RelayState {
    /// Registered peers and the senders feeding their control streams.
    clients: Mutex<HashMap<PublicKey, mpsc::UnboundedSender<RelayControl>>>,
    /// Initiator sockets waiting for their splice partner.
    pending: Mutex<HashMap<u64, TcpStream>>,
}

impl RelayState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve a control connection for a registering peer. Runs until the
    /// peer drops the connection.
    pub(crate) async fn serve_register(
        self: &Arc<Self>,
        mut socket: TcpStream,
        public_key: PublicKey,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.clients.lock().insert(public_key, tx);
        debug!(peer = %public_key.fmt_short(), "relay client registered");
        let mut eof_buf = [0u8; 1];
        loop {
            tokio::select! {
                control = rx.recv() => match control {
                    Some(control) => {
                        if write_frame(&mut socket, &control).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                // The client never sends on the control stream; a read
                // completing means it hung up.
                _ = socket.read(&mut eof_buf) => break,
            }
        }
        self.clients.lock().remove(&public_key);
        debug!(peer = %public_key.fmt_short(), "relay client gone");
    }

    /// Handle a dialer asking to be spliced to `target`.
    pub(crate) async fn serve_connect(
        self: &Arc<Self>,
        mut socket: TcpStream,
        target: PublicKey,
    ) {
        let control = self.clients.lock().get(&target).cloned();
        let Some(control) = control else {
            trace!(target = %target.fmt_short(), "relay target not registered");
            let _ = write_frame(&mut socket, &RelayControl::Denied).await;
            return;
        };
        let pair_id: u64 = rand::random();
        self.pending.lock().insert(pair_id, socket);
        if control.send(RelayControl::Incoming { pair_id }).is_err() {
            self.pending.lock().remove(&pair_id);
            return;
        }
        // Expire the half-open splice if the target never calls back.
        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SPLICE_TIMEOUT).await;
            if state.pending.lock().remove(&pair_id).is_some() {
                debug!(pair_id, "relay splice expired");
            }
        });
    }

    /// Handle the target answering an [`RelayControl::Incoming`].
    pub(crate) async fn serve_accept(self: &Arc<Self>, mut socket: TcpStream, pair_id: u64) {
        let Some(mut initiator) = self.pending.lock().remove(&pair_id) else {
            trace!(pair_id, "relay accept for unknown pair");
            return;
        };
        if write_frame(&mut initiator, &RelayControl::Ready).await.is_err() {
            return;
        }
        trace!(pair_id, "relay splice up");
        match tokio::io::copy_bidirectional(&mut initiator, &mut socket).await {
            Ok((up, down)) => trace!(pair_id, up, down, "relay splice done"),
            Err(err) => trace!(pair_id, "relay splice ended: {err}"),
        }
    }
}

/// Dial `target` through the relay at `relay_addr`. Returns the raw
/// spliced stream, ready for the encrypted handshake.
pub(crate) async fn connect_via_relay(
    relay_addr: SocketAddr,
    target: PublicKey,
) -> io::Result<TcpStream> {
    let mut socket = TcpStream::connect(relay_addr).await?;
    write_frame(&mut socket, &Preamble::RelayConnect { target }).await?;
    match read_frame::<_, RelayControl>(&mut socket, MAX_CONTROL_FRAME).await? {
        RelayControl::Ready => Ok(socket),
        RelayControl::Denied => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "peer not registered at relay",
        )),
        other => {
            warn!(?other, "unexpected relay control frame");
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected relay control frame",
            ))
        }
    }
}

/// Open the callback stream answering an [`RelayControl::Incoming`].
pub(crate) async fn accept_via_relay(
    relay_addr: SocketAddr,
    pair_id: u64,
) -> io::Result<TcpStream> {
    let mut socket = TcpStream::connect(relay_addr).await?;
    write_frame(&mut socket, &Preamble::RelayAccept { pair_id }).await?;
    Ok(socket)
}

/// Register at the relay and return the control stream.
pub(crate) async fn register_at_relay(
    relay_addr: SocketAddr,
    public_key: PublicKey,
) -> io::Result<TcpStream> {
    let mut socket = TcpStream::connect(relay_addr).await?;
    write_frame(&mut socket, &Preamble::RelayRegister { public_key }).await?;
    Ok(socket)
}

/// Read the next control frame from a registration stream.
pub(crate) async fn next_control(socket: &mut TcpStream) -> io::Result<RelayControl> {
    read_frame(socket, MAX_CONTROL_FRAME).await
}
