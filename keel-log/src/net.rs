//! Wire protocol for log replication.
//!
//! A session binds one connection to one log. Both sides open with their
//! discovery key and current signed head; after that the exchange is
//! sparse. Blocks travel only in response to requests, each carrying an
//! inclusion proof that is checked before anything touches storage.
//!
//! Runs over any ordered byte stream; the transport is expected to
//! provide confidentiality and peer authentication.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_lite::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace, warn, Instrument};

use futures_util::SinkExt;
use keel_base::{PublicKey, Topic};
use serde::{Deserialize, Serialize};

use crate::{
    log::Log,
    tree::{Proof, SignedHead},
};

/// Tuning knobs for replication. The defaults are the documented
/// behavior; they exist as configuration for tests.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// How long a single fetch attempt against one session may take
    /// before the request is retried against another session.
    pub request_timeout: std::time::Duration,
    /// How many rounds over the whole session set a fetch makes before
    /// giving up with `PeerSetExhausted`.
    pub max_fetch_rounds: usize,
    /// Pause between fetch rounds.
    pub retry_delay: std::time::Duration,
    /// Concurrent block fetches for a non-linear download.
    pub max_parallel_downloads: usize,
    /// Upper bound on a single wire frame.
    pub max_message_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: std::time::Duration::from_secs(10),
            max_fetch_rounds: 3,
            retry_delay: std::time::Duration::from_millis(250),
            max_parallel_downloads: 8,
            max_message_size: 1024 * 1024 * 16,
        }
    }
}

/// A replication protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First message in both directions: which log, and the sender's
    /// current head.
    Open {
        /// Discovery key of the log being replicated.
        discovery_key: Topic,
        /// The sender's latest signed head, if it has one.
        head: Option<SignedHead>,
    },
    /// The sender's head advanced.
    Head(SignedHead),
    /// Ask for the block at `index`.
    Request {
        /// Block index.
        index: u64,
    },
    /// The sender cannot serve the block at `index`.
    DontHave {
        /// Block index.
        index: u64,
    },
    /// A block with its inclusion proof.
    Data {
        /// Block index.
        index: u64,
        /// Raw payload.
        payload: Bytes,
        /// Proof linking the payload to the log's public key.
        proof: Proof,
    },
    /// Withdraw an earlier request for `index`.
    Cancel {
        /// Block index.
        index: u64,
    },
    /// Orderly end of the session.
    Close,
}

/// Commands from the log to a session task.
#[derive(Debug)]
pub(crate) enum SessionCmd {
    Request { index: u64 },
    Cancel { index: u64 },
    Head(SignedHead),
    Close,
}

/// Length-prefixed postcard framing.
#[derive(Debug)]
pub struct LogCodec {
    max_message_size: usize,
}

impl LogCodec {
    /// Create a codec with the given frame size bound.
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for LogCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().unwrap();
        let frame_len = u32::from_be_bytes(bytes) as usize;
        if frame_len > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {frame_len} bytes exceeds limit"),
            ));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let message = postcard::from_bytes(&src[4..4 + frame_len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        src.advance(4 + frame_len);
        Ok(Some(message))
    }
}

impl Encoder<Message> for LogCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = postcard::to_stdvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if encoded.len() > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", encoded.len()),
            ));
        }
        dst.put_u32(encoded.len() as u32);
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Error terminating a replication session.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("remote opened a different log")]
    LogMismatch,
    #[error("remote sent a head with an invalid signature")]
    BadHead,
    #[error("remote violated the protocol: {0}")]
    Protocol(&'static str),
    #[error("proof for block {index} did not verify")]
    ProofInvalid { index: u64 },
}

/// Handle to a running replication session.
#[derive(Debug)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    closed_rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl SessionHandle {
    /// Ask the session to close. The log's stored data is unaffected.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Close);
    }

    /// Wait for the session to end, returning why.
    pub async fn closed(self) -> Result<(), SessionError> {
        self.closed_rx.await.unwrap_or(Ok(()))
    }
}

impl Log {
    /// Bind a connection to this log and start replicating over it.
    ///
    /// The session ends when the stream closes, [`SessionHandle::close`]
    /// is called, the log is closed, or the remote commits a protocol
    /// violation.
    pub fn replicate<S>(&self, stream: S) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.replicate_with_peer(stream, None)
    }

    /// Like [`Log::replicate`], labelling the session with the remote's
    /// authenticated identity for events and diagnostics.
    pub fn replicate_with_peer<S>(&self, stream: S, peer: Option<PublicKey>) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let max = self.shared.config.max_message_size;
        let reader = FramedRead::new(reader, LogCodec::new(max));
        let writer = FramedWrite::new(writer, LogCodec::new(max));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let log = self.clone();
        let span = tracing::error_span!(
            "replicate",
            log = %log.shared.public.fmt_short(),
        );
        let task_cmd_tx = cmd_tx.clone();
        tokio::spawn(
            async move {
                let mut session = SessionTask {
                    log,
                    reader,
                    writer,
                    cmd_rx,
                    cmd_tx: task_cmd_tx,
                    peer,
                    sid: None,
                };
                let res = session.run().await;
                session.finish(&res);
                let _ = closed_tx.send(res);
            }
            .instrument(span),
        );
        SessionHandle { cmd_tx, closed_rx }
    }
}

struct SessionTask<R, W> {
    log: Log,
    reader: FramedRead<R, LogCodec>,
    writer: FramedWrite<W, LogCodec>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    peer: Option<PublicKey>,
    sid: Option<u64>,
}

impl<R, W> SessionTask<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<(), SessionError> {
        let (discovery_key, head) = {
            let state = self.log.shared.state.lock();
            (self.log.shared.discovery_key, state.head)
        };
        self.writer
            .send(Message::Open {
                discovery_key,
                head,
            })
            .await?;

        loop {
            tokio::select! {
                frame = self.reader.next() => {
                    match frame {
                        None => return Ok(()),
                        Some(Err(err)) => return Err(err.into()),
                        Some(Ok(message)) => {
                            if !self.handle_message(message).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(SessionCmd::Close) => {
                            let _ = self.writer.send(Message::Close).await;
                            return Ok(());
                        }
                        Some(SessionCmd::Request { index }) => {
                            self.writer.send(Message::Request { index }).await?;
                        }
                        Some(SessionCmd::Cancel { index }) => {
                            self.writer.send(Message::Cancel { index }).await?;
                        }
                        Some(SessionCmd::Head(head)) => {
                            self.writer.send(Message::Head(head)).await?;
                        }
                    }
                }
            }
        }
    }

    /// Returns `Ok(false)` for an orderly close.
    async fn handle_message(&mut self, message: Message) -> Result<bool, SessionError> {
        match message {
            Message::Open {
                discovery_key,
                head,
            } => {
                if self.sid.is_some() {
                    return Err(SessionError::Protocol("double open"));
                }
                if discovery_key != self.log.shared.discovery_key {
                    return Err(SessionError::LogMismatch);
                }
                if let Some(head) = &head {
                    head.verify(&self.log.shared.public)
                        .map_err(|_| SessionError::BadHead)?;
                }
                let our_head = {
                    let mut state = self.log.shared.state.lock();
                    if state.closed {
                        return Ok(false);
                    }
                    let sid = state.register_session(head, self.cmd_tx.clone(), self.peer);
                    self.sid = Some(sid);
                    state.head
                };
                self.log.shared.sessions_changed.notify_waiters();
                debug!(remote_len = head.map_or(0, |h| h.length), "session open");
                // Our head may have advanced since we sent Open.
                if let Some(our_head) = our_head {
                    self.writer.send(Message::Head(our_head)).await?;
                }
                Ok(true)
            }
            Message::Head(head) => {
                let sid = self.require_open()?;
                head.verify(&self.log.shared.public)
                    .map_err(|_| SessionError::BadHead)?;
                trace!(length = head.length, "remote head");
                let mut state = self.log.shared.state.lock();
                state.set_remote_head(sid, head);
                drop(state);
                self.log.shared.sessions_changed.notify_waiters();
                Ok(true)
            }
            Message::Request { index } => {
                self.require_open()?;
                let served = self.log.shared.state.lock().serve(index);
                match served {
                    Some((payload, path, head)) => {
                        trace!(index, "serving block");
                        self.writer
                            .send(Message::Data {
                                index,
                                payload,
                                proof: Proof { head, path },
                            })
                            .await?;
                    }
                    None => {
                        trace!(index, "cannot serve block");
                        self.writer.send(Message::DontHave { index }).await?;
                    }
                }
                Ok(true)
            }
            Message::DontHave { index } => {
                let sid = self.require_open()?;
                self.log.shared.state.lock().resolve_miss(sid, index);
                Ok(true)
            }
            Message::Data {
                index,
                payload,
                proof,
            } => {
                self.require_open()?;
                if !proof.verify(&self.log.shared.public, index, &payload) {
                    warn!(index, "received block with invalid proof, banning session");
                    return Err(SessionError::ProofInvalid { index });
                }
                let mut state = self.log.shared.state.lock();
                state.store_verified_block(index, payload, proof.head);
                drop(state);
                self.log.shared.sessions_changed.notify_waiters();
                Ok(true)
            }
            // Serving is immediate, there is no queue to withdraw from.
            Message::Cancel { .. } => Ok(true),
            Message::Close => Ok(false),
        }
    }

    fn require_open(&self) -> Result<u64, SessionError> {
        self.sid
            .ok_or(SessionError::Protocol("message before open"))
    }

    fn finish(&mut self, res: &Result<(), SessionError>) {
        if let Some(sid) = self.sid {
            let banned = matches!(
                res,
                Err(SessionError::ProofInvalid { .. })
                    | Err(SessionError::BadHead)
                    | Err(SessionError::Protocol(_))
            );
            let mut state = self.log.shared.state.lock();
            state.unregister_session(sid, banned);
            drop(state);
            self.log.shared.sessions_changed.notify_waiters();
        }
        match res {
            Ok(()) => debug!("session closed"),
            Err(err) => debug!("session failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_base::SecretKey;

    use crate::log::{GetError, LogEvent};
    use crate::store::MemoryStore;
    use crate::tree;

    use super::*;

    fn setup_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn writer_log() -> Log {
        Log::create(SecretKey::from_bytes(&[1u8; 32]))
    }

    fn reader_log(writer: &Log) -> Log {
        Log::open(writer.public_key())
    }

    /// Wait until the reader has adopted a head of at least `length`.
    /// An append on the writer reaches the reader via a head broadcast,
    /// which races plain `get` calls issued right after the append.
    async fn wait_for_length(
        log: &Log,
        events: &async_channel::Receiver<crate::log::LogEvent>,
        length: u64,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.len() < length {
                let _ = events.recv().await;
            }
        })
        .await
        .expect("head did not propagate in time");
    }

    #[tokio::test]
    async fn test_writer_reader_sync() {
        setup_logging();
        let writer = writer_log();
        writer.append_batch([&b"a"[..], b"b", b"c"]).unwrap();
        assert_eq!(writer.len(), 3);

        let reader = reader_log(&writer);
        let (left, right) = tokio::io::duplex(1024);
        let _ws = writer.replicate(left);
        let _rs = reader.replicate(right);

        let guard = reader.find_peers();
        let advanced = reader.update().await.unwrap();
        guard.release();
        assert!(advanced);
        assert_eq!(reader.len(), 3);

        let block = reader.get(1, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(block, Bytes::from_static(b"b"));
        // Fetched blocks are persisted, a second get is local.
        assert_eq!(reader.get_local(1).unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_update_without_guard_or_session_returns_false() {
        setup_logging();
        let writer = writer_log();
        let reader = reader_log(&writer);
        let advanced = tokio::time::timeout(Duration::from_millis(200), reader.update())
            .await
            .expect("must not hang")
            .unwrap();
        assert!(!advanced);
    }

    #[tokio::test]
    async fn test_update_waits_for_session_while_finding_peers() {
        setup_logging();
        let writer = writer_log();
        writer.append(&b"x"[..]).unwrap();
        let reader = reader_log(&writer);

        let guard = reader.find_peers();
        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.update().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "update must wait while guard is held");

        let (left, right) = tokio::io::duplex(1024);
        let _ws = writer.replicate(left);
        let _rs = reader.replicate(right);

        let advanced = pending.await.unwrap().unwrap();
        guard.release();
        assert!(advanced);
        assert_eq!(reader.len(), 1);
    }

    #[tokio::test]
    async fn test_live_append_reaches_reader() {
        setup_logging();
        let writer = writer_log();
        let reader = reader_log(&writer);
        let events = reader.subscribe();
        let (left, right) = tokio::io::duplex(1024);
        let _ws = writer.replicate(left);
        let _rs = reader.replicate(right);

        let guard = reader.find_peers();
        assert!(!reader.update().await.unwrap());
        guard.release();

        writer.append(&b"fresh"[..]).unwrap();
        wait_for_length(&reader, &events, 1).await;
        let block = reader.get(0, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(block, Bytes::from_static(b"fresh"));
        assert_eq!(reader.len(), 1);
    }

    #[tokio::test]
    async fn test_download_range() {
        setup_logging();
        let writer = writer_log();
        let payloads: Vec<Bytes> = (0..10)
            .map(|i| Bytes::from(format!("block {i}")))
            .collect();
        writer.append_batch(payloads.clone()).unwrap();

        let reader = reader_log(&writer);
        let (left, right) = tokio::io::duplex(4096);
        let _ws = writer.replicate(left);
        let _rs = reader.replicate(right);

        let guard = reader.find_peers();
        assert!(reader.update().await.unwrap());
        guard.release();

        let handle = reader.download(crate::log::DownloadRange {
            start: 2,
            end: Some(7),
            linear: true,
        });
        handle.done().await.unwrap();
        for i in 2..7u64 {
            assert_eq!(reader.get_local(i).unwrap(), payloads[i as usize]);
        }
        assert_eq!(reader.get_local(0), None);
        assert_eq!(reader.get_local(9), None);
    }

    #[tokio::test]
    async fn test_fully_synced_reader_serves_third_replica() {
        setup_logging();
        let writer = writer_log();
        writer.append_batch([&b"a"[..], b"b"]).unwrap();

        let reader = reader_log(&writer);
        let (left, right) = tokio::io::duplex(4096);
        let _ws = writer.replicate(left);
        let _rs = reader.replicate(right);
        let guard = reader.find_peers();
        assert!(reader.update().await.unwrap());
        guard.release();
        reader
            .download(crate::log::DownloadRange::default())
            .done()
            .await
            .unwrap();

        // A third replica connected only to the fully synced reader.
        let third = reader_log(&writer);
        let (left, right) = tokio::io::duplex(4096);
        let _rs2 = reader.replicate(left);
        let _ts = third.replicate(right);
        let guard = third.find_peers();
        assert!(third.update().await.unwrap());
        guard.release();
        let block = third.get(0, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(block, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_forged_proof_bans_session_and_stores_nothing() {
        setup_logging();
        let writer = writer_log();
        writer
            .append_batch((0..6).map(|i| Bytes::from(format!("block {i}"))))
            .unwrap();
        let head = writer.signed_head().unwrap();

        let reader = reader_log(&writer);
        let mut events = reader.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let _rs = reader.replicate(ours);

        // A malicious peer that speaks the protocol but answers block 5
        // with a payload that does not match the advertised root.
        let (malicious_reader, malicious_writer) = tokio::io::split(theirs);
        let mut rx = FramedRead::new(malicious_reader, LogCodec::new(1024 * 1024));
        let mut tx = FramedWrite::new(malicious_writer, LogCodec::new(1024 * 1024));
        tx.send(Message::Open {
            discovery_key: reader.discovery_key(),
            head: Some(head),
        })
        .await
        .unwrap();

        let malicious = tokio::spawn(async move {
            while let Some(Ok(message)) = rx.next().await {
                if let Message::Request { index } = message {
                    let bogus = Bytes::from_static(b"forged payload");
                    let path = vec![[0u8; 32]; 3];
                    tx.send(Message::Data {
                        index,
                        payload: bogus,
                        proof: Proof { head, path },
                    })
                    .await
                    .unwrap();
                }
            }
        });

        let guard = reader.find_peers();
        assert!(reader.update().await.unwrap());
        guard.release();
        assert_eq!(reader.len(), 6);

        let err = reader.get(5, Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(
            matches!(
                err,
                GetError::BlockUnavailable { index: 5 } | GetError::RequestTimeout { index: 5 }
            ),
            "unexpected error: {err:?}"
        );
        // The forged block must not be stored.
        assert_eq!(reader.get_local(5), None);

        // The session was banned, not merely closed.
        let mut banned = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LogEvent::SessionBanned { .. }) {
                banned = true;
            }
        }
        assert!(banned, "expected a SessionBanned event");
        malicious.abort();
    }

    #[tokio::test]
    async fn test_mismatched_log_terminates_session() {
        setup_logging();
        let writer = writer_log();
        let other = Log::create(SecretKey::from_bytes(&[2u8; 32]));
        let (left, right) = tokio::io::duplex(1024);
        let handle = writer.replicate(left);
        let _os = other.replicate(right);
        let res = handle.closed().await;
        assert!(matches!(res, Err(SessionError::LogMismatch)));
    }

    #[tokio::test]
    async fn test_fetch_retries_against_second_session() {
        setup_logging();
        let writer = writer_log();
        writer.append_batch([&b"a"[..], b"b"]).unwrap();
        let head = writer.signed_head().unwrap();

        let reader = Log::open_with(
            writer.public_key(),
            Box::new(MemoryStore::new()),
            ReplicationConfig {
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        // Session one: advertises the head but never serves.
        let (ours, theirs) = tokio::io::duplex(4096);
        let _s1 = reader.replicate(ours);
        let (sr, sw) = tokio::io::split(theirs);
        let mut rx = FramedRead::new(sr, LogCodec::new(1024 * 1024));
        let mut tx = FramedWrite::new(sw, LogCodec::new(1024 * 1024));
        tx.send(Message::Open {
            discovery_key: reader.discovery_key(),
            head: Some(head),
        })
        .await
        .unwrap();
        let silent = tokio::spawn(async move {
            // Swallow requests without answering.
            while let Some(Ok(_)) = rx.next().await {}
        });

        // Session two: the real writer.
        let (left, right) = tokio::io::duplex(4096);
        let _ws = writer.replicate(left);
        let _s2 = reader.replicate(right);

        let guard = reader.find_peers();
        assert!(reader.update().await.unwrap());
        guard.release();

        let block = reader.get(1, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(block, Bytes::from_static(b"b"));
        silent.abort();
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = LogCodec::new(1024);
        let mut buf = BytesMut::new();
        let secret = SecretKey::from_bytes(&[3u8; 32]);
        let leaves = vec![tree::leaf_hash(b"x")];
        let head = SignedHead::sign(&secret, 1, 1, tree::root(&leaves));
        let message = Message::Data {
            index: 0,
            payload: Bytes::from_static(b"x"),
            proof: Proof { head, path: vec![] },
        };
        codec.encode(message, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Data { index, payload, proof } => {
                assert_eq!(index, 0);
                assert_eq!(payload, Bytes::from_static(b"x"));
                assert!(proof.verify(&secret.public(), 0, b"x"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = LogCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.extend_from_slice(&[0u8; 64]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
