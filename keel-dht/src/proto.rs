//! Wire formats: overlay RPC datagrams, peer records and the TCP stream
//! preamble.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use keel_base::{PublicKey, SecretKey, Signature, Topic};

use crate::id::Id;

/// Largest datagram we will emit or parse.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

const ANNOUNCE_CONTEXT: &[u8] = b"keel v1 announce";

/// A routable overlay node: identifier plus UDP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier (its public key bytes).
    pub id: Id,
    /// UDP address of its overlay socket.
    pub addr: SocketAddr,
}

/// Reachability of a peer announced under a topic: how to open an
/// authenticated stream to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's public key; streams to it are authenticated against
    /// this.
    pub public_key: PublicKey,
    /// Direct TCP addresses the peer accepts streams on.
    pub addrs: Vec<SocketAddr>,
    /// Relay to fall back to when no direct address is reachable.
    pub relay: Option<SocketAddr>,
}

/// A [`PeerRecord`] signed by the peer it describes, bound to the topic
/// it was announced under. Overlay nodes refuse to store records whose
/// signature does not verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPeerRecord {
    /// The record.
    pub record: PeerRecord,
    /// Signature by `record.public_key` over the record and topic.
    pub signature: Signature,
}

impl SignedPeerRecord {
    fn preimage(topic: &Topic, record: &PeerRecord) -> Vec<u8> {
        let mut msg = Vec::with_capacity(128);
        msg.extend_from_slice(ANNOUNCE_CONTEXT);
        msg.extend_from_slice(topic.as_bytes());
        msg.extend_from_slice(&postcard::to_stdvec(record).expect("record serializes"));
        msg
    }

    /// Sign a record for announcement under `topic`.
    pub fn sign(secret: &SecretKey, topic: &Topic, record: PeerRecord) -> Self {
        let signature = secret.sign(&Self::preimage(topic, &record));
        Self { record, signature }
    }

    /// Verify the record against the topic it was received under.
    pub fn verify(&self, topic: &Topic) -> bool {
        self.record
            .public_key
            .verify(&Self::preimage(topic, &self.record), &self.signature)
            .is_ok()
    }
}

/// Overlay RPC. One datagram carries one message; requests and responses
/// are matched by `txid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Liveness probe.
    Ping {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
    },
    /// Answer to [`RpcMessage::Ping`].
    Pong {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
    },
    /// Ask for the nodes closest to `target`.
    FindNode {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
        /// Keyspace point to search towards.
        target: Id,
    },
    /// Answer to [`RpcMessage::FindNode`].
    Nodes {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
        /// Closest nodes known to the sender.
        nodes: Vec<NodeRecord>,
    },
    /// Publish reachability under a topic.
    Announce {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
        /// Topic announced under.
        topic: Topic,
        /// The signed reachability record.
        record: SignedPeerRecord,
    },
    /// Acknowledges storage of an [`RpcMessage::Announce`].
    Announced {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
    },
    /// Query the peers announced under a topic.
    Lookup {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
        /// Topic queried.
        topic: Topic,
    },
    /// Answer to [`RpcMessage::Lookup`].
    Peers {
        /// Transaction id.
        txid: u64,
        /// Sender.
        from: NodeRecord,
        /// Announced peers stored by the sender.
        peers: Vec<SignedPeerRecord>,
        /// Closer nodes to continue the query at.
        nodes: Vec<NodeRecord>,
    },
}

impl RpcMessage {
    /// The transaction id, for request/response matching.
    pub fn txid(&self) -> u64 {
        match self {
            RpcMessage::Ping { txid, .. }
            | RpcMessage::Pong { txid, .. }
            | RpcMessage::FindNode { txid, .. }
            | RpcMessage::Nodes { txid, .. }
            | RpcMessage::Announce { txid, .. }
            | RpcMessage::Announced { txid, .. }
            | RpcMessage::Lookup { txid, .. }
            | RpcMessage::Peers { txid, .. } => *txid,
        }
    }

    /// The sender record carried in the message.
    pub fn from(&self) -> &NodeRecord {
        match self {
            RpcMessage::Ping { from, .. }
            | RpcMessage::Pong { from, .. }
            | RpcMessage::FindNode { from, .. }
            | RpcMessage::Nodes { from, .. }
            | RpcMessage::Announce { from, .. }
            | RpcMessage::Announced { from, .. }
            | RpcMessage::Lookup { from, .. }
            | RpcMessage::Peers { from, .. } => from,
        }
    }

    /// Whether this message answers an outstanding request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            RpcMessage::Pong { .. }
                | RpcMessage::Nodes { .. }
                | RpcMessage::Announced { .. }
                | RpcMessage::Peers { .. }
        )
    }
}

/// First frame on every inbound TCP stream, before any handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Preamble {
    /// An ordinary connection; the encrypted handshake follows.
    Connect,
    /// Register as a relay client; the stream becomes the control
    /// connection.
    RelayRegister {
        /// Identity of the registering peer.
        public_key: PublicKey,
    },
    /// Ask the relay to splice a stream to a registered peer.
    RelayConnect {
        /// Identity of the peer to reach.
        target: PublicKey,
    },
    /// Answer a [`RelayControl::Incoming`] notification.
    RelayAccept {
        /// Pairing token from the notification.
        pair_id: u64,
    },
}

/// Frames sent by a relay to its clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayControl {
    /// Someone wants a spliced stream; open a new connection and send
    /// [`Preamble::RelayAccept`] with this token.
    Incoming {
        /// Pairing token.
        pair_id: u64,
    },
    /// The requested splice is ready; the handshake may begin.
    Ready,
    /// The requested peer is not registered here.
    Denied,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(secret: &SecretKey) -> PeerRecord {
        PeerRecord {
            public_key: secret.public(),
            addrs: vec![([127, 0, 0, 1], 4001).into()],
            relay: None,
        }
    }

    #[test]
    fn test_signed_record_roundtrip() {
        let secret = SecretKey::from_bytes(&[1u8; 32]);
        let topic = Topic::from_name("records");
        let signed = SignedPeerRecord::sign(&secret, &topic, record(&secret));
        assert!(signed.verify(&topic));

        let encoded = postcard::to_stdvec(&signed).unwrap();
        let decoded: SignedPeerRecord = postcard::from_bytes(&encoded).unwrap();
        assert!(decoded.verify(&topic));
        assert_eq!(decoded, signed);
    }

    #[test]
    fn test_signed_record_is_topic_bound() {
        let secret = SecretKey::from_bytes(&[1u8; 32]);
        let topic = Topic::from_name("records");
        let signed = SignedPeerRecord::sign(&secret, &topic, record(&secret));
        assert!(!signed.verify(&Topic::from_name("other")));
    }

    #[test]
    fn test_tampered_record_fails() {
        let secret = SecretKey::from_bytes(&[1u8; 32]);
        let topic = Topic::from_name("records");
        let mut signed = SignedPeerRecord::sign(&secret, &topic, record(&secret));
        signed.record.addrs.push(([10, 0, 0, 1], 9).into());
        assert!(!signed.verify(&topic));
    }

    #[test]
    fn test_rpc_datagram_fits() {
        let secret = SecretKey::from_bytes(&[2u8; 32]);
        let from = NodeRecord {
            id: Id::from(secret.public()),
            addr: ([127, 0, 0, 1], 4000).into(),
        };
        let topic = Topic::from_name("size check");
        let message = RpcMessage::Peers {
            txid: 7,
            from,
            peers: (0..8)
                .map(|_| SignedPeerRecord::sign(&secret, &topic, record(&secret)))
                .collect(),
            nodes: (0..20).map(|_| from).collect(),
        };
        let encoded = postcard::to_stdvec(&message).unwrap();
        assert!(encoded.len() <= MAX_DATAGRAM_SIZE, "{} bytes", encoded.len());
        assert!(message.is_response());
        assert_eq!(message.txid(), 7);
    }
}
