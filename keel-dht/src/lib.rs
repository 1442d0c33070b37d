//! Kademlia-style overlay with authenticated encrypted streams.
//!
//! A [`Node`] joins the overlay through a set of bootstrap addresses,
//! announces 32-byte topics, looks up the peers announced under them,
//! and opens end-to-end encrypted streams whose identity is the remote's
//! public key, proven during the handshake. Direct TCP is tried first; a
//! relay splices the stream when traversal fails.

use std::sync::Arc;

use keel_base::PublicKey;

pub mod config;
pub mod connect;
pub mod id;
pub mod node;
pub mod proto;
pub mod routing;
pub mod stream;

mod frames;
mod handshake;
mod relay;

pub use config::DhtConfig;
pub use connect::{
    ConnectError, Connection, PeerRejection, RejectReason, Role, Server, ServerOptions, Transport,
};
pub use handshake::HandshakeError;
pub use id::{Distance, Id};
pub use node::{AnnounceError, AnnounceHandle, Node, NodeError, OverlayUnreachable};
pub use proto::{NodeRecord, PeerRecord, SignedPeerRecord};
pub use stream::SecureStream;

/// Inbound connection policy.
///
/// Called once per inbound handshake attempt with the claimed remote
/// public key and the initiator's handshake payload, before any
/// application data is exchanged. Returning `false` aborts the attempt
/// with no further protocol exposure to the rejected party.
pub type Firewall = Arc<dyn Fn(&PublicKey, &[u8]) -> bool + Send + Sync>;
