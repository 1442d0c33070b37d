//! Peer discovery and replicated append-only logs.
//!
//! Independent processes find each other through a content-derived topic
//! over a Kademlia-style overlay, establish authenticated encrypted
//! streams, and replicate cryptographically verifiable append-only logs
//! across them.
//!
//! The pieces, bottom up:
//!
//! - [`base`]: keypairs, the 32-byte [`Topic`] discovery identifier, and
//!   deterministic key derivation.
//! - [`dht`]: the overlay [`Node`]: bootstrap, announce/lookup, and
//!   encrypted streams with relay fallback.
//! - [`swarm`]: the [`Swarm`] coordinator: topic membership, connection
//!   events, suspend/resume, teardown.
//! - [`log`]: the replicated [`Log`]: signed heads, per-block inclusion
//!   proofs, sparse fetch, and the finding-peers guard coordinating
//!   discovery with [`Log::update`].
//!
//! A typical writer announces its log's discovery key and serves blocks;
//! a reader joins the same topic, binds the resulting connection to a
//! read-only log, and fetches what it needs:
//!
//! ```no_run
//! use keel::{
//!     DhtConfig, JoinOpts, Lifecycle, Log, Node, SecretKey, Swarm, SwarmConfig, SwarmEvent,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let node = Node::spawn(SecretKey::generate()?, DhtConfig::default()).await?;
//! let swarm = Swarm::spawn(node, Lifecycle::new(), SwarmConfig::default()).await?;
//!
//! let log = Log::create(SecretKey::generate()?);
//! log.append(&b"first entry"[..])?;
//!
//! let discovery = swarm.join(log.discovery_key(), JoinOpts::default()).await?;
//! discovery.flushed().await?;
//!
//! let events = swarm.events();
//! while let Ok(SwarmEvent::Connection { connection, .. }) = events.recv().await {
//!     log.replicate_with_peer(connection, None);
//! }
//! # Ok(())
//! # }
//! ```

pub use keel_base as base;
pub use keel_dht as dht;
pub use keel_log as log;
pub use keel_swarm as swarm;

pub use keel_base::{derive_keypair, PublicKey, SecretKey, Topic};
pub use keel_dht::{DhtConfig, Firewall, Node, PeerRecord, Role, ServerOptions, Transport};
pub use keel_log::{DownloadRange, FindingPeers, Log, LogEvent, ReplicationConfig, SignedHead};
pub use keel_swarm::{
    Discovery, JoinOpts, Lifecycle, PeerInfo, Swarm, SwarmConfig, SwarmConnection, SwarmEvent,
};
