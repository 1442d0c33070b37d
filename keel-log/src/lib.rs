//! A replicated, cryptographically verifiable append-only log.
//!
//! A [`Log`] is an ordered sequence of immutable blocks identified by an
//! ed25519 public key. The holder of the matching secret key may append;
//! everyone else replicates. Every block is provable against a head that
//! the writer signs, so replicas accept data from anyone while trusting
//! only the writer's key.
//!
//! Replication is sparse: a session exchanges signed heads and then
//! transfers exactly the blocks the other side asks for. Run it over any
//! ordered byte stream with [`Log::replicate`].

pub mod log;
pub mod net;
pub mod store;
pub mod tree;

pub use self::log::{
    AppendError, DownloadError, DownloadHandle, DownloadRange, FindingPeers, GetError, Log,
    LogEvent, UpdateError,
};
pub use self::net::{ReplicationConfig, SessionError, SessionHandle};
pub use self::tree::{Hash, Proof, SignedHead};
