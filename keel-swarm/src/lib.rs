//! Topic membership coordination.
//!
//! A [`Swarm`] manages the set of topics a node cares about: it
//! announces the node under server topics, periodically looks up client
//! topics, dials discovered peers, accepts inbound streams, and surfaces
//! everything as a typed event stream. Discovery and connection
//! lifecycle are decoupled: leaving a topic keeps its connections open.

pub mod lifecycle;
pub mod swarm;

pub use lifecycle::{Lifecycle, LifecycleState};
pub use swarm::{
    Discovery, DiscoveryError, JoinOpts, PeerInfo, Swarm, SwarmConfig, SwarmConnection, SwarmError,
    SwarmEvent, TopicStatus,
};

pub use keel_dht::{Firewall, RejectReason, Role, Transport};
