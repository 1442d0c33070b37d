//! Overlay configuration.

use std::{net::SocketAddr, time::Duration};

/// Tuning for a [`crate::Node`]. The defaults are the documented
/// behavior; tests shrink the timers.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP address to bind the overlay socket to.
    pub bind_addr: SocketAddr,
    /// Known overlay members to join through. Empty means this node is
    /// an isolated root for a private overlay.
    pub bootstrap: Vec<SocketAddr>,
    /// Replication factor: how many closest nodes store an announcement.
    pub k: usize,
    /// Concurrency of iterative lookups.
    pub alpha: usize,
    /// Timeout for a single RPC round trip.
    pub request_timeout: Duration,
    /// Period of the maintenance loop: bucket refresh, re-announce,
    /// record expiry.
    pub refresh_interval: Duration,
    /// How long an announced record is stored before it expires.
    pub announce_ttl: Duration,
    /// How often stored announcements are re-published.
    pub reannounce_interval: Duration,
    /// Attempts per bootstrap round before the overlay is reported
    /// unreachable. Each attempt backs off exponentially.
    pub bootstrap_attempts: usize,
    /// First backoff delay for retried overlay operations.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
    /// Cap on stored records per topic.
    pub max_records_per_topic: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 0).into(),
            bootstrap: Vec::new(),
            k: crate::routing::K,
            alpha: crate::routing::ALPHA,
            request_timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
            announce_ttl: Duration::from_secs(600),
            reannounce_interval: Duration::from_secs(300),
            bootstrap_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(15),
            max_records_per_topic: 64,
        }
    }
}

impl DhtConfig {
    /// Configuration with the given bootstrap set.
    pub fn with_bootstrap(bootstrap: Vec<SocketAddr>) -> Self {
        Self {
            bootstrap,
            ..Default::default()
        }
    }

    /// Localhost configuration with short timers, for tests.
    pub fn for_testing(bootstrap: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            bootstrap,
            request_timeout: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(500),
            reannounce_interval: Duration::from_secs(2),
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_millis(500),
            ..Default::default()
        }
    }
}
