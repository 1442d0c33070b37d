//! K-bucket routing table.

use std::{collections::HashMap, fmt, net::SocketAddr};

use arrayvec::ArrayVec;

use crate::id::{Distance, Id};

/// Maximum nodes per bucket.
pub const K: usize = 20;
/// Query concurrency for iterative lookups.
pub const ALPHA: usize = 3;

/// Result of offering a node to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Node added.
    Added,
    /// Node already present; refreshed to most recently seen.
    Refreshed,
    /// The bucket is full. Ping the returned oldest node; if it fails to
    /// answer, call [`RoutingTable::evict_and_add`].
    BucketFull {
        /// Least recently seen node in the full bucket.
        oldest: Id,
    },
    /// The node is ourselves.
    IsSelf,
}

#[derive(Clone, Default)]
struct Bucket {
    /// Oldest first; a refresh moves a node to the back.
    nodes: ArrayVec<Id, K>,
}

impl Bucket {
    fn offer(&mut self, node: Id) -> AddOutcome {
        if let Some(pos) = self.nodes.iter().position(|n| *n == node) {
            let node = self.nodes.remove(pos);
            self.nodes.push(node);
            return AddOutcome::Refreshed;
        }
        if self.nodes.len() < K {
            self.nodes.push(node);
            return AddOutcome::Added;
        }
        AddOutcome::BucketFull {
            oldest: self.nodes[0],
        }
    }

    fn remove(&mut self, node: &Id) {
        self.nodes.retain(|n| n != node);
    }
}

/// Routing table: nodes bucketed by XOR distance from the local id, with
/// their last observed socket address.
pub struct RoutingTable {
    local: Id,
    buckets: Vec<Bucket>,
    addrs: HashMap<Id, SocketAddr>,
}

impl RoutingTable {
    /// Create an empty table centered on `local`.
    pub fn new(local: Id) -> Self {
        Self {
            local,
            buckets: Vec::new(),
            addrs: HashMap::new(),
        }
    }

    /// The local identifier this table is centered on.
    pub fn local(&self) -> Id {
        self.local
    }

    /// Offer a node observed at `addr`. The address is updated even when
    /// the bucket has no room for a new node.
    pub fn offer(&mut self, node: Id, addr: SocketAddr) -> AddOutcome {
        let Some(index) = self.local.distance(&node).bucket_index() else {
            return AddOutcome::IsSelf;
        };
        if index >= self.buckets.len() {
            self.buckets.resize_with(index + 1, Bucket::default);
        }
        let outcome = self.buckets[index].offer(node);
        if !matches!(outcome, AddOutcome::BucketFull { .. }) {
            self.addrs.insert(node, addr);
        } else {
            // Keep the freshest address for a node we already route to.
            self.addrs.entry(node).and_modify(|a| *a = addr);
        }
        outcome
    }

    /// Replace a dead node with a new one in the same bucket.
    pub fn evict_and_add(&mut self, dead: Id, node: Id, addr: SocketAddr) {
        self.remove(&dead);
        self.offer(node, addr);
    }

    /// Remove a node entirely.
    pub fn remove(&mut self, node: &Id) {
        if let Some(index) = self.local.distance(node).bucket_index() {
            if index < self.buckets.len() {
                self.buckets[index].remove(node);
            }
        }
        self.addrs.remove(node);
    }

    /// The last observed address for a node.
    pub fn addr(&self, node: &Id) -> Option<SocketAddr> {
        self.addrs.get(node).copied()
    }

    /// The `count` nodes closest to `target`, with addresses.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<(Id, SocketAddr)> {
        let mut all: Vec<(Distance, Id)> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .map(|id| (target.distance(id), *id))
            .collect();
        all.sort();
        all.into_iter()
            .take(count)
            .filter_map(|(_, id)| self.addr(&id).map(|addr| (id, addr)))
            .collect()
    }

    /// Total routed nodes.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// Whether the table routes no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let non_empty: Vec<(usize, usize)> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.nodes.is_empty())
            .map(|(i, b)| (i, b.nodes.len()))
            .collect();
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("nodes", &self.len())
            .field("non_empty_buckets", &non_empty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn id_with_prefix(prefix: &[u8]) -> Id {
        let mut bytes = [0u8; 32];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Id::new(bytes)
    }

    #[test]
    fn test_offer_and_lookup() {
        let mut table = RoutingTable::new(Id::new([0u8; 32]));
        let node = id_with_prefix(&[0x80]);
        assert_eq!(table.offer(node, addr(1)), AddOutcome::Added);
        assert_eq!(table.offer(node, addr(2)), AddOutcome::Refreshed);
        assert_eq!(table.addr(&node), Some(addr(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_self_is_rejected() {
        let local = Id::new([7u8; 32]);
        let mut table = RoutingTable::new(local);
        assert_eq!(table.offer(local, addr(1)), AddOutcome::IsSelf);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bucket_overflow_names_oldest() {
        let mut table = RoutingTable::new(Id::new([0u8; 32]));
        // All these nodes differ from local in the first bit: one bucket.
        let nodes: Vec<Id> = (0..=K as u8)
            .map(|i| id_with_prefix(&[0x80, i]))
            .collect();
        for node in &nodes[..K] {
            assert_eq!(table.offer(*node, addr(1)), AddOutcome::Added);
        }
        match table.offer(nodes[K], addr(1)) {
            AddOutcome::BucketFull { oldest } => {
                assert_eq!(oldest, nodes[0]);
                table.evict_and_add(oldest, nodes[K], addr(9));
                assert_eq!(table.addr(&nodes[K]), Some(addr(9)));
                assert_eq!(table.addr(&nodes[0]), None);
                assert_eq!(table.len(), K);
            }
            other => panic!("expected BucketFull, got {other:?}"),
        }
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let mut table = RoutingTable::new(Id::new([0u8; 32]));
        let near = id_with_prefix(&[0x00, 0x01]);
        let mid = id_with_prefix(&[0x0F]);
        let far = id_with_prefix(&[0xF0]);
        for (node, port) in [(far, 1), (near, 2), (mid, 3)] {
            table.offer(node, addr(port));
        }
        let target = Id::new([0u8; 32]);
        let closest = table.closest(&target, 2);
        assert_eq!(closest, vec![(near, addr(2)), (mid, addr(3))]);
    }
}
