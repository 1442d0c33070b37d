//! Block storage.
//!
//! Storage is exclusively owned by the process holding the log; the
//! [`Store`] trait is the seam where a persistent backend slots in.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Backing storage for a log's blocks.
pub trait Store: Send + 'static {
    /// Returns the payload at `index`, if stored.
    fn get_block(&self, index: u64) -> Option<Bytes>;

    /// Stores the payload at `index`. Blocks are immutable; a store may
    /// ignore a second write to the same index.
    fn put_block(&mut self, index: u64, payload: Bytes);

    /// Whether a payload is stored at `index`.
    fn has_block(&self, index: u64) -> bool {
        self.get_block(index).is_some()
    }

    /// Total bytes currently stored.
    fn stored_bytes(&self) -> u64;
}

/// In-memory block store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: BTreeMap<u64, Bytes>,
    bytes: u64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_block(&self, index: u64) -> Option<Bytes> {
        self.blocks.get(&index).cloned()
    }

    fn put_block(&mut self, index: u64, payload: Bytes) {
        if let std::collections::btree_map::Entry::Vacant(e) = self.blocks.entry(index) {
            self.bytes += payload.len() as u64;
            e.insert(payload);
        }
    }

    fn has_block(&self, index: u64) -> bool {
        self.blocks.contains_key(&index)
    }

    fn stored_bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mut store = MemoryStore::new();
        assert!(!store.has_block(0));
        store.put_block(0, Bytes::from_static(b"hello"));
        assert_eq!(store.get_block(0).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.stored_bytes(), 5);
    }

    #[test]
    fn test_blocks_are_immutable() {
        let mut store = MemoryStore::new();
        store.put_block(3, Bytes::from_static(b"first"));
        store.put_block(3, Bytes::from_static(b"second"));
        assert_eq!(store.get_block(3).unwrap(), Bytes::from_static(b"first"));
        assert_eq!(store.stored_bytes(), 5);
    }
}
