//! Peer identity index and per-connection route cache.
//!
//! The index is the process-global uid → connection mapping; uid order is
//! what the handover drain iterates in. The cache is a small MRU list each
//! peer keeps of the destinations it recently addressed — a linear scan of
//! at most 16 entries beats the index lookup for the typical working set.

use std::collections::BTreeMap;

use crate::relay::conn::ConnId;

/// Capacity of a per-connection route cache.
pub const PEER_CACHE_SIZE: usize = 16;

/// Global uid → connection mapping, ordered by uid.
///
/// Holds only announced connections, at most one per uid. The first
/// announcement of a uid wins; a later claim leaves the mapping untouched.
#[derive(Debug, Default)]
pub struct PeerIndex {
    by_uid: BTreeMap<u16, ConnId>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `uid → id`. Returns `false` when the uid is already claimed
    /// (the existing mapping is kept).
    pub fn insert(&mut self, uid: u16, id: ConnId) -> bool {
        match self.by_uid.entry(uid) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(id);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Remove the mapping for `uid` only if it points at `id`.
    ///
    /// Guards against a connection that announced an already-claimed uid
    /// evicting the rightful owner on teardown.
    pub fn remove_if(&mut self, uid: u16, id: ConnId) -> bool {
        match self.by_uid.get(&uid) {
            Some(&mapped) if mapped == id => {
                self.by_uid.remove(&uid);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, uid: u16) -> Option<ConnId> {
        self.by_uid.get(&uid).copied()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    /// Iterate `(uid, id)` pairs in ascending uid order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, ConnId)> + '_ {
        self.by_uid.iter().map(|(&uid, &id)| (uid, id))
    }
}

/// Bounded MRU list of recently-addressed destination ids.
///
/// MRU-on-insert only: a hit does not reshuffle the list, the tail is
/// evicted on overflow. Entries are weak ids — eviction and removal are
/// plain list edits, ownership stays with the arena.
#[derive(Debug, Default)]
pub struct PeerCache {
    entries: Vec<ConnId>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached ids, most recently inserted first.
    pub fn ids(&self) -> &[ConnId] {
        &self.entries
    }

    /// Prepend `id`, evicting the least-recently-inserted entry at capacity.
    ///
    /// Callers only add on a cache miss, so the list never holds duplicates.
    pub fn add(&mut self, id: ConnId) {
        debug_assert!(!self.entries.contains(&id));
        if self.entries.len() == PEER_CACHE_SIZE {
            self.entries.pop();
        }
        self.entries.insert(0, id);
    }

    /// Drop `id` if present.
    pub fn remove(&mut self, id: ConnId) {
        self.entries.retain(|&e| e != id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_first_announcement_wins() {
        let mut index = PeerIndex::new();
        assert!(index.insert(7, 1));
        assert!(!index.insert(7, 2));
        assert_eq!(index.get(7), Some(1));
    }

    #[test]
    fn test_index_remove_if_guards_owner() {
        let mut index = PeerIndex::new();
        index.insert(7, 1);
        // The loser of a duplicate announcement must not evict the owner.
        assert!(!index.remove_if(7, 2));
        assert_eq!(index.get(7), Some(1));
        assert!(index.remove_if(7, 1));
        assert_eq!(index.get(7), None);
    }

    #[test]
    fn test_index_iterates_in_uid_order() {
        let mut index = PeerIndex::new();
        index.insert(30, 3);
        index.insert(10, 1);
        index.insert(20, 2);
        let uids: Vec<u16> = index.iter().map(|(uid, _)| uid).collect();
        assert_eq!(uids, vec![10, 20, 30]);
    }

    #[test]
    fn test_cache_mru_order_on_insert() {
        let mut cache = PeerCache::new();
        cache.add(1);
        cache.add(2);
        cache.add(3);
        assert_eq!(cache.ids(), &[3, 2, 1]);
    }

    #[test]
    fn test_cache_evicts_tail_at_capacity() {
        let mut cache = PeerCache::new();
        for id in 0..PEER_CACHE_SIZE + 1 {
            cache.add(id);
        }
        assert_eq!(cache.len(), PEER_CACHE_SIZE);
        // The first insert is gone, the newest sits at the head.
        assert!(!cache.ids().contains(&0));
        assert_eq!(cache.ids()[0], PEER_CACHE_SIZE);
    }

    #[test]
    fn test_cache_seventeen_distinct_destinations() {
        // A peer that addresses 17 distinct uids keeps the last 16, newest
        // first, and the very first destination has been evicted.
        let mut cache = PeerCache::new();
        for id in 1..=17 {
            cache.add(id);
        }
        assert_eq!(cache.ids()[0], 17);
        assert!(!cache.ids().contains(&1));
        let expected: Vec<ConnId> = (2..=17).rev().collect();
        assert_eq!(cache.ids(), expected.as_slice());
    }

    #[test]
    fn test_cache_remove_compacts() {
        let mut cache = PeerCache::new();
        cache.add(1);
        cache.add(2);
        cache.add(3);
        cache.remove(2);
        assert_eq!(cache.ids(), &[3, 1]);
        cache.remove(9); // absent id is a no-op
        assert_eq!(cache.ids(), &[3, 1]);
    }
}
