//! Discovery Set (C4): in-memory index of [`PeerRecord`]s by id and by name,
//! plus rebuildable per-metadata-filter caches (consistent-hash ring,
//! round-robin cursor, sorted iteration).
//!
//! Caches are lazily rebuilt on first access after a mutation rather than
//! eagerly on every insert/remove, keyed by the requesting filter's
//! canonical form so distinct filters never collide in the cache map.

use crate::discovery::ring::{hash_key, ConsistentHashRing, SearchMode};
use crate::hash::Xoshiro256StarStar;
use crate::model::{Metadata, PeerRecord};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

struct IndexCache {
    ring: ConsistentHashRing,
    round_robin_nodes: Vec<Arc<PeerRecord>>,
    round_robin_cursor: usize,
    sorted_nodes: Vec<Arc<PeerRecord>>,
}

impl IndexCache {
    fn build<I: Iterator<Item = Arc<PeerRecord>>>(nodes: I) -> Self {
        let mut sorted: Vec<Arc<PeerRecord>> = nodes.collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));

        let ring = ConsistentHashRing::build(sorted.iter().map(|p| (p.id, p.name.as_str())));

        Self {
            ring,
            round_robin_nodes: sorted.clone(),
            round_robin_cursor: 0,
            sorted_nodes: sorted,
        }
    }
}

/// The id index and the name index always agree: adding a node whose id or
/// name collides with an existing entry evicts the older one from both
/// indexes before the new record is inserted.
pub struct DiscoverySet {
    by_id: HashMap<u64, Arc<PeerRecord>>,
    by_name: HashMap<String, Arc<PeerRecord>>,
    default_cache: RefCell<Option<IndexCache>>,
    metadata_cache: RefCell<HashMap<String, IndexCache>>,
    random: RefCell<Xoshiro256StarStar>,
}

impl Default for DiscoverySet {
    fn default() -> Self {
        Self::with_seed(0x9e3779b97f4a7c15)
    }
}

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            default_cache: RefCell::new(None),
            metadata_cache: RefCell::new(HashMap::new()),
            random: RefCell::new(Xoshiro256StarStar::new(seed)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.by_name.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Inserts or updates `peer`. When an existing record already sits at
    /// `peer.id` and both records carry a known store revision
    /// (`record_version.create_revision != 0`), the update is dropped unless
    /// `peer.record_version.supersedes` the existing one — an out-of-order
    /// or stale watch event must never clobber a newer record.
    pub fn add_node(&mut self, peer: PeerRecord) {
        if !peer.is_valid() {
            return;
        }
        if let Some(existing_by_id) = self.by_id.get(&peer.id).cloned() {
            if existing_by_id.record_version.create_revision != 0
                && peer.record_version.create_revision != 0
                && !peer.record_version.supersedes(&existing_by_id.record_version)
            {
                return;
            }
            if existing_by_id.name != peer.name {
                self.by_name.remove(&existing_by_id.name);
            }
        }
        if let Some(existing_by_name) = self.by_name.get(&peer.name).cloned() {
            if existing_by_name.id != peer.id {
                self.by_id.remove(&existing_by_name.id);
            }
        }

        let record = Arc::new(peer);
        self.by_id.insert(record.id, record.clone());
        self.by_name.insert(record.name.clone(), record);
        self.invalidate_caches();
    }

    pub fn remove_node_by_id(&mut self, id: u64) {
        if let Some(node) = self.by_id.remove(&id) {
            self.by_name.remove(&node.name);
            self.invalidate_caches();
        }
    }

    pub fn remove_node_by_name(&mut self, name: &str) {
        if let Some(node) = self.by_name.remove(name) {
            self.by_id.remove(&node.id);
            self.invalidate_caches();
        }
    }

    pub fn get_node_by_id(&self, id: u64) -> Option<Arc<PeerRecord>> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_node_by_name(&self, name: &str) -> Option<Arc<PeerRecord>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_node_by_consistent_hash(
        &self,
        key: &[u8],
        filter: Option<&Metadata>,
    ) -> Option<Arc<PeerRecord>> {
        let hash = hash_key(key);
        self.with_cache(filter, |cache| {
            cache.ring.closest(hash).and_then(|id| self.by_id.get(&id).cloned())
        })
    }

    pub fn lower_bound_node_hash_by_consistent_hash(
        &self,
        key: &[u8],
        filter: Option<&Metadata>,
        mode: SearchMode,
        self_id: Option<u64>,
        max: usize,
    ) -> Vec<Arc<PeerRecord>> {
        let hash = hash_key(key);
        self.with_cache(filter, |cache| {
            cache
                .ring
                .lower_bound(hash, mode, self_id, max)
                .into_iter()
                .filter_map(|id| self.by_id.get(&id).cloned())
                .collect()
        })
    }

    pub fn get_node_by_random(&self, filter: Option<&Metadata>) -> Option<Arc<PeerRecord>> {
        self.with_cache(filter, |cache| {
            if cache.sorted_nodes.is_empty() {
                None
            } else {
                let idx = self.random.borrow_mut().bounded(cache.sorted_nodes.len());
                Some(cache.sorted_nodes[idx].clone())
            }
        })
    }

    pub fn get_node_by_round_robin(&self, filter: Option<&Metadata>) -> Option<Arc<PeerRecord>> {
        self.with_cache_mut(filter, |cache| {
            if cache.round_robin_nodes.is_empty() {
                return None;
            }
            let idx = cache.round_robin_cursor % cache.round_robin_nodes.len();
            cache.round_robin_cursor = cache.round_robin_cursor.wrapping_add(1);
            Some(cache.round_robin_nodes[idx].clone())
        })
    }

    pub fn get_sorted_nodes(&self, filter: Option<&Metadata>) -> Vec<Arc<PeerRecord>> {
        self.with_cache(filter, |cache| cache.sorted_nodes.clone())
    }

    fn invalidate_caches(&self) {
        *self.default_cache.borrow_mut() = None;
        self.metadata_cache.borrow_mut().clear();
    }

    fn ensure_default_cache(&self) {
        if self.default_cache.borrow().is_none() {
            let built = IndexCache::build(self.by_id.values().cloned());
            *self.default_cache.borrow_mut() = Some(built);
        }
    }

    fn ensure_metadata_cache(&self, filter: &Metadata) -> String {
        let key = filter.canonical_key();
        if !self.metadata_cache.borrow().contains_key(&key) {
            let built = IndexCache::build(
                self.by_id
                    .values()
                    .filter(|peer| filter.matches(&peer.metadata))
                    .cloned(),
            );
            self.metadata_cache.borrow_mut().insert(key.clone(), built);
        }
        key
    }

    fn with_cache<R>(&self, filter: Option<&Metadata>, f: impl FnOnce(&IndexCache) -> R) -> R {
        match filter {
            None => {
                self.ensure_default_cache();
                let cache = self.default_cache.borrow();
                f(cache.as_ref().expect("cache just built"))
            }
            Some(meta) => {
                let key = self.ensure_metadata_cache(meta);
                let cache = self.metadata_cache.borrow();
                f(cache.get(&key).expect("cache just built"))
            }
        }
    }

    fn with_cache_mut<R>(&self, filter: Option<&Metadata>, f: impl FnOnce(&mut IndexCache) -> R) -> R {
        match filter {
            None => {
                self.ensure_default_cache();
                let mut cache = self.default_cache.borrow_mut();
                f(cache.as_mut().expect("cache just built"))
            }
            Some(meta) => {
                let key = self.ensure_metadata_cache(meta);
                let mut cache = self.metadata_cache.borrow_mut();
                f(cache.get_mut(&key).expect("cache just built"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    fn peer(id: u64, name: &str) -> PeerRecord {
        PeerRecord {
            id,
            name: name.to_string(),
            ..Default::default()
        }
        .with_computed_hash()
    }

    #[test]
    fn add_and_lookup_by_id_and_name() {
        let mut set = DiscoverySet::new();
        set.add_node(peer(1, "svc-a"));
        assert_eq!(set.get_node_by_id(1).unwrap().name, "svc-a");
        assert_eq!(set.get_node_by_name("svc-a").unwrap().id, 1);
    }

    #[test]
    fn re_adding_same_id_with_new_name_evicts_old_name() {
        let mut set = DiscoverySet::new();
        set.add_node(peer(1, "svc-a"));
        set.add_node(peer(1, "svc-b"));
        assert!(set.get_node_by_name("svc-a").is_none());
        assert_eq!(set.get_node_by_name("svc-b").unwrap().id, 1);
    }

    #[test]
    fn re_adding_same_name_with_new_id_evicts_old_id() {
        let mut set = DiscoverySet::new();
        set.add_node(peer(1, "svc-a"));
        set.add_node(peer(2, "svc-a"));
        assert!(set.get_node_by_id(1).is_none());
        assert_eq!(set.get_node_by_id(2).unwrap().name, "svc-a");
    }

    #[test]
    fn consistent_hash_is_deterministic_regardless_of_insertion_order() {
        let mut forward = DiscoverySet::new();
        for i in 0..5 {
            forward.add_node(peer(i + 1, &format!("svc-{}", i)));
        }
        let mut backward = DiscoverySet::new();
        for i in (0..5).rev() {
            backward.add_node(peer(i + 1, &format!("svc-{}", i)));
        }

        let a = forward.get_node_by_consistent_hash(b"user-42", None);
        let b = backward.get_node_by_consistent_hash(b"user-42", None);
        assert_eq!(a.map(|p| p.id), b.map(|p| p.id));
    }

    #[test]
    fn round_robin_cycles_through_all_nodes() {
        let mut set = DiscoverySet::new();
        for i in 0..3 {
            set.add_node(peer(i + 1, &format!("svc-{}", i)));
        }
        let mut ids = std::collections::HashSet::new();
        for _ in 0..3 {
            ids.insert(set.get_node_by_round_robin(None).unwrap().id);
        }
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn metadata_filter_excludes_non_matching_peers() {
        let mut set = DiscoverySet::new();
        let mut a = peer(1, "svc-a");
        a.metadata.namespace = "prod".to_string();
        let mut b = peer(2, "svc-b");
        b.metadata.namespace = "staging".to_string();
        set.add_node(a);
        set.add_node(b);

        let mut filter = Metadata::default();
        filter.namespace = "prod".to_string();
        let sorted = set.get_sorted_nodes(Some(&filter));
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].id, 1);
    }

    #[test]
    fn stale_revision_does_not_clobber_a_newer_record() {
        use crate::model::RecordVersion;
        let mut set = DiscoverySet::new();
        let newer = peer(1, "svc-a").with_record_version(RecordVersion {
            create_revision: 5,
            modify_revision: 2,
            version: 2,
        });
        set.add_node(newer);
        let stale = peer(1, "svc-stale").with_record_version(RecordVersion {
            create_revision: 5,
            modify_revision: 1,
            version: 1,
        });
        set.add_node(stale);
        assert_eq!(set.get_node_by_id(1).unwrap().name, "svc-a");
    }

    #[test]
    fn newer_revision_overwrites_an_older_record() {
        use crate::model::RecordVersion;
        let mut set = DiscoverySet::new();
        let older = peer(1, "svc-a").with_record_version(RecordVersion {
            create_revision: 5,
            modify_revision: 1,
            version: 1,
        });
        set.add_node(older);
        let newer = peer(1, "svc-b").with_record_version(RecordVersion {
            create_revision: 5,
            modify_revision: 2,
            version: 2,
        });
        set.add_node(newer);
        assert_eq!(set.get_node_by_id(1).unwrap().name, "svc-b");
    }

    #[test]
    fn removing_a_node_invalidates_cached_lookups() {
        let mut set = DiscoverySet::new();
        set.add_node(peer(1, "svc-a"));
        set.add_node(peer(2, "svc-b"));
        assert!(set.get_node_by_consistent_hash(b"k", None).is_some());
        set.remove_node_by_id(1);
        set.remove_node_by_id(2);
        assert!(set.get_node_by_consistent_hash(b"k", None).is_none());
    }
}
