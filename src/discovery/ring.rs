//! Consistent-hash ring (part of C4): 80 virtual nodes per peer, rebuilt
//! lazily after a mutation, with a "compact" variant that collapses runs of
//! consecutive virtual nodes belonging to the same peer.
//!
//! Ring entries are sorted by hash and searched by binary partition point
//! plus a bounded walk forward, the same successor-lookup shape as a sorted
//! map's `range(key..).next()`.

use crate::hash::murmur3_128;
use std::collections::HashSet;

pub const HASH_POINTS_PER_PEER: usize = 80;

/// A bitmask: bit 0 selects "compact", bit 1 selects "unique", bit 2 selects
/// "next" (start search after the key, excluding an optional self id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    All = 0x00,
    Compact = 0x01,
    UniqueNode = 0x02,
    CompactUniqueNode = 0x03,
    NextNode = 0x04,
    NextCompact = 0x05,
    NextUniqueNode = 0x06,
    NextCompactUniqueNode = 0x07,
}

impl SearchMode {
    fn bits(self) -> u8 {
        self as u8
    }

    pub fn is_compact(self) -> bool {
        self.bits() & 0x01 != 0
    }

    pub fn is_unique(self) -> bool {
        self.bits() & 0x02 != 0
    }

    pub fn is_next(self) -> bool {
        self.bits() & 0x04 != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HashEntry {
    pub hash: (u64, u64),
    pub peer_id: u64,
}

/// Hashes an arbitrary lookup token the same way ring entries are hashed,
/// so lookups and ring construction always land in the same space.
pub fn hash_key(data: &[u8]) -> (u64, u64) {
    murmur3_128(data, 0)
}

#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    normal: Vec<HashEntry>,
    compact: Vec<HashEntry>,
}

impl ConsistentHashRing {
    /// Builds both ring variants from `(peer_id, name)` pairs. Ties on equal
    /// hash are broken by insertion order, i.e. by virtual-node index
    /// ascending within a peer.
    pub fn build<'a, I>(peers: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a str)>,
    {
        let mut entries = Vec::new();
        for (peer_id, name) in peers {
            for virtual_index in 0..HASH_POINTS_PER_PEER {
                let token = format!("{}-{}", name, virtual_index);
                entries.push(HashEntry {
                    hash: hash_key(token.as_bytes()),
                    peer_id,
                });
            }
        }
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));

        let compact = compact_runs(&entries);
        Self {
            normal: entries,
            compact,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty()
    }

    /// Returns up to `max` successor peer ids starting at the first ring
    /// entry whose hash is `>= key`, wrapping around the ring once. `self_id`
    /// is only consulted when `mode.is_next()`, in which case entries
    /// belonging to it are skipped.
    pub fn lower_bound(
        &self,
        key: (u64, u64),
        mode: SearchMode,
        self_id: Option<u64>,
        max: usize,
    ) -> Vec<u64> {
        let ring = if mode.is_compact() {
            &self.compact
        } else {
            &self.normal
        };
        if ring.is_empty() || max == 0 {
            return Vec::new();
        }

        let mut idx = ring.partition_point(|e| e.hash < key) % ring.len();
        if mode.is_next() {
            idx = (idx + 1) % ring.len();
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for _ in 0..ring.len() {
            let entry = &ring[idx];
            idx = (idx + 1) % ring.len();

            if mode.is_next() && self_id == Some(entry.peer_id) {
                continue;
            }
            if mode.is_unique() && !seen.insert(entry.peer_id) {
                continue;
            }
            seen.insert(entry.peer_id);
            out.push(entry.peer_id);
            if out.len() >= max {
                break;
            }
        }
        out
    }

    pub fn closest(&self, key: (u64, u64)) -> Option<u64> {
        self.lower_bound(key, SearchMode::All, None, 1).into_iter().next()
    }
}

/// Keeps only the last entry of each run of consecutive same-peer virtual
/// nodes.
fn compact_runs(sorted: &[HashEntry]) -> Vec<HashEntry> {
    let mut out = Vec::new();
    for (i, entry) in sorted.iter().enumerate() {
        let next_is_same = sorted
            .get(i + 1)
            .map_or(false, |next| next.peer_id == entry.peer_id);
        if !next_is_same {
            out.push(*entry);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ring() -> ConsistentHashRing {
        let names = ["svc-0", "svc-1", "svc-2"];
        ConsistentHashRing::build(names.iter().enumerate().map(|(i, n)| (i as u64 + 1, *n)))
    }

    #[test]
    fn same_key_always_maps_to_same_peer() {
        let ring = sample_ring();
        let key = hash_key(b"user-42");
        let a = ring.closest(key);
        let b = ring.closest(key);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn removing_a_peer_only_reshuffles_its_share() {
        let names_before = ["svc-0", "svc-1", "svc-2", "svc-3", "svc-4"];
        let ring_before =
            ConsistentHashRing::build(names_before.iter().enumerate().map(|(i, n)| (i as u64 + 1, *n)));
        let names_after = ["svc-0", "svc-1", "svc-3", "svc-4"];
        let ring_after =
            ConsistentHashRing::build(names_after.iter().enumerate().map(|(i, n)| (i as u64 + 1, *n)));

        let mut changed = 0;
        let mut total = 0;
        for i in 0..200 {
            let key = hash_key(format!("key-{}", i).as_bytes());
            let before = ring_before.closest(key);
            let after = ring_after.closest(key);
            total += 1;
            if before != after {
                changed += 1;
            }
        }
        assert!(changed > 0 && changed < total);
    }

    #[test]
    fn compact_mode_collapses_consecutive_same_peer_runs() {
        let ring = sample_ring();
        assert!(ring.compact.len() <= ring.normal.len());
    }

    #[test]
    fn unique_mode_never_repeats_a_peer() {
        let ring = sample_ring();
        let key = hash_key(b"start");
        let out = ring.lower_bound(key, SearchMode::UniqueNode, None, 10);
        let mut seen = HashSet::new();
        for id in &out {
            assert!(seen.insert(*id), "peer {} repeated", id);
        }
    }

    #[test]
    fn next_mode_excludes_self() {
        let ring = sample_ring();
        let key = hash_key(b"start");
        let out = ring.lower_bound(key, SearchMode::NextUniqueNode, Some(1), 10);
        assert!(!out.contains(&1));
    }

    #[test]
    fn empty_ring_returns_nothing() {
        let ring = ConsistentHashRing::build(std::iter::empty());
        assert!(ring.is_empty());
        assert_eq!(ring.closest(hash_key(b"x")), None);
    }
}
