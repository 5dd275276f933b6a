//! Topology policy evaluation (part of C7): the predicate a candidate direct
//! sibling link must pass before `try_connect_to` is allowed to dial it
//! directly instead of routing through a proxy.

use crate::config::TopologyPolicy;
use crate::model::PeerRecord;
use crate::topology::connector::TopologyRelation;
use std::collections::HashMap;

/// Evaluates whether `peer` may be dialed directly, never through a proxy,
/// given `relation` (this process's relation to `peer`), `topology_labels`
/// (the peer's published `TopologyRecord.data.labels` — `require_label_values`
/// is a topology-side policy and must never be checked against the
/// discovery record's `metadata.labels`), and the local process's own
/// hostname/pid (used by the `require_same_host`/`require_same_process`
/// predicates).
pub fn allows_direct_connection(
    policy: &TopologyPolicy,
    relation: TopologyRelation,
    peer: &PeerRecord,
    topology_labels: &HashMap<String, String>,
    local_hostname: &str,
    local_pid: u32,
) -> bool {
    if !policy.allow_direct_connection {
        return false;
    }
    if relation == TopologyRelation::OtherUpstreamPeer && policy.require_same_upstream {
        return false;
    }
    for (k, v) in &policy.require_label_values {
        match topology_labels.get(k) {
            Some(pv) if pv == v => {}
            _ => return false,
        }
    }
    if policy.require_same_host && peer.hostname != local_hostname {
        return false;
    }
    if policy.require_same_process && peer.pid != local_pid {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerRecord {
        PeerRecord {
            id: 2,
            name: "svc-b".into(),
            hostname: "host-a".into(),
            pid: 100,
            ..Default::default()
        }
    }

    fn no_labels() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn denies_when_direct_connection_globally_disabled() {
        let mut policy = TopologyPolicy::default();
        policy.allow_direct_connection = false;
        assert!(!allows_direct_connection(
            &policy,
            TopologyRelation::SameUpstreamPeer,
            &peer(),
            &no_labels(),
            "host-a",
            100
        ));
    }

    #[test]
    fn denies_other_upstream_peer_when_same_upstream_required() {
        let mut policy = TopologyPolicy::default();
        policy.require_same_upstream = true;
        assert!(!allows_direct_connection(
            &policy,
            TopologyRelation::OtherUpstreamPeer,
            &peer(),
            &no_labels(),
            "host-a",
            100
        ));
        assert!(allows_direct_connection(
            &policy,
            TopologyRelation::SameUpstreamPeer,
            &peer(),
            &no_labels(),
            "host-a",
            100
        ));
    }

    #[test]
    fn enforces_label_values_from_topology_record_not_discovery_metadata() {
        let mut policy = TopologyPolicy::default();
        policy.require_label_values.insert("tier".into(), "gold".into());
        let mut p = peer();
        assert!(!allows_direct_connection(&policy, TopologyRelation::SameUpstreamPeer, &p, &no_labels(), "host-a", 100));

        // Matching labels on the discovery record's metadata must NOT satisfy
        // the policy — only the peer's topology labels count.
        p.metadata.labels.insert("tier".into(), "gold".into());
        assert!(!allows_direct_connection(&policy, TopologyRelation::SameUpstreamPeer, &p, &no_labels(), "host-a", 100));

        let mut topology_labels = HashMap::new();
        topology_labels.insert("tier".into(), "gold".into());
        assert!(allows_direct_connection(&policy, TopologyRelation::SameUpstreamPeer, &p, &topology_labels, "host-a", 100));
    }

    #[test]
    fn enforces_same_host_and_process() {
        let mut policy = TopologyPolicy::default();
        policy.require_same_host = true;
        let p = peer();
        assert!(allows_direct_connection(&policy, TopologyRelation::SameUpstreamPeer, &p, &no_labels(), "host-a", 100));
        assert!(!allows_direct_connection(&policy, TopologyRelation::SameUpstreamPeer, &p, &no_labels(), "host-b", 100));

        let mut policy2 = TopologyPolicy::default();
        policy2.require_same_process = true;
        assert!(!allows_direct_connection(&policy2, TopologyRelation::SameUpstreamPeer, &p, &no_labels(), "host-a", 999));
    }
}
