//! Data model: peer identity, versioning, and cluster topology records.
//!
//! `PeerRecord`'s field names and key-layout helpers reproduce a
//! protobuf-to-JSON wire mapping in plain serde, rather than through
//! generated bindings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `api_version, kind, group, namespace, uid, service_subset, labels`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub service_subset: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Metadata {
    /// A peer passes a (possibly partial) filter iff every non-empty field
    /// of `self` (the rule) equals the peer's corresponding field, and every
    /// `labels[k]=v` present in the rule is also present and equal on `peer`.
    pub fn matches(&self, peer: &Metadata) -> bool {
        if !self.api_version.is_empty() && self.api_version != peer.api_version {
            return false;
        }
        if !self.kind.is_empty() && self.kind != peer.kind {
            return false;
        }
        if !self.group.is_empty() && self.group != peer.group {
            return false;
        }
        if !self.namespace.is_empty() && self.namespace != peer.namespace {
            return false;
        }
        if !self.uid.is_empty() && self.uid != peer.uid {
            return false;
        }
        if !self.service_subset.is_empty() && self.service_subset != peer.service_subset {
            return false;
        }
        for (k, v) in &self.labels {
            match peer.labels.get(k) {
                Some(pv) if pv == v => {}
                _ => return false,
            }
        }
        true
    }

    /// Canonical serialization used to key the per-filter cache maps in the
    /// discovery set (sorted labels so structurally-equal filters hash the
    /// same way regardless of construction order).
    pub fn canonical_key(&self) -> String {
        let mut labels: Vec<(&String, &String)> = self.labels.iter().collect();
        labels.sort_by(|a, b| a.0.cmp(b.0));
        let labels_joined = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.api_version,
            self.kind,
            self.group,
            self.namespace,
            self.uid,
            self.service_subset,
            labels_joined
        )
    }

    pub fn is_empty_filter(&self) -> bool {
        self.api_version.is_empty()
            && self.kind.is_empty()
            && self.group.is_empty()
            && self.namespace.is_empty()
            && self.uid.is_empty()
            && self.service_subset.is_empty()
            && self.labels.is_empty()
    }
}

/// `region/district/zone` triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Area {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub zone: String,
}

/// One advertised reachability entry: `address` plus match predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    pub address: String,
    #[serde(default)]
    pub match_hosts: Vec<String>,
    #[serde(default)]
    pub match_namespaces: Vec<String>,
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl Gateway {
    /// All three predicates pass (empty predicate ⇒ vacuously true).
    pub fn matches(&self, local_hostname: &str, local_namespace: &str, local_labels: &HashMap<String, String>) -> bool {
        if !self.match_hosts.is_empty() && !self.match_hosts.iter().any(|h| h == local_hostname) {
            return false;
        }
        if !self.match_namespaces.is_empty()
            && !self.match_namespaces.iter().any(|n| n == local_namespace)
        {
            return false;
        }
        for (k, v) in &self.match_labels {
            match local_labels.get(k) {
                Some(lv) if lv == v => {}
                _ => return false,
            }
        }
        true
    }

    /// Lowercased scheme inferred from `address` (e.g. `tcp://1.2.3.4:9000`
    /// yields `"tcp"`). Returns `None` for an address without a scheme.
    pub fn scheme(&self) -> Option<String> {
        self.address
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }
}

/// `id` rides the wire as a JSON number when it fits a JS safe integer
/// (`<= 2^53 - 1`) and as a quoted string otherwise, matching the
/// protobuf-to-JSON mapping's handling of 64-bit integers. Accepts either
/// shape on read regardless of magnitude.
mod id_as_flexible_string {
    use serde::{Deserialize, Deserializer, Serializer};

    const JS_SAFE_INTEGER: u64 = (1u64 << 53) - 1;

    pub fn serialize<S>(id: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if *id <= JS_SAFE_INTEGER {
            serializer.serialize_u64(*id)
        } else {
            serializer.serialize_str(&id.to_string())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StrOrInt {
            Str(String),
            Int(u64),
        }
        match StrOrInt::deserialize(deserializer)? {
            StrOrInt::Str(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
            StrOrInt::Int(i) => Ok(i),
        }
    }
}

/// A peer's advertised identity and reachability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(with = "id_as_flexible_string")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub pid: u32,
    /// Murmur3-128 hex digest of `name`, recomputed on construction via
    /// [`PeerRecord::with_computed_hash`] rather than trusted blindly off
    /// the wire.
    #[serde(default)]
    pub hash_code: String,
    #[serde(default)]
    pub type_id: u64,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub area: Area,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub listen: Vec<String>,
    /// Informational only; compatibility is never enforced by this layer.
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub protocol_min_version: u32,
    /// The store's `(create_revision, modify_revision, version)` for the key
    /// this record was read from. Never part of the peer-record JSON itself
    /// (it rides on the enclosing etcd `KeyValue` envelope); a zero
    /// `create_revision` means "no revision known" (e.g. a locally
    /// synthesized self-record), which [`DiscoverySet::add_node`] treats as
    /// unconditionally acceptable rather than comparable.
    #[serde(skip, default)]
    pub record_version: RecordVersion,
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.hostname == other.hostname
            && self.pid == other.pid
            && self.hash_code == other.hash_code
            && self.type_id == other.type_id
            && self.type_name == other.type_name
            && self.area == other.area
            && self.version == other.version
            && self.metadata == other.metadata
            && self.gateways == other.gateways
            && self.listen == other.listen
            && self.protocol_version == other.protocol_version
            && self.protocol_min_version == other.protocol_min_version
    }
}

impl PeerRecord {
    /// Returns whether the record satisfies the data-model invariant: at
    /// least one of `id != 0` or `name != ""`.
    pub fn is_valid(&self) -> bool {
        self.id != 0 || !self.name.is_empty()
    }

    pub fn with_computed_hash(mut self) -> Self {
        let (hi, lo) = crate::hash::murmur3_128(self.name.as_bytes(), 0);
        self.hash_code = crate::hash::hash128_to_hex((hi, lo));
        self
    }

    pub fn with_record_version(mut self, version: RecordVersion) -> Self {
        self.record_version = version;
        self
    }

    pub fn by_id_key(&self, configure_path: &str) -> String {
        format!("{}by_id/{}-{}", normalize_prefix(configure_path), self.name, self.id)
    }

    pub fn by_name_key(&self, configure_path: &str) -> String {
        format!("{}by_name/{}-{}", normalize_prefix(configure_path), self.name, self.id)
    }
}

/// `(create_revision, modify_revision, version)` triple from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordVersion {
    pub create_revision: i64,
    pub modify_revision: i64,
    pub version: i64,
}

impl RecordVersion {
    /// Newer-wins tie-break: higher `create_revision` wins; on equal
    /// `create_revision`, higher `modify_revision` wins.
    pub fn supersedes(&self, other: &RecordVersion) -> bool {
        if self.create_revision != other.create_revision {
            self.create_revision > other.create_revision
        } else {
            self.modify_revision > other.modify_revision
        }
    }
}

/// `{id, upstream_id, name, data: {labels, hostname, pid}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologyRecord {
    pub id: u64,
    #[serde(default)]
    pub upstream_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: TopologyData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologyData {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub pid: u32,
}

impl TopologyRecord {
    pub fn key(&self, configure_path: &str) -> String {
        format!(
            "{}topology/{}-{}",
            normalize_prefix(configure_path),
            self.name,
            self.id
        )
    }
}

pub fn normalize_prefix(configure_path: &str) -> String {
    if configure_path.ends_with('/') {
        configure_path.to_string()
    } else {
        format!("{}/", configure_path)
    }
}

/// Epsilon-tolerant float comparison, provided for forward-compatibility with
/// any metadata extension fields that carry floats; no field on `PeerRecord`
/// is itself a float today, so this is otherwise unused by its exact `eq`.
pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon
}
