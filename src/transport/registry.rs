//! Transport Registry (C6): scheme-keyed lookup of pluggable transports and
//! the `Transport` contract they implement.
//!
//! The registration mutex is the one piece of cross-thread synchronization
//! this crate's single-logical-thread model calls for explicitly: it exists
//! only to guard registration of transports from non-loop threads, never to
//! allow concurrent mutation of application state.

use crate::endpoint::handle::{ConnectionHandle, TransportSender};
use crate::error::{MeshError, Result};
use crate::model::PeerRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Address classification bitmask: `Simplex | Duplex`, plus optional
/// `LocalHost`/`LocalProcess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressType(u8);

impl AddressType {
    pub const SIMPLEX: AddressType = AddressType(0x01);
    pub const DUPLEX: AddressType = AddressType(0x02);
    pub const LOCAL_HOST: AddressType = AddressType(0x04);
    pub const LOCAL_PROCESS: AddressType = AddressType(0x08);

    pub const fn empty() -> Self {
        AddressType(0)
    }

    pub fn contains(self, other: AddressType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: AddressType) -> Self {
        AddressType(self.0 | other.0)
    }

    pub fn is_simplex(self) -> bool {
        self.contains(AddressType::SIMPLEX)
    }

    pub fn is_duplex(self) -> bool {
        self.contains(AddressType::DUPLEX)
    }
}

impl std::ops::BitOr for AddressType {
    type Output = AddressType;
    fn bitor(self, rhs: AddressType) -> AddressType {
        self.union(rhs)
    }
}

/// Full per-transport contract: scheme declaration, address classification,
/// and the listen/connect/close/dispatch operations.
#[async_trait]
pub trait Transport: TransportSender {
    fn schemes(&self) -> &[&'static str];

    fn address_type(&self, address: &str) -> AddressType;

    fn supports_loopback(&self) -> bool {
        false
    }

    async fn start_listen(&self, address: &str) -> Result<()>;

    async fn start_connect(
        &self,
        peer: &PeerRecord,
        endpoint_id: u64,
        address: &str,
    ) -> Result<ConnectionHandle>;

    async fn on_discovery_event(&self, peer: &PeerRecord, is_delete: bool);
}

/// Lowercases the scheme prefix of `address` (`"tcp://..."` -> `"tcp"`).
pub fn parse_scheme(address: &str) -> Option<String> {
    address
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
}

/// Scheme -> transport lookup. Mutated only during init by builder code that
/// may run off the event-loop thread, hence the `Mutex`.
#[derive(Clone)]
pub struct TransportRegistry {
    transports: Arc<Mutex<HashMap<&'static str, Arc<dyn Transport>>>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_connector(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.lock().expect("registry mutex poisoned");
        for scheme in transport.schemes() {
            transports.insert(scheme, transport.clone());
        }
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports.lock().expect("registry mutex poisoned").get(scheme).cloned()
    }

    /// Resolves the transport to dial for a gateway address, applying the
    /// scheme lookup and loopback-exclusivity rule (a transport not marked
    /// loopback-capable can never be used for a self-address).
    pub fn resolve_for_address(&self, address: &str, is_self: bool) -> Result<Arc<dyn Transport>> {
        let scheme = parse_scheme(address).ok_or_else(|| MeshError::BadData(address.to_string()))?;
        let transport = self
            .get(&scheme)
            .ok_or_else(|| MeshError::ChannelNotSupport)?;
        if is_self && !transport.supports_loopback() {
            return Err(MeshError::ChannelNotSupport);
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_type_union_and_contains() {
        let t = AddressType::DUPLEX | AddressType::LOCAL_HOST;
        assert!(t.contains(AddressType::DUPLEX));
        assert!(t.contains(AddressType::LOCAL_HOST));
        assert!(!t.contains(AddressType::SIMPLEX));
    }

    #[test]
    fn parse_scheme_lowercases() {
        assert_eq!(parse_scheme("TCP://1.2.3.4:9000").as_deref(), Some("tcp"));
        assert_eq!(parse_scheme("no-scheme-here"), None);
    }

    #[test]
    fn registry_starts_empty() {
        let registry = TransportRegistry::new();
        assert!(registry.get("tcp").is_none());
    }
}
