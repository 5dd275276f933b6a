//! Keepalive Record (C2): re-asserts one owned key under the registry
//! client's lease, optionally abstaining if a checker rejects the current
//! stored value.
//!
//! Runs a GET-then-check-then-PUT state machine, sharing a cheaply-cloned
//! `Arc<RwLock<..>>` handle between the registry client and its caller.

use crate::error::Result;
use crate::registry::client::RegistryClient;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Activated,
    Get,
    CheckPass,
    CheckFail,
    PutLoop,
    Dormant,
}

pub enum Checker {
    None,
    ExactValue(Vec<u8>),
    Predicate(Box<dyn Fn(&[u8]) -> bool + Send + Sync>),
}

impl Checker {
    fn check(&self, current: &[u8]) -> bool {
        match self {
            Checker::None => true,
            Checker::ExactValue(expected) => expected == current,
            Checker::Predicate(f) => f(current),
        }
    }
}

struct Inner {
    key: String,
    value: Vec<u8>,
    last_put_value: Option<Vec<u8>>,
    checker: Checker,
    state: KeepaliveState,
    put_count: u64,
}

/// A cheaply-clonable reference to a [`KeepaliveRecord`]'s shared state, the
/// shape `RegistryClient` stores internally after `add_keepalive`.
#[derive(Clone)]
pub struct KeepaliveHandle {
    inner: Arc<RwLock<Inner>>,
}

impl KeepaliveHandle {
    pub fn key(&self) -> String {
        // Key never changes after construction; a non-blocking try_read
        // avoids making this bookkeeping getter async.
        try_read_key(&self.inner)
    }

    pub async fn tick(&self, client: &mut RegistryClient) -> Result<()> {
        let state = self.inner.read().await.state;
        match state {
            KeepaliveState::Activated => {
                let key = self.inner.read().await.key.clone();
                match client.create_kv_get(&key, None, Some(1), None).await {
                    Ok(resp) => {
                        let current = resp.kvs.first().map(|kv| kv.decoded_value());
                        let mut inner = self.inner.write().await;
                        let passes = match &current {
                            Some(bytes) => inner.checker.check(bytes),
                            None => true,
                        };
                        inner.state = if passes {
                            KeepaliveState::CheckPass
                        } else {
                            KeepaliveState::CheckFail
                        };
                    }
                    Err(_) => {
                        // Stay in ACTIVATED; the next tick retries the GET.
                    }
                }
                Ok(())
            }
            KeepaliveState::Get => Ok(()),
            KeepaliveState::CheckPass => {
                self.inner.write().await.state = KeepaliveState::PutLoop;
                Ok(())
            }
            KeepaliveState::CheckFail => {
                self.inner.write().await.state = KeepaliveState::Dormant;
                Ok(())
            }
            KeepaliveState::PutLoop => {
                let (key, value, needs_put) = {
                    let inner = self.inner.read().await;
                    let needs_put = inner.last_put_value.as_deref() != Some(inner.value.as_slice());
                    (inner.key.clone(), inner.value.clone(), needs_put)
                };
                if !needs_put {
                    return Ok(());
                }
                match client.create_kv_put(&key, &value, true, false).await {
                    Ok(_) => {
                        let mut inner = self.inner.write().await;
                        inner.last_put_value = Some(value);
                        inner.put_count += 1;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            KeepaliveState::Dormant => Ok(()),
        }
    }

    pub async fn state(&self) -> KeepaliveState {
        self.inner.read().await.state
    }

    pub async fn put_count(&self) -> u64 {
        self.inner.read().await.put_count
    }
}

fn try_read_key(inner: &Arc<RwLock<Inner>>) -> String {
    match inner.try_read() {
        Ok(guard) => guard.key.clone(),
        Err(_) => String::new(),
    }
}

pub struct KeepaliveRecord {
    handle: KeepaliveHandle,
}

impl KeepaliveRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            handle: KeepaliveHandle {
                inner: Arc::new(RwLock::new(Inner {
                    key: key.into(),
                    value: Vec::new(),
                    last_put_value: None,
                    checker: Checker::None,
                    state: KeepaliveState::Dormant,
                    put_count: 0,
                })),
            },
        }
    }

    pub async fn set_value(&self, value: impl Into<Vec<u8>>) {
        self.handle.inner.write().await.value = value.into();
    }

    pub async fn set_checker(&self, checker: Checker) {
        self.handle.inner.write().await.checker = checker;
    }

    pub async fn activate(&self) {
        let mut inner = self.handle.inner.write().await;
        if inner.state == KeepaliveState::Dormant {
            inner.state = KeepaliveState::Activated;
        }
    }

    pub fn handle(&self) -> KeepaliveHandle {
        self.handle.clone()
    }

    pub async fn close(&self, reset_has_data: bool) {
        let mut inner = self.handle.inner.write().await;
        inner.state = KeepaliveState::Dormant;
        if reset_has_data {
            inner.last_put_value = None;
        }
    }

    pub async fn state(&self) -> KeepaliveState {
        self.handle.state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_record_starts_dormant() {
        let record = KeepaliveRecord::new("by_id/svc-1");
        assert_eq!(record.state().await, KeepaliveState::Dormant);
    }

    #[tokio::test]
    async fn activate_transitions_to_activated() {
        let record = KeepaliveRecord::new("by_id/svc-1");
        record.activate().await;
        assert_eq!(record.state().await, KeepaliveState::Activated);
    }

    #[tokio::test]
    async fn double_activate_is_idempotent() {
        let record = KeepaliveRecord::new("by_id/svc-1");
        record.activate().await;
        record.close(false).await;
        record.activate().await;
        assert_eq!(record.state().await, KeepaliveState::Activated);
    }

    #[test]
    fn checker_exact_value_matches() {
        let checker = Checker::ExactValue(b"hello".to_vec());
        assert!(checker.check(b"hello"));
        assert!(!checker.check(b"world"));
    }

    #[test]
    fn checker_predicate_runs_arbitrary_logic() {
        let checker = Checker::Predicate(Box::new(|bytes: &[u8]| bytes.len() < 10));
        assert!(checker.check(b"short"));
        assert!(!checker.check(b"this value is far too long"));
    }
}
