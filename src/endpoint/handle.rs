//! ConnectionHandle (part of C5): one concrete attachment between an
//! [`Endpoint`](super::endpoint::Endpoint) and a transport instance.
//!
//! Carries `ready`/`closing` flags and transport-private opaque state, and
//! is bound bidirectionally to exactly one transport and at most one
//! endpoint at a time.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Transport-private opaque state a [`ConnectionHandle`] carries: a
/// pointer/u64/i64/bytes union expressed as a safe enum instead of `unsafe`
/// union punning.
#[derive(Debug, Clone, Default)]
pub enum PrivateData {
    #[default]
    None,
    U64(u64),
    I64(i64),
    Bytes(Vec<u8>),
}

/// The minimal surface a transport must expose for an attached
/// [`ConnectionHandle`] to send through it. [`crate::transport::registry::Transport`]
/// extends this with listen/connect/lifecycle operations; splitting it out
/// here keeps the endpoint module from depending on the transport registry.
#[async_trait]
pub trait TransportSender: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn send_forward_request(
        &self,
        handle: &ConnectionHandle,
        msg_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&str>,
    ) -> Result<()>;

    async fn close(&self, handle: &ConnectionHandle) -> Result<()>;
}

struct Inner {
    transport: Arc<dyn TransportSender>,
    ready: bool,
    closing: bool,
    endpoint_id: Option<u64>,
    private: PrivateData,
}

/// Cheaply-clonable handle shared between a transport and the endpoint it is
/// attached to; either side unbinding closes it.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionHandle {
    pub fn new(transport: Arc<dyn TransportSender>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                transport,
                ready: false,
                closing: false,
                endpoint_id: None,
                private: PrivateData::None,
            })),
        }
    }

    pub async fn scheme(&self) -> &'static str {
        self.inner.read().await.transport.scheme()
    }

    pub async fn is_ready(&self) -> bool {
        let inner = self.inner.read().await;
        inner.ready && !inner.closing
    }

    pub async fn is_closing(&self) -> bool {
        self.inner.read().await.closing
    }

    /// Flips the ready flag. The caller (typically a transport's connect
    /// callback) is responsible for waking the owning endpoint afterwards so
    /// its pending queue is retried promptly.
    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }

    pub async fn bind_endpoint(&self, endpoint_id: u64) {
        self.inner.write().await.endpoint_id = Some(endpoint_id);
    }

    pub async fn unbind_endpoint(&self) {
        let mut inner = self.inner.write().await;
        inner.endpoint_id = None;
        inner.closing = true;
    }

    pub async fn bound_endpoint(&self) -> Option<u64> {
        self.inner.read().await.endpoint_id
    }

    pub async fn set_private(&self, data: PrivateData) {
        self.inner.write().await.private = data;
    }

    pub async fn private(&self) -> PrivateData {
        self.inner.read().await.private.clone()
    }

    pub async fn close(&self) -> Result<()> {
        let transport = {
            let mut inner = self.inner.write().await;
            inner.closing = true;
            inner.ready = false;
            inner.transport.clone()
        };
        transport.close(self).await
    }

    pub async fn send(
        &self,
        msg_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&str>,
    ) -> Result<()> {
        let transport = self.inner.read().await.transport.clone();
        transport
            .send_forward_request(self, msg_type, sequence, payload, metadata)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TransportSender for FakeTransport {
        fn scheme(&self) -> &'static str {
            "fake"
        }

        async fn send_forward_request(
            &self,
            _handle: &ConnectionHandle,
            _msg_type: i32,
            _sequence: &mut u64,
            _payload: &[u8],
            _metadata: Option<&str>,
        ) -> Result<()> {
            if self.fail {
                return Err(crate::error::MeshError::NoConnection);
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self, _handle: &ConnectionHandle) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn new_handle_starts_unready() {
        let transport = Arc::new(FakeTransport { sent: AtomicUsize::new(0), fail: false });
        let handle = ConnectionHandle::new(transport);
        assert!(!handle.is_ready().await);
    }

    #[tokio::test]
    async fn set_ready_flips_state() {
        let transport = Arc::new(FakeTransport { sent: AtomicUsize::new(0), fail: false });
        let handle = ConnectionHandle::new(transport);
        handle.set_ready(true).await;
        assert!(handle.is_ready().await);
    }

    #[tokio::test]
    async fn closing_handle_is_never_ready() {
        let transport = Arc::new(FakeTransport { sent: AtomicUsize::new(0), fail: false });
        let handle = ConnectionHandle::new(transport);
        handle.set_ready(true).await;
        handle.close().await.unwrap();
        assert!(!handle.is_ready().await);
        assert!(handle.is_closing().await);
    }

    #[tokio::test]
    async fn send_delegates_to_bound_transport() {
        let transport = Arc::new(FakeTransport { sent: AtomicUsize::new(0), fail: false });
        let handle = ConnectionHandle::new(transport.clone());
        let mut seq = 0u64;
        handle.send(1, &mut seq, b"hi", None).await.unwrap();
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }
}
