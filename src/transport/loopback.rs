//! Loopback transport (C6): the built-in transport for messages the process
//! addresses to itself. Accepts messages destined for the owning process
//! and re-delivers them on the next tick, by triggering
//! `on_forward_request`, rather than looping synchronously.

use crate::endpoint::handle::{ConnectionHandle, TransportSender};
use crate::error::{MeshError, Result};
use crate::model::PeerRecord;
use crate::transport::registry::{AddressType, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub struct LoopbackMessage {
    pub msg_type: i32,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub metadata: Option<String>,
}

/// Mirrors the bound enforcement Endpoints apply to their own pending
/// queues: "It enforces the same queue bounds as Endpoints."
pub struct LoopbackTransport {
    max_message_count: usize,
    max_total_bytes: usize,
    queue: Mutex<VecDeque<LoopbackMessage>>,
    queued_bytes: Mutex<usize>,
    /// Lets `start_connect` hand out a handle bound to this very instance
    /// (not a disconnected copy) so sends actually land in the queue the
    /// app drains each tick.
    self_ref: Weak<LoopbackTransport>,
}

impl LoopbackTransport {
    pub fn new(max_message_count: usize, max_total_bytes: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            max_message_count,
            max_total_bytes,
            queue: Mutex::new(VecDeque::new()),
            queued_bytes: Mutex::new(0),
            self_ref: weak.clone(),
        })
    }

    /// Drains everything currently queued; called once per tick by the
    /// Application Core to dispatch `on_forward_request` for each message.
    pub fn drain(&self) -> Vec<LoopbackMessage> {
        let mut queue = self.queue.lock().expect("loopback queue mutex poisoned");
        let mut bytes = self.queued_bytes.lock().expect("loopback bytes mutex poisoned");
        let drained: Vec<_> = queue.drain(..).collect();
        *bytes = 0;
        drained
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().expect("loopback queue mutex poisoned").len()
    }
}

#[async_trait]
impl TransportSender for LoopbackTransport {
    fn scheme(&self) -> &'static str {
        "loopback"
    }

    async fn send_forward_request(
        &self,
        _handle: &ConnectionHandle,
        msg_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&str>,
    ) -> Result<()> {
        let mut queue = self.queue.lock().expect("loopback queue mutex poisoned");
        let mut bytes = self.queued_bytes.lock().expect("loopback bytes mutex poisoned");
        if queue.len() >= self.max_message_count || *bytes + payload.len() > self.max_total_bytes {
            return Err(MeshError::BufferLimit);
        }
        *bytes += payload.len();
        queue.push_back(LoopbackMessage {
            msg_type,
            sequence: *sequence,
            payload: payload.to_vec(),
            metadata: metadata.map(str::to_string),
        });
        Ok(())
    }

    async fn close(&self, _handle: &ConnectionHandle) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn schemes(&self) -> &[&'static str] {
        &["loopback"]
    }

    fn address_type(&self, _address: &str) -> AddressType {
        AddressType::DUPLEX | AddressType::LOCAL_PROCESS | AddressType::LOCAL_HOST
    }

    fn supports_loopback(&self) -> bool {
        true
    }

    async fn start_listen(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn start_connect(
        &self,
        _peer: &PeerRecord,
        endpoint_id: u64,
        _address: &str,
    ) -> Result<ConnectionHandle> {
        let shared = self.self_ref.upgrade().expect("loopback transport dropped while in use");
        let handle = ConnectionHandle::new(shared);
        handle.bind_endpoint(endpoint_id).await;
        handle.set_ready(true).await;
        Ok(handle)
    }

    async fn on_discovery_event(&self, _peer: &PeerRecord, _is_delete: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queues_and_drains_messages() {
        let transport = LoopbackTransport::new(4, 1024);
        let handle = ConnectionHandle::new(LoopbackTransport::new(4, 1024));
        let mut seq = 1u64;
        transport
            .send_forward_request(&handle, 1, &mut seq, b"ping", None)
            .await
            .unwrap();
        assert_eq!(transport.pending_len(), 1);
        let drained = transport.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, b"ping");
        assert_eq!(transport.pending_len(), 0);
    }

    #[tokio::test]
    async fn rejects_over_count_limit() {
        let transport = LoopbackTransport::new(1, 1024);
        let handle = ConnectionHandle::new(LoopbackTransport::new(1, 1024));
        let mut seq = 1u64;
        transport
            .send_forward_request(&handle, 1, &mut seq, b"a", None)
            .await
            .unwrap();
        let err = transport
            .send_forward_request(&handle, 1, &mut seq, b"b", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BufferLimit);
    }

    #[tokio::test]
    async fn start_connect_hands_out_a_handle_bound_to_the_same_queue() {
        let transport = LoopbackTransport::new(4, 1024);
        let peer = PeerRecord { id: 1, name: "self".into(), ..Default::default() };
        let handle = Transport::start_connect(transport.as_ref(), &peer, 1, "loopback://self")
            .await
            .unwrap();
        let mut seq = 0u64;
        handle.send(7, &mut seq, b"hi", None).await.unwrap();
        assert_eq!(transport.pending_len(), 1);
        assert_eq!(transport.drain()[0].payload, b"hi");
    }
}
