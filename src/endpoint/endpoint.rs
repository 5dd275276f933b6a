//! Endpoint (C5): logical handle for one remote peer. A bounded mailbox of
//! pending outbound messages (queue entries bounded by count and byte size)
//! with a drain-on-retry loop, plus the attached transport handles that can
//! currently carry traffic for this peer.

use crate::endpoint::handle::ConnectionHandle;
use crate::error::{MeshError, Result};
use crate::model::PeerRecord;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub msg_type: i32,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub metadata: Option<String>,
    pub expires_at: Instant,
}

/// Outcome of one `retry_pending_messages` pass, reported to the Application
/// Core so it can surface `TIMEOUT` forward-responses and re-arm wakers.
#[derive(Debug, Default)]
pub struct RetryOutcome {
    pub processed: usize,
    pub expired: Vec<PendingMessage>,
    /// Set when retry stopped because the ready handle reported
    /// `NO_CONNECTION`/`INVALID_ID`; the Topology Connector should reconnect.
    pub handle_failed: bool,
}

pub struct Endpoint {
    peer: Arc<PeerRecord>,
    handles: Vec<ConnectionHandle>,
    pending: VecDeque<PendingMessage>,
    pending_bytes: usize,
    max_message_count: usize,
    max_total_bytes: usize,
    message_timeout: Duration,
    next_sequence: u64,
    next_wake_at: Option<Instant>,
}

impl Endpoint {
    pub fn new(
        peer: Arc<PeerRecord>,
        max_message_count: usize,
        max_total_bytes: usize,
        message_timeout: Duration,
    ) -> Self {
        Self {
            peer,
            handles: Vec::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            max_message_count,
            max_total_bytes,
            message_timeout,
            next_sequence: 0,
            next_wake_at: None,
        }
    }

    pub fn peer(&self) -> Arc<PeerRecord> {
        self.peer.clone()
    }

    pub fn update_discovery(&mut self, peer: Arc<PeerRecord>) {
        self.peer = peer;
    }

    pub fn is_idle(&self) -> bool {
        self.handles.is_empty() && self.pending.is_empty()
    }

    /// Attaches in gateway-order; at most one handle per transport scheme is
    /// kept, matching "at most one per transport per endpoint".
    pub async fn attach_handle(&mut self, handle: ConnectionHandle) {
        let scheme = handle.scheme().await;
        let mut replaced = false;
        for existing in self.handles.iter_mut() {
            if existing.scheme().await == scheme {
                *existing = handle.clone();
                replaced = true;
                break;
            }
        }
        if !replaced {
            self.handles.push(handle);
        }
    }

    pub async fn detach_handle(&mut self, scheme: &str) {
        let mut kept = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.scheme().await == scheme {
                handle.unbind_endpoint().await;
            } else {
                kept.push(handle);
            }
        }
        self.handles = kept;
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// First attached handle that is ready and not closing, in insertion
    /// (gateway) order.
    pub async fn get_ready_connection_handle(&self) -> Option<ConnectionHandle> {
        for handle in &self.handles {
            if handle.is_ready().await {
                return Some(handle.clone());
            }
        }
        None
    }

    pub fn push_forward_message(
        &mut self,
        msg_type: i32,
        sequence: u64,
        payload: Vec<u8>,
        metadata: Option<String>,
        now: Instant,
    ) -> Result<u64> {
        let size = payload.len();
        if self.pending.len() >= self.max_message_count
            || self.pending_bytes + size > self.max_total_bytes
        {
            return Err(MeshError::BufferLimit);
        }

        let sequence = if sequence == 0 {
            self.next_sequence += 1;
            self.next_sequence
        } else {
            sequence
        };

        self.pending_bytes += size;
        self.pending.push_back(PendingMessage {
            msg_type,
            sequence,
            payload,
            metadata,
            expires_at: now + self.message_timeout,
        });
        Ok(sequence)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains from the queue head, delegating ready messages to the first
    /// ready handle's transport. Stops at `max_count`, on a non-ready head
    /// with no ready handle, or when the ready handle reports a transient or
    /// fatal transport error.
    pub async fn retry_pending_messages(&mut self, now: Instant, max_count: usize) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();

        while outcome.processed < max_count {
            let Some(front) = self.pending.front() else {
                break;
            };
            if front.expires_at <= now {
                let msg = self.pending.pop_front().expect("front just checked");
                self.pending_bytes -= msg.payload.len();
                outcome.expired.push(msg);
                continue;
            }

            let Some(handle) = self.get_ready_connection_handle().await else {
                break;
            };

            let mut sequence = front.sequence;
            let msg_type = front.msg_type;
            let payload = front.payload.clone();
            let metadata = front.metadata.clone();

            match handle
                .send(msg_type, &mut sequence, &payload, metadata.as_deref())
                .await
            {
                Ok(()) => {
                    let msg = self.pending.pop_front().expect("front just sent");
                    self.pending_bytes -= msg.payload.len();
                    outcome.processed += 1;
                }
                Err(MeshError::BufferLimit) => break,
                Err(MeshError::NoConnection) | Err(MeshError::InvalidId) => {
                    handle.set_ready(false).await;
                    outcome.handle_failed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        outcome
    }

    pub fn add_waker(&mut self, time: Instant) {
        self.next_wake_at = Some(match self.next_wake_at {
            Some(existing) if existing <= time => existing,
            _ => time,
        });
    }

    pub fn take_due_wake(&mut self, now: Instant) -> bool {
        match self.next_wake_at {
            Some(t) if t <= now => {
                self.next_wake_at = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::handle::{PrivateData, TransportSender};
    use async_trait::async_trait;

    struct AlwaysOk;
    #[async_trait]
    impl TransportSender for AlwaysOk {
        fn scheme(&self) -> &'static str {
            "fake"
        }
        async fn send_forward_request(
            &self,
            _h: &ConnectionHandle,
            _t: i32,
            _s: &mut u64,
            _p: &[u8],
            _m: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn close(&self, _h: &ConnectionHandle) -> Result<()> {
            Ok(())
        }
    }

    fn sample_endpoint() -> Endpoint {
        let peer = Arc::new(PeerRecord {
            id: 1,
            name: "svc-a".into(),
            ..Default::default()
        });
        Endpoint::new(peer, 4, 1024, Duration::from_secs(5))
    }

    #[test]
    fn push_message_assigns_sequence_when_zero() {
        let mut ep = sample_endpoint();
        let now = Instant::now();
        let seq = ep.push_forward_message(1, 0, vec![1, 2, 3], None, now).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(ep.pending_len(), 1);
    }

    #[test]
    fn push_message_rejects_over_count_limit() {
        let mut ep = sample_endpoint();
        let now = Instant::now();
        for _ in 0..4 {
            ep.push_forward_message(1, 0, vec![0], None, now).unwrap();
        }
        let err = ep.push_forward_message(1, 0, vec![0], None, now).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BufferLimit);
    }

    #[test]
    fn push_message_rejects_over_byte_limit() {
        let mut ep = sample_endpoint();
        let now = Instant::now();
        let err = ep
            .push_forward_message(1, 0, vec![0u8; 2048], None, now)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BufferLimit);
    }

    #[tokio::test]
    async fn retry_drops_expired_messages_before_send() {
        let mut ep = sample_endpoint();
        let past = Instant::now();
        ep.push_forward_message(1, 0, vec![1], None, past).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        ep.max_message_count = 4;
        // re-set timeout to something already elapsed by mutating directly
        // through a fresh endpoint with a zero timeout instead:
        let mut zero_timeout = Endpoint::new(ep.peer(), 4, 1024, Duration::from_millis(0));
        zero_timeout
            .push_forward_message(1, 0, vec![1], None, Instant::now())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = zero_timeout.retry_pending_messages(Instant::now(), 10).await;
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.processed, 0);
    }

    #[tokio::test]
    async fn retry_sends_through_ready_handle() {
        let mut ep = sample_endpoint();
        let handle = ConnectionHandle::new(Arc::new(AlwaysOk));
        handle.set_ready(true).await;
        ep.attach_handle(handle).await;
        ep.push_forward_message(1, 0, vec![1, 2], None, Instant::now())
            .unwrap();
        let outcome = ep.retry_pending_messages(Instant::now(), 10).await;
        assert_eq!(outcome.processed, 1);
        assert_eq!(ep.pending_len(), 0);
    }

    #[tokio::test]
    async fn retry_stops_without_a_ready_handle() {
        let mut ep = sample_endpoint();
        ep.push_forward_message(1, 0, vec![1], None, Instant::now())
            .unwrap();
        let outcome = ep.retry_pending_messages(Instant::now(), 10).await;
        assert_eq!(outcome.processed, 0);
        assert_eq!(ep.pending_len(), 1);
    }

    #[test]
    fn waker_keeps_the_earliest_registration() {
        let mut ep = sample_endpoint();
        let now = Instant::now();
        ep.add_waker(now + Duration::from_secs(10));
        ep.add_waker(now + Duration::from_secs(1));
        assert!(!ep.take_due_wake(now));
        assert!(ep.take_due_wake(now + Duration::from_secs(2)));
        // second, later registration became a no-op once serviced
        assert!(!ep.take_due_wake(now + Duration::from_secs(20)));
    }

    #[test]
    fn private_data_default_is_none_variant() {
        matches!(PrivateData::default(), PrivateData::None);
    }
}
