//! Watch Stream (C3): a long-poll stream over a key range with snapshot
//! bootstrap and retry/backoff.
//!
//! Bootstraps with a base64-encoded range GET over the same key range the
//! watch itself covers, then hands off to the long-poll stream.

use crate::registry::client::RegistryClient;
use crate::registry::framing::JsonFrameSplitter;
use crate::registry::wire::*;
use crate::error::{MeshError, Result};
use futures_util::StreamExt;
use rand::Rng;
use std::pin::Pin;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Streaming,
    Retrying,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct WatchEventOut {
    pub event_type: WatchEventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchNotification {
    pub watch_id: i64,
    pub created: bool,
    pub canceled: bool,
    pub compact_revision: i64,
    pub events: Vec<WatchEventOut>,
    /// Synthesized `true` for the bootstrap delivery; `false` afterwards.
    pub snapshot: bool,
}

type EventHandler = Box<dyn FnMut(ResponseHeader, WatchNotification) + Send>;
type ByteStream = Pin<Box<dyn futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send>>;

pub struct WatchStream {
    key: String,
    range_end: Option<String>,
    progress_notify: bool,
    prev_kv: bool,
    handler: Option<EventHandler>,
    state: WatchState,
    last_seen_revision: i64,
    retry_interval: Duration,
    startup_random_delay: Option<(Duration, Duration)>,
    next_retry_at: Option<Instant>,
    first_activation: bool,
    splitter: JsonFrameSplitter,
    stream: Option<ByteStream>,
}

impl WatchStream {
    pub fn new(key: impl Into<String>, range_end: Option<String>) -> Self {
        Self {
            key: key.into(),
            range_end,
            progress_notify: false,
            prev_kv: false,
            handler: None,
            state: WatchState::Idle,
            last_seen_revision: 0,
            retry_interval: Duration::from_secs(1),
            startup_random_delay: None,
            next_retry_at: None,
            first_activation: true,
            splitter: JsonFrameSplitter::new(),
            stream: None,
        }
    }

    pub fn set_event_handler<F>(&mut self, handler: F)
    where
        F: FnMut(ResponseHeader, WatchNotification) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    pub fn set_progress_notify(&mut self, enabled: bool) {
        self.progress_notify = enabled;
    }

    pub fn set_prev_kv(&mut self, enabled: bool) {
        self.prev_kv = enabled;
    }

    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    pub fn set_startup_random_delay(&mut self, min: Duration, max: Duration) {
        self.startup_random_delay = Some((min, max));
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn last_seen_revision(&self) -> i64 {
        self.last_seen_revision
    }

    /// Primes local state with a one-shot range GET, synthesizing
    /// `snapshot=true` PUT events, then flags the stream ready to be opened
    /// by [`WatchStream::poll`].
    pub async fn activate(&mut self, client: &mut RegistryClient) -> Result<()> {
        if self.first_activation {
            if let Some((min, max)) = self.startup_random_delay {
                let jitter = if max > min {
                    let extra = rand::rng().random_range(0..=(max - min).as_millis() as u64);
                    min + Duration::from_millis(extra)
                } else {
                    min
                };
                tokio::time::sleep(jitter).await;
            }
            self.first_activation = false;
        }

        self.bootstrap(client).await?;
        self.state = WatchState::Streaming;
        Ok(())
    }

    async fn bootstrap(&mut self, client: &mut RegistryClient) -> Result<()> {
        let resp = client
            .create_kv_get(&self.key, self.range_end.as_deref(), None, None)
            .await?;

        let events: Vec<WatchEventOut> = resp
            .kvs
            .iter()
            .cloned()
            .map(|kv| WatchEventOut {
                event_type: WatchEventType::Put,
                kv,
                prev_kv: None,
            })
            .collect();

        self.last_seen_revision = resp.header.revision;
        self.splitter = JsonFrameSplitter::new();
        self.stream = None;

        if let Some(handler) = &mut self.handler {
            handler(
                resp.header,
                WatchNotification {
                    watch_id: 0,
                    created: true,
                    canceled: false,
                    compact_revision: 0,
                    events,
                    snapshot: true,
                },
            );
        }
        Ok(())
    }

    /// Performs one unit of streaming work: opens the watch POST if not
    /// already open, reads the next chunk, and dispatches any complete
    /// frames. Returns `true` if work was performed.
    pub async fn poll(&mut self, client: &mut RegistryClient) -> Result<bool> {
        match self.state {
            WatchState::Idle | WatchState::Closed => Ok(false),
            WatchState::Retrying => {
                if self.next_retry_at.map_or(true, |t| Instant::now() >= t) {
                    self.activate(client).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            WatchState::Streaming => self.poll_streaming(client).await,
        }
    }

    async fn poll_streaming(&mut self, client: &mut RegistryClient) -> Result<bool> {
        if self.stream.is_none() {
            self.open_stream(client).await?;
        }

        let chunk = match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => return Ok(false),
        };

        match chunk {
            Some(Ok(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).to_string();
                let frames = self.splitter.push(&text);
                for frame in frames {
                    self.dispatch_frame(&frame)?;
                }
                Ok(true)
            }
            Some(Err(e)) => {
                self.retry_after_error(format!("watch stream error: {}", e));
                Ok(true)
            }
            None => {
                self.retry_after_error("watch stream closed by server".to_string());
                Ok(true)
            }
        }
    }

    async fn open_stream(&mut self, client: &mut RegistryClient) -> Result<()> {
        let endpoint = client.pick_endpoint()?;
        let url = format!("{}/v3/watch", endpoint.trim_end_matches('/'));
        let req = WatchRequest {
            create_request: WatchCreateRequest {
                key: b64(&self.key),
                range_end: self.range_end.as_deref().map(b64),
                start_revision: Some(self.last_seen_revision + 1),
                prev_kv: Some(self.prev_kv),
                progress_notify: Some(self.progress_notify),
            },
        };
        let resp = client
            .http_client()
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MeshError::RegistryTransport(format!(
                "watch open failed: {}",
                resp.status()
            )));
        }
        self.stream = Some(Box::pin(resp.bytes_stream()));
        Ok(())
    }

    fn dispatch_frame(&mut self, frame: &str) -> Result<()> {
        let envelope: WatchResponseEnvelope = serde_json::from_str(frame)
            .map_err(|e| MeshError::Serialization(format!("bad watch frame: {}", e)))?;
        let result = envelope.result;

        if result.compact_revision > 0 {
            self.retry_after_error(format!(
                "server compacted history at revision {}",
                result.compact_revision
            ));
            return Ok(());
        }

        if result.canceled {
            self.retry_after_error("watch canceled by server".to_string());
            return Ok(());
        }

        if !result.created && !result.events.is_empty() {
            if result.header.revision <= self.last_seen_revision {
                tracing::warn!(
                    "watch revision did not increase: last={} got={}",
                    self.last_seen_revision,
                    result.header.revision
                );
            }
        }
        self.last_seen_revision = self.last_seen_revision.max(result.header.revision);

        let events = result
            .events
            .iter()
            .cloned()
            .map(|e| WatchEventOut {
                event_type: e.event_type,
                kv: e.kv,
                prev_kv: e.prev_kv,
            })
            .collect();

        if let Some(handler) = &mut self.handler {
            handler(
                result.header,
                WatchNotification {
                    watch_id: result.watch_id,
                    created: result.created,
                    canceled: result.canceled,
                    compact_revision: result.compact_revision,
                    events,
                    snapshot: false,
                },
            );
        }
        Ok(())
    }

    fn retry_after_error(&mut self, reason: String) {
        tracing::warn!("{}, retrying watch for {} in {:?}", reason, self.key, self.retry_interval);
        self.stream = None;
        self.state = WatchState::Retrying;
        self.next_retry_at = Some(Instant::now() + self.retry_interval);
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.state = WatchState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn new_watch_starts_idle() {
        let watch = WatchStream::new("by_id/", Some("by_id0".into()));
        assert_eq!(watch.state(), WatchState::Idle);
    }

    #[test]
    fn dispatch_frame_delivers_non_snapshot_events() {
        let mut watch = WatchStream::new("by_id/", None);
        watch.state = WatchState::Streaming;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        watch.set_event_handler(move |_header, notif| {
            assert!(!notif.snapshot);
            seen2.fetch_add(notif.events.len(), Ordering::SeqCst);
        });

        let frame = r#"{"result":{"header":{"revision":"5"},"watch_id":"1","created":false,"canceled":false,"compact_revision":"0","events":[{"type":"PUT","kv":{"key":"a2V5","value":"dmFs"}}]}}"#;
        watch.dispatch_frame(frame).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(watch.last_seen_revision(), 5);
    }

    #[test]
    fn dispatch_frame_retries_on_compact_revision() {
        let mut watch = WatchStream::new("by_id/", None);
        watch.state = WatchState::Streaming;
        let frame = r#"{"result":{"header":{"revision":"9"},"compact_revision":"3","events":[]}}"#;
        watch.dispatch_frame(frame).unwrap();
        assert_eq!(watch.state(), WatchState::Retrying);
    }

    #[test]
    fn dispatch_frame_retries_on_canceled() {
        let mut watch = WatchStream::new("by_id/", None);
        watch.state = WatchState::Streaming;
        let frame = r#"{"result":{"header":{"revision":"9"},"canceled":true,"events":[]}}"#;
        watch.dispatch_frame(frame).unwrap();
        assert_eq!(watch.state(), WatchState::Retrying);
    }

    #[test]
    fn revision_is_monotonic_across_non_snapshot_notifications() {
        let mut watch = WatchStream::new("by_id/", None);
        watch.state = WatchState::Streaming;
        let revisions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let revisions2 = revisions.clone();
        watch.set_event_handler(move |header, _notif| {
            revisions2.lock().unwrap().push(header.revision);
        });
        watch
            .dispatch_frame(r#"{"result":{"header":{"revision":"5"},"events":[{"type":"PUT","kv":{"key":"a","value":"b"}}]}}"#)
            .unwrap();
        watch
            .dispatch_frame(r#"{"result":{"header":{"revision":"6"},"events":[{"type":"PUT","kv":{"key":"a","value":"c"}}]}}"#)
            .unwrap();
        let seen = revisions.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[1] > w[0]));
    }
}
