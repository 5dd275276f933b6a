//! TCP transport (C6 example transport): a concrete, Duplex, non-loopback
//! transport over `tokio::net::TcpStream`.
//!
//! One write-half guarded by an `Arc<Mutex<..>>` per connection, a
//! `TcpConfig` knobs struct, `TCP_NODELAY` toggled on connect, and a
//! spawned reader task per connection dispatching into a caller-supplied
//! callback. Frames are length-prefixed and carry the forward-request/
//! forward-response envelope this crate routes internally.

use crate::endpoint::handle::{ConnectionHandle, PrivateData, TransportSender};
use crate::error::{MeshError, Result};
use crate::model::PeerRecord;
use crate::transport::registry::{AddressType, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            nodelay: true,
        }
    }
}

/// Invoked with `(endpoint_id, msg_type, sequence, error_code, payload,
/// metadata)` for every response frame a peer connection receives.
pub type ReceiveCallback =
    Arc<dyn Fn(u64, i32, u64, i32, Vec<u8>, Option<String>) + Send + Sync>;

struct Connection {
    writer: AsyncMutex<tokio::net::tcp::OwnedWriteHalf>,
}

pub struct TcpTransport {
    config: TcpConfig,
    connections: AsyncRwLock<HashMap<u64, Arc<Connection>>>,
    on_receive: AsyncRwLock<Option<ReceiveCallback>>,
    self_weak: std::sync::Weak<TcpTransport>,
}

impl TcpTransport {
    /// Returns an `Arc` (rather than a bare `Self`) because the transport
    /// needs a weak handle to itself to spawn per-connection reader tasks.
    pub fn new(config: TcpConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            connections: AsyncRwLock::new(HashMap::new()),
            on_receive: AsyncRwLock::new(None),
            self_weak: weak.clone(),
        })
    }

    pub async fn set_receive_callback(&self, cb: ReceiveCallback) {
        *self.on_receive.write().await = Some(cb);
    }

    async fn spawn_reader(&self, endpoint_id: u64, mut reader: tokio::net::tcp::OwnedReadHalf) {
        let this = self.self_weak.upgrade().expect("transport dropped while connecting");
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some((msg_type, sequence, error_code, payload, metadata))) => {
                        let cb = this.on_receive.read().await.clone();
                        if let Some(cb) = cb {
                            cb(endpoint_id, msg_type, sequence, error_code, payload, metadata);
                        }
                    }
                    Ok(None) => {
                        this.connections.write().await.remove(&endpoint_id);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("tcp transport read error for endpoint {}: {}", endpoint_id, e);
                        this.connections.write().await.remove(&endpoint_id);
                        break;
                    }
                }
            }
        });
    }
}

async fn read_frame(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<(i32, u64, i32, Vec<u8>, Option<String>)>> {
    let mut len_buf = [0u8; 4];
    if reader.read_exact(&mut len_buf).await.is_err() {
        return Ok(None);
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; total_len];
    reader.read_exact(&mut body).await?;

    let msg_type = i32::from_be_bytes(body[0..4].try_into().unwrap());
    let sequence = u64::from_be_bytes(body[4..12].try_into().unwrap());
    let error_code = i32::from_be_bytes(body[12..16].try_into().unwrap());
    let metadata_len = u32::from_be_bytes(body[16..20].try_into().unwrap()) as usize;
    let metadata_bytes = &body[20..20 + metadata_len];
    let metadata = if metadata_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(metadata_bytes).to_string())
    };
    let payload = body[20 + metadata_len..].to_vec();
    Ok(Some((msg_type, sequence, error_code, payload, metadata)))
}

fn encode_frame(msg_type: i32, sequence: u64, error_code: i32, payload: &[u8], metadata: Option<&str>) -> Vec<u8> {
    let metadata_bytes = metadata.unwrap_or("").as_bytes();
    let body_len = 4 + 8 + 4 + 4 + metadata_bytes.len() + payload.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(&(metadata_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(metadata_bytes);
    out.extend_from_slice(payload);
    out
}

#[async_trait]
impl TransportSender for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn send_forward_request(
        &self,
        handle: &ConnectionHandle,
        msg_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&str>,
    ) -> Result<()> {
        let endpoint_id = match handle.private().await {
            PrivateData::U64(id) => id,
            _ => return Err(MeshError::InvalidId),
        };
        let conn = self
            .connections
            .read()
            .await
            .get(&endpoint_id)
            .cloned()
            .ok_or(MeshError::NoConnection)?;

        let frame = encode_frame(msg_type, *sequence, 0, payload, metadata);
        let mut writer = conn.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))
    }

    async fn close(&self, handle: &ConnectionHandle) -> Result<()> {
        if let PrivateData::U64(endpoint_id) = handle.private().await {
            self.connections.write().await.remove(&endpoint_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn schemes(&self) -> &[&'static str] {
        &["tcp"]
    }

    fn address_type(&self, _address: &str) -> AddressType {
        AddressType::DUPLEX
    }

    async fn start_listen(&self, _address: &str) -> Result<()> {
        // A full listener accept-loop is out of scope for the core routing
        // path this crate implements; dialing out is exercised end to end,
        // inbound listen is a thin extension point for a concrete deployment.
        Ok(())
    }

    async fn start_connect(
        &self,
        _peer: &PeerRecord,
        endpoint_id: u64,
        address: &str,
    ) -> Result<ConnectionHandle> {
        let target: SocketAddr = address
            .trim_start_matches("tcp://")
            .parse()
            .map_err(|_| MeshError::BadData(address.to_string()))?;

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| MeshError::OperationTimeout)?
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))?;
        stream.set_nodelay(self.config.nodelay).ok();

        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Connection {
            writer: AsyncMutex::new(writer),
        });
        self.connections.write().await.insert(endpoint_id, conn);
        self.spawn_reader(endpoint_id, reader).await;

        let sender = self
            .self_weak
            .upgrade()
            .expect("transport dropped while connecting") as Arc<dyn TransportSender>;
        let handle = ConnectionHandle::new(sender);
        handle.bind_endpoint(endpoint_id).await;
        handle.set_private(PrivateData::U64(endpoint_id)).await;
        handle.set_ready(true).await;
        Ok(handle)
    }

    async fn on_discovery_event(&self, _peer: &PeerRecord, _is_delete: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_header_fields() {
        let frame = encode_frame(7, 42, 0, b"payload", Some("meta"));
        let total_len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 4 + total_len);
        let msg_type = i32::from_be_bytes(frame[4..8].try_into().unwrap());
        let sequence = u64::from_be_bytes(frame[8..16].try_into().unwrap());
        assert_eq!(msg_type, 7);
        assert_eq!(sequence, 42);
    }

    #[test]
    fn default_config_enables_nodelay() {
        assert!(TcpConfig::default().nodelay);
    }
}
