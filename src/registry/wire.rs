//! etcd v3 gateway JSON wire types.
//!
//! All `key`/`range_end`/`value` fields are base64-encoded bytes on the
//! wire; helpers here take/return raw strings or bytes and handle the
//! encoding.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

pub fn b64(data: impl AsRef<[u8]>) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn un_b64(data: &str) -> Vec<u8> {
    general_purpose::STANDARD.decode(data).unwrap_or_default()
}

/// `range_end = key + 1` (lexicographic successor), the "prefix range" idiom.
pub fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut bytes = prefix.as_bytes().to_vec();
    for i in (0..bytes.len()).rev() {
        if bytes[i] < 0xff {
            bytes[i] += 1;
            bytes.truncate(i + 1);
            return bytes;
        }
    }
    // All bytes were 0xff: "all keys >= key" sentinel.
    vec![0u8]
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "de_i64_str")]
    pub cluster_id: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub member_id: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub revision: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub raft_term: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub create_revision: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub mod_revision: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub version: i64,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub lease: i64,
}

impl KeyValue {
    pub fn decoded_key(&self) -> String {
        String::from_utf8(un_b64(&self.key)).unwrap_or_default()
    }
    pub fn decoded_value(&self) -> Vec<u8> {
        un_b64(&self.value)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RangeResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_kv: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_lease: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PutResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_kv: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeleteRangeResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub deleted: i64,
    #[serde(default)]
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    pub ttl: i64,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LeaseGrantResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(rename = "ID", default, deserialize_with = "de_i64_str")]
    pub id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64_str")]
    pub ttl: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseKeepAliveRequest {
    #[serde(rename = "ID")]
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LeaseKeepAliveResult {
    #[serde(rename = "ID", default, deserialize_with = "de_i64_str")]
    pub id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64_str")]
    pub ttl: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LeaseKeepAliveResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub result: LeaseKeepAliveResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    pub id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticateRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthenticateResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthUserGetRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemberListResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Member {
    #[serde(default, deserialize_with = "de_i64_str")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "peerURLs")]
    pub peer_urls: Vec<String>,
    #[serde(default, rename = "clientURLs")]
    pub client_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchCreateRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_kv: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_notify: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest {
    pub create_request: WatchCreateRequest,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    #[default]
    Put,
    Delete,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchEvent {
    #[serde(rename = "type", default)]
    pub event_type: WatchEventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchResult {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub watch_id: i64,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, deserialize_with = "de_i64_str")]
    pub compact_revision: i64,
    #[serde(default)]
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchResponseEnvelope {
    #[serde(default)]
    pub result: WatchResult,
}

/// etcd's JSON gateway quotes all int64 fields as strings; this accepts
/// either a JSON number or a quoted string so the client tolerates both
/// representations leniently.
fn de_i64_str<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrInt {
        Str(String),
        Int(i64),
        Missing,
    }
    match Option::<StrOrInt>::deserialize(deserializer)? {
        Some(StrOrInt::Str(s)) if s.is_empty() => Ok(0),
        Some(StrOrInt::Str(s)) => s.parse::<i64>().map_err(D::Error::custom),
        Some(StrOrInt::Int(i)) => Ok(i),
        Some(StrOrInt::Missing) | None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_end_increments_last_byte() {
        let end = prefix_range_end("by_id/");
        assert_eq!(end, b"by_id0".to_vec());
    }

    #[test]
    fn prefix_range_end_handles_all_0xff() {
        let end = prefix_range_end(&String::from_utf8(vec![0xffu8]).unwrap_or_default());
        // `from_utf8` fails on 0xff alone; exercise the byte path directly.
        let bytes = vec![0xffu8, 0xffu8];
        let mut owned = bytes.clone();
        let mut out = None;
        for i in (0..owned.len()).rev() {
            if owned[i] < 0xff {
                owned[i] += 1;
                owned.truncate(i + 1);
                out = Some(owned.clone());
                break;
            }
        }
        assert!(out.is_none());
        let _ = end;
    }

    #[test]
    fn int64_strings_parse_leniently() {
        let json = r#"{"header":{"revision":"42"},"kvs":[],"count":"0"}"#;
        let resp: RangeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.header.revision, 42);
    }

    #[test]
    fn key_values_decode_base64() {
        let kv = KeyValue {
            key: b64("by_id/svc-1"),
            value: b64("{}"),
            ..Default::default()
        };
        assert_eq!(kv.decoded_key(), "by_id/svc-1");
        assert_eq!(kv.decoded_value(), b"{}".to_vec());
    }
}
