//! Registry Client (C1): a long-lived session to an etcd-compatible cluster.
//!
//! State machine, member round-robin, auth renewal and lease management,
//! built on `reqwest`/`serde_json` requests with `tracing` instrumentation.

use crate::config::EtcdConfig;
use crate::error::{MeshError, Result};
use crate::registry::keepalive::KeepaliveHandle;
use crate::registry::wire::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// `INIT -> RESOLVING_MEMBERS -> AUTHENTICATING -> LEASE_GRANTING -> READY ->
/// (DOWN | CLOSING) -> CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    ResolvingMembers,
    Authenticating,
    LeaseGranting,
    Ready,
    Down,
    Closing,
    Closed,
}

/// Per-step retry interval, independent of the steady-state request timeout.
#[derive(Debug, Clone)]
struct RetryState {
    next_attempt_at: Option<Instant>,
    interval: Duration,
}

impl RetryState {
    fn new(interval: Duration) -> Self {
        Self {
            next_attempt_at: None,
            interval,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |t| now >= t)
    }

    fn backoff(&mut self, now: Instant) {
        self.next_attempt_at = Some(now + self.interval);
    }
}

struct MemberUrls {
    urls: Vec<String>,
    cursor: usize,
    penalized: HashMap<String, Instant>,
}

impl MemberUrls {
    fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            cursor: 0,
            penalized: HashMap::new(),
        }
    }

    fn next(&mut self, now: Instant) -> Option<String> {
        if self.urls.is_empty() {
            return None;
        }
        let len = self.urls.len();
        for _ in 0..len {
            let idx = self.cursor % len;
            self.cursor = self.cursor.wrapping_add(1);
            let url = &self.urls[idx];
            match self.penalized.get(url) {
                Some(until) if *until > now => continue,
                _ => return Some(url.clone()),
            }
        }
        // Every URL penalized: fall back to the next one anyway.
        Some(self.urls[self.cursor % len].clone())
    }

    fn penalize(&mut self, url: &str, now: Instant, duration: Duration) {
        self.penalized.insert(url.to_string(), now + duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Socket,
    Unauthorized,
    ServerBusy,
    Other,
}

fn categorize_status(status: reqwest::StatusCode, body: &str) -> FailureKind {
    if status.as_u16() == 401 || status.as_u16() == 403 {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("invalid") && lowered.contains("token") {
            return FailureKind::Unauthorized;
        }
        return FailureKind::Unauthorized;
    }
    if status.as_u16() == 503 || status.as_u16() == 504 {
        return FailureKind::ServerBusy;
    }
    FailureKind::Other
}

pub struct RegistryClient {
    config: EtcdConfig,
    http: reqwest::Client,
    state: ClientState,
    members: MemberUrls,
    member_update_retry: RetryState,
    auth_retry: RetryState,
    lease_retry: RetryState,
    last_member_update: Option<Instant>,
    token: Arc<RwLock<Option<String>>>,
    token_renew_at: Option<Instant>,
    lease_id: Option<i64>,
    keepalive_failures: u32,
    pub continue_error_requests: u64,
    keepalives: Vec<KeepaliveHandle>,
    on_available: Option<Box<dyn Fn() + Send + Sync>>,
    on_down: Option<Box<dyn Fn() + Send + Sync>>,
}

impl RegistryClient {
    pub fn new(config: EtcdConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let member_urls = config.endpoints.clone();
        Self {
            members: MemberUrls::new(member_urls),
            member_update_retry: RetryState::new(config.member_update_interval),
            auth_retry: RetryState::new(Duration::from_secs(2)),
            lease_retry: RetryState::new(Duration::from_secs(2)),
            config,
            http,
            state: ClientState::Init,
            last_member_update: None,
            token: Arc::new(RwLock::new(None)),
            token_renew_at: None,
            lease_id: None,
            keepalive_failures: 0,
            continue_error_requests: 0,
            keepalives: Vec::new(),
            on_available: None,
            on_down: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease_id
    }

    pub fn on_available<F: Fn() + Send + Sync + 'static>(&mut self, f: F) {
        self.on_available = Some(Box::new(f));
    }

    pub fn on_down<F: Fn() + Send + Sync + 'static>(&mut self, f: F) {
        self.on_down = Some(Box::new(f));
    }

    pub fn init(&mut self) -> Result<()> {
        if self.config.endpoints.is_empty() {
            return Err(MeshError::Configuration("no etcd endpoints configured".into()));
        }
        self.state = ClientState::ResolvingMembers;
        Ok(())
    }

    pub fn add_keepalive(&mut self, record: KeepaliveHandle) {
        self.keepalives.push(record);
    }

    pub fn remove_keepalive(&mut self, key: &str) {
        self.keepalives.retain(|k| k.key() != key);
    }

    fn endpoint(&mut self, now: Instant) -> Result<String> {
        self.members
            .next(now)
            .ok_or_else(|| MeshError::Configuration("no etcd endpoints configured".into()))
    }

    /// Advances whichever connection step is pending. Returns `true` if any
    /// network work was performed this call.
    pub async fn tick(&mut self) -> Result<bool> {
        let now = Instant::now();
        match self.state {
            ClientState::Init => Ok(false),
            ClientState::ResolvingMembers => self.step_resolve_members(now).await,
            ClientState::Authenticating => self.step_authenticate(now).await,
            ClientState::LeaseGranting => self.step_grant_lease(now).await,
            ClientState::Ready => self.step_ready(now).await,
            ClientState::Down => {
                self.state = ClientState::LeaseGranting;
                Ok(true)
            }
            ClientState::Closing | ClientState::Closed => Ok(false),
        }
    }

    async fn step_resolve_members(&mut self, now: Instant) -> Result<bool> {
        if !self.member_update_retry.ready(now) && self.last_member_update.is_some() {
            return Ok(false);
        }
        if self.members.urls.is_empty() {
            return Ok(false);
        }
        if self.config.auto_update {
            let endpoint = self.endpoint(now)?;
            match self.http_member_list(&endpoint).await {
                Ok(resp) => {
                    let mut urls: Vec<String> = resp
                        .members
                        .iter()
                        .flat_map(|m| m.client_urls.clone())
                        .collect();
                    if urls.is_empty() {
                        urls = self.members.urls.clone();
                    }
                    self.members = MemberUrls::new(urls);
                    self.last_member_update = Some(now);
                }
                Err(_) => {
                    self.members.penalize(&endpoint, now, self.config.request_timeout);
                }
            }
        } else {
            self.last_member_update = Some(now);
        }
        self.state = if self.config.authorization_username.is_some() {
            ClientState::Authenticating
        } else {
            ClientState::LeaseGranting
        };
        Ok(true)
    }

    async fn step_authenticate(&mut self, now: Instant) -> Result<bool> {
        if !self.auth_retry.ready(now) {
            return Ok(false);
        }
        let (username, password) = match (&self.config.authorization_username, &self.config.authorization_password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => {
                self.state = ClientState::LeaseGranting;
                return Ok(true);
            }
        };
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/auth/authenticate", endpoint.trim_end_matches('/'));
        let req = AuthenticateRequest { name: username, password };
        match self.http.post(&url).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<AuthenticateResponse>().await {
                    Ok(body) => {
                        *self.token.write().await = Some(body.token);
                        self.token_renew_at = Some(now + Duration::from_secs(5 * 60 - 120));
                        self.state = ClientState::LeaseGranting;
                        Ok(true)
                    }
                    Err(e) => {
                        tracing::warn!("failed to parse auth response: {}", e);
                        self.auth_retry.backoff(now);
                        Ok(true)
                    }
                }
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!("authentication failed: {} {}", status, body);
                self.auth_retry.backoff(now);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("authentication request failed: {}", e);
                self.members.penalize(&endpoint, now, self.config.request_timeout);
                self.auth_retry.backoff(now);
                Ok(true)
            }
        }
    }

    async fn step_grant_lease(&mut self, now: Instant) -> Result<bool> {
        if !self.lease_retry.ready(now) {
            return Ok(false);
        }
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/lease/grant", endpoint.trim_end_matches('/'));
        let req = LeaseGrantRequest {
            ttl: self.config.keepalive_timeout.as_secs() as i64,
            id: None,
        };
        match self.http.post(&url).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<LeaseGrantResponse>().await {
                Ok(body) => {
                    self.lease_id = Some(body.id);
                    self.keepalive_failures = 0;
                    self.state = ClientState::Ready;
                    if let Some(cb) = &self.on_available {
                        cb();
                    }
                    tracing::info!("registry client ready, lease {}", body.id);
                    Ok(true)
                }
                Err(e) => {
                    tracing::warn!("failed to parse lease grant response: {}", e);
                    self.lease_retry.backoff(now);
                    Ok(true)
                }
            },
            Ok(resp) => {
                tracing::warn!("lease grant failed: {}", resp.status());
                self.lease_retry.backoff(now);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("lease grant request failed: {}", e);
                self.members.penalize(&endpoint, now, self.config.request_timeout);
                self.lease_retry.backoff(now);
                Ok(true)
            }
        }
    }

    async fn step_ready(&mut self, now: Instant) -> Result<bool> {
        let mut did_work = false;

        if self.member_update_retry.ready(now) && self.config.auto_update {
            self.member_update_retry.backoff(now);
            self.state = ClientState::ResolvingMembers;
            return Ok(true);
        }

        if let Some(renew_at) = self.token_renew_at {
            if now >= renew_at {
                let _ = self.renew_token(now).await;
                did_work = true;
            }
        }

        if let Some(lease_id) = self.lease_id {
            match self.keepalive_lease(lease_id).await {
                Ok(()) => {
                    self.keepalive_failures = 0;
                }
                Err(_) => {
                    self.keepalive_failures += 1;
                    if self.keepalive_failures >= self.config.keepalive_max_failures {
                        tracing::warn!(
                            "lease keepalive failed {} times, marking client down",
                            self.keepalive_failures
                        );
                        self.lease_id = None;
                        self.state = ClientState::Down;
                        if let Some(cb) = &self.on_down {
                            cb();
                        }
                        return Ok(true);
                    }
                }
            }
            did_work = true;
        }

        Ok(did_work)
    }

    async fn renew_token(&mut self, now: Instant) -> Result<()> {
        let token = self.token.read().await.clone();
        let token = match token {
            Some(t) => t,
            None => return Ok(()),
        };
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/auth/user/get", endpoint.trim_end_matches('/'));
        let req = AuthUserGetRequest {
            name: self.config.authorization_username.clone().unwrap_or_default(),
        };
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&req)
            .send()
            .await
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))?;
        if resp.status().is_success() {
            self.token_renew_at = Some(now + Duration::from_secs(5 * 60 - 120));
        } else if categorize_status(resp.status(), "") == FailureKind::Unauthorized {
            self.state = ClientState::Authenticating;
        }
        Ok(())
    }

    async fn keepalive_lease(&mut self, lease_id: i64) -> Result<()> {
        let now = Instant::now();
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/lease/keepalive", endpoint.trim_end_matches('/'));
        let req = LeaseKeepAliveRequest { id: lease_id };
        let resp = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MeshError::RegistryTransport(format!("keepalive failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn http_member_list(&self, endpoint: &str) -> Result<MemberListResponse> {
        let url = format!("{}/v3/cluster/member/list", endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| MeshError::RegistryTransport(e.to_string()))?;
        resp.json::<MemberListResponse>()
            .await
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub async fn create_kv_get(
        &mut self,
        key: &str,
        range_end: Option<&str>,
        limit: Option<i64>,
        revision: Option<i64>,
    ) -> Result<RangeResponse> {
        self.require_ready()?;
        let now = Instant::now();
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/kv/range", endpoint.trim_end_matches('/'));
        let req = RangeRequest {
            key: b64(key),
            range_end: range_end.map(b64),
            limit,
            revision,
        };
        self.execute_json(&url, &req).await
    }

    pub async fn create_kv_put(
        &mut self,
        key: &str,
        value: &[u8],
        with_lease: bool,
        prev_kv: bool,
    ) -> Result<PutResponse> {
        self.require_ready()?;
        let now = Instant::now();
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/kv/put", endpoint.trim_end_matches('/'));
        let req = PutRequest {
            key: b64(key),
            value: b64(value),
            lease: if with_lease { self.lease_id } else { None },
            prev_kv: Some(prev_kv),
            ignore_value: None,
            ignore_lease: None,
        };
        self.execute_json(&url, &req).await
    }

    pub async fn create_kv_delete(
        &mut self,
        key: &str,
        range_end: Option<&str>,
        prev_kv: bool,
    ) -> Result<DeleteRangeResponse> {
        self.require_ready()?;
        let now = Instant::now();
        let endpoint = self.endpoint(now)?;
        let url = format!("{}/v3/kv/deleterange", endpoint.trim_end_matches('/'));
        let req = DeleteRangeRequest {
            key: b64(key),
            range_end: range_end.map(b64),
            prev_kv: Some(prev_kv),
        };
        self.execute_json(&url, &req).await
    }

    async fn execute_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &mut self,
        url: &str,
        req: &Req,
    ) -> Result<Resp> {
        match self.http.post(url).json(req).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Resp>()
                .await
                .map_err(|e| MeshError::Serialization(e.to_string())),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                match categorize_status(status, &body) {
                    FailureKind::Unauthorized => self.state = ClientState::Authenticating,
                    FailureKind::ServerBusy => {}
                    FailureKind::Other | FailureKind::Socket => self.continue_error_requests += 1,
                }
                Err(MeshError::RegistryTransport(format!("{} {}", status, body)))
            }
            Err(e) => {
                self.continue_error_requests += 1;
                Err(MeshError::RegistryTransport(e.to_string()))
            }
        }
    }

    fn require_ready(&self) -> Result<()> {
        if self.state != ClientState::Ready {
            return Err(MeshError::RegistryNotReady);
        }
        Ok(())
    }

    pub fn endpoints_snapshot(&self) -> Vec<String> {
        self.members.urls.clone()
    }

    /// Exposes the shared HTTP client for components (the watch stream) that
    /// need their own dedicated long-lived request outside the request/retry
    /// bookkeeping `execute_json` applies to simple RPCs.
    pub fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub fn pick_endpoint(&mut self) -> Result<String> {
        let now = Instant::now();
        self.endpoint(now)
    }

    pub async fn close(&mut self, revoke_lease: bool) -> Result<()> {
        self.state = ClientState::Closing;
        if revoke_lease {
            if let Some(lease_id) = self.lease_id.take() {
                let now = Instant::now();
                if let Ok(endpoint) = self.endpoint(now) {
                    let url = format!("{}/v3/lease/revoke", endpoint.trim_end_matches('/'));
                    let req = LeaseRevokeRequest { id: lease_id };
                    let _ = self.http.post(&url).json(&req).send().await;
                }
            }
        }
        self.state = ClientState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_starts_in_init() {
        let client = RegistryClient::new(EtcdConfig::default());
        assert_eq!(client.state(), ClientState::Init);
    }

    #[test]
    fn init_requires_endpoints() {
        let mut client = RegistryClient::new(EtcdConfig::default());
        assert!(client.init().is_err());
    }

    #[test]
    fn init_with_endpoints_moves_to_resolving() {
        let mut cfg = EtcdConfig::default();
        cfg.endpoints = vec!["http://127.0.0.1:2379".into()];
        let mut client = RegistryClient::new(cfg);
        client.init().unwrap();
        assert_eq!(client.state(), ClientState::ResolvingMembers);
    }

    #[test]
    fn member_round_robin_skips_penalized() {
        let mut members = MemberUrls::new(vec!["a".into(), "b".into()]);
        let now = Instant::now();
        members.penalize("a", now, Duration::from_secs(10));
        let picked = members.next(now).unwrap();
        assert_eq!(picked, "b");
    }

    #[test]
    fn categorize_status_detects_token_errors() {
        let status = reqwest::StatusCode::UNAUTHORIZED;
        assert_eq!(categorize_status(status, "invalid token"), FailureKind::Unauthorized);
        assert_eq!(
            categorize_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, ""),
            FailureKind::ServerBusy
        );
    }

    #[test]
    fn operations_require_ready_state() {
        let client = RegistryClient::new(EtcdConfig::default());
        assert!(client.require_ready().is_err());
    }
}
