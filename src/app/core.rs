//! Application Core (C8): the single-logical-thread event loop tying the
//! Registry Client, Discovery Set, Topology Connector, Transport Registry
//! and Endpoints together.
//!
//! One coordinator struct owns every subsystem plus an event-hook surface.
//! `AppCore` owns its subsystems directly and is never shared/cloned across
//! tasks; internal state that must still be `Send` across `.await` points
//! uses plain fields rather than `Arc<RwLock<..>>` wrappers.

use crate::config::AppConfig;
use crate::discovery::DiscoverySet;
use crate::endpoint::{ConnectionHandle, Endpoint};
use crate::error::{ErrorCode, MeshError, Result};
use crate::model::{Metadata, PeerRecord, TopologyRecord};
use crate::registry::RegistryClient;
use crate::topology::{ConnectPlan, TopologyConnector};
use crate::transport::{LoopbackTransport, TransportRegistry};

use super::flags::{self, Flags};
use super::module::Module;
use super::waker::WakeQueue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type ForwardRequestCallback = Arc<dyn Fn(u64, i32, u64, &[u8], Option<&str>) + Send + Sync>;
pub type ForwardResponseCallback = Arc<dyn Fn(u64, i32, u64, i32) + Send + Sync>;
pub type DiscoveryCallback = Arc<dyn Fn(bool, &PeerRecord) + Send + Sync>;
pub type TopologyCallback = Arc<dyn Fn(bool, &TopologyRecord) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(u64, bool) + Send + Sync>;

/// A message destination: either side of the dual id/name index.
pub enum SendTarget {
    Id(u64),
    Name(String),
}

/// Tick-timer compensation: keeps the average tick period at `tick_interval`
/// even when individual ticks overrun their reserved budget.
pub struct TickTimer {
    config: crate::config::TickConfig,
    compensation: Duration,
}

impl TickTimer {
    pub fn new(config: crate::config::TickConfig) -> Self {
        Self { config, compensation: Duration::ZERO }
    }

    /// Records the wall cost of a just-completed tick and returns the delay
    /// to sleep before the next one is rearmed.
    pub fn record(&mut self, measured: Duration) -> Duration {
        let permille = (self.config.reserve_permille.clamp(0, 999)) as u32;
        let threshold = self.config.tick_interval * (1000 - permille) / 1000;
        if measured > threshold {
            self.compensation += measured - threshold;
        }
        if self.compensation.is_zero() {
            return round_down(self.config.tick_interval, self.config.clock_granularity);
        }
        let applied = self
            .compensation
            .clamp(self.config.reserve_interval_min, self.config.reserve_interval_max);
        self.compensation = self.compensation.saturating_sub(applied);
        let next = self.config.tick_interval.saturating_sub(applied);
        round_down(next, self.config.clock_granularity)
    }
}

fn round_down(d: Duration, granule: Duration) -> Duration {
    if granule.is_zero() {
        return d;
    }
    let granule_nanos = granule.as_nanos();
    let floored = (d.as_nanos() / granule_nanos) * granule_nanos;
    Duration::from_nanos(floored as u64)
}

pub struct AppCore {
    config: AppConfig,
    flags: Flags,
    self_id: u64,
    self_peer: PeerRecord,
    bus_parent_id: Option<u64>,

    modules: Vec<Box<dyn Module>>,
    registry_client: Option<RegistryClient>,
    discovery: DiscoverySet,
    topology: TopologyConnector,
    transports: TransportRegistry,
    loopback: Arc<LoopbackTransport>,
    endpoints: HashMap<u64, Endpoint>,
    wake_queue: WakeQueue,
    tick_timer: TickTimer,

    last_stop_tick: Option<Instant>,
    last_stop_poll: Option<Instant>,
    inner_break: Option<Instant>,

    on_forward_request: Option<ForwardRequestCallback>,
    on_forward_response: Option<ForwardResponseCallback>,
    on_discovery_event: Option<DiscoveryCallback>,
    on_topology_event: Option<TopologyCallback>,
    on_app_connected: Option<ConnectionCallback>,
    on_app_disconnected: Option<ConnectionCallback>,
    on_finally: Vec<Box<dyn FnOnce() + Send>>,
}

impl AppCore {
    pub fn new(config: AppConfig) -> Self {
        let self_id = config.identity.id;
        let self_peer = PeerRecord {
            id: self_id,
            name: config.identity.name.clone(),
            ..Default::default()
        }
        .with_computed_hash();

        let registry_client = if config.etcd.enable {
            Some(RegistryClient::new(config.etcd.clone()))
        } else {
            None
        };

        let loopback = LoopbackTransport::new(
            config.tick.endpoint_max_message_count,
            config.tick.endpoint_max_total_bytes,
        );
        let transports = TransportRegistry::new();
        transports.add_connector(loopback.clone());

        let topology = TopologyConnector::new(
            self_id,
            None,
            self_peer.hostname.clone(),
            self_peer.pid,
            config.topology_policy.clone(),
            config.reconnect.clone(),
        );

        let mut disable_flags = Flags::new();
        if config.disable_bus_fallback {
            disable_flags.set(flags::DISABLE_BUS_FALLBACK);
        }

        Self {
            tick_timer: TickTimer::new(config.tick.clone()),
            config,
            flags: disable_flags,
            self_id,
            self_peer,
            bus_parent_id: None,
            modules: Vec::new(),
            registry_client,
            discovery: DiscoverySet::new(),
            topology,
            transports,
            loopback,
            endpoints: HashMap::new(),
            wake_queue: WakeQueue::new(),
            last_stop_tick: None,
            last_stop_poll: None,
            inner_break: None,
            on_forward_request: None,
            on_forward_response: None,
            on_discovery_event: None,
            on_topology_event: None,
            on_app_connected: None,
            on_app_disconnected: None,
            on_finally: Vec::new(),
        }
    }

    pub fn add_module(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn set_bus_parent(&mut self, upstream_id: Option<u64>) {
        self.bus_parent_id = upstream_id;
        self.topology = TopologyConnector::new(
            self.self_id,
            upstream_id,
            self.self_peer.hostname.clone(),
            self.self_peer.pid,
            self.config.topology_policy.clone(),
            self.config.reconnect.clone(),
        );
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn discovery(&self) -> &DiscoverySet {
        &self.discovery
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn on_forward_request(&mut self, cb: ForwardRequestCallback) {
        self.on_forward_request = Some(cb);
    }

    pub fn on_forward_response(&mut self, cb: ForwardResponseCallback) {
        self.on_forward_response = Some(cb);
    }

    pub fn on_discovery_event(&mut self, cb: DiscoveryCallback) {
        self.on_discovery_event = Some(cb);
    }

    pub fn on_topology_event(&mut self, cb: TopologyCallback) {
        self.on_topology_event = Some(cb);
    }

    pub fn on_app_connected(&mut self, cb: ConnectionCallback) {
        self.on_app_connected = Some(cb);
    }

    pub fn on_app_disconnected(&mut self, cb: ConnectionCallback) {
        self.on_app_disconnected = Some(cb);
    }

    /// Registers a one-shot callback invoked (in reverse registration order)
    /// once the app finishes stopping.
    pub fn on_finally(&mut self, cb: Box<dyn FnOnce() + Send>) {
        self.on_finally.push(cb);
    }

    // ---- Lifecycle -------------------------------------------------

    pub async fn init(&mut self) -> Result<i32> {
        if !self.flags.try_enter(flags::INITIALIZING, flags::INITIALIZING | flags::INITIALIZED) {
            return Err(MeshError::RecursiveCall("init"));
        }
        for module in &mut self.modules {
            module.init().await?;
        }
        if let Some(client) = self.registry_client.as_mut() {
            client.init()?;
        }
        self.flags.clear(flags::INITIALIZING);
        self.flags.set(flags::INITIALIZED);
        Ok(ErrorCode::Success.as_i32())
    }

    pub fn reload(&mut self) -> i32 {
        crate::config::apply_env_overlay(&mut self.config);
        ErrorCode::Success.as_i32()
    }

    pub fn stop(&mut self) -> i32 {
        if !self.flags.try_enter(flags::STOPPING, flags::STOPPING | flags::DESTROYING) {
            return ErrorCode::RecursiveCall.as_i32();
        }
        self.last_stop_tick = Some(Instant::now());
        ErrorCode::Success.as_i32()
    }

    /// Runs ticks until `STOPPED`. Each round sleeps for the tick-timer's
    /// compensated delay.
    pub async fn run(&mut self) -> Result<i32> {
        self.flags.set(flags::RUNNING);
        loop {
            let code = self.tick().await?;
            if self.flags.contains(flags::STOPPED) {
                break;
            }
            if code != ErrorCode::Success.as_i32() {
                continue;
            }
            let delay = self.tick_timer.record(Duration::from_millis(0));
            tokio::time::sleep(delay).await;
        }
        self.flags.clear(flags::RUNNING);
        Ok(ErrorCode::Success.as_i32())
    }

    /// Runs ticks until at least `min_events` rounds have processed work, or
    /// `timeout` elapses, whichever comes first.
    pub async fn run_once(&mut self, min_events: usize, timeout: Duration) -> Result<i32> {
        self.inner_break = Some(Instant::now() + timeout);
        let mut events = 0usize;
        while events < min_events {
            self.tick().await?;
            events += 1;
            if self.inner_break.map_or(false, |deadline| Instant::now() >= deadline) {
                self.inner_break = None;
                return Ok(ErrorCode::OperationTimeout.as_i32());
            }
            if self.flags.contains(flags::STOPPED) {
                break;
            }
        }
        self.inner_break = None;
        Ok(ErrorCode::Success.as_i32())
    }

    /// Runs at most `max_events` ticks without blocking between them.
    pub async fn run_noblock(&mut self, max_events: usize) -> Result<i32> {
        for _ in 0..max_events {
            self.tick().await?;
            if self.flags.contains(flags::STOPPED) {
                break;
            }
        }
        Ok(ErrorCode::Success.as_i32())
    }

    /// The tick algorithm: module ticks, bus/registry poll, then waker-PQ
    /// drain and loopback dispatch, repeated until no work was done or
    /// `tick_round_timeout` elapses.
    pub async fn tick(&mut self) -> Result<i32> {
        if !self.flags.try_enter(flags::IN_TICK, flags::IN_TICK) {
            return Err(MeshError::RecursiveCall("tick"));
        }
        let start = Instant::now();
        loop {
            let mut did_work = false;

            for module in &mut self.modules {
                module.tick().await?;
                did_work = true;
            }

            if let Some(client) = self.registry_client.as_mut() {
                if client.tick().await? {
                    did_work = true;
                }
            }

            let deadline = start + self.config.tick.tick_interval;
            let now = Instant::now();
            if now <= deadline {
                let due = self.wake_queue.drain_due(now);
                for peer_id in due {
                    did_work = true;
                    self.retry_endpoint(peer_id, now).await;
                }

                let drained = self.loopback.drain();
                if !drained.is_empty() {
                    did_work = true;
                }
                for msg in drained {
                    if let Some(cb) = &self.on_forward_request {
                        cb(self.self_id, msg.msg_type, msg.sequence, &msg.payload, msg.metadata.as_deref());
                    }
                }
            }

            if self.flags.contains(flags::STOPPING) {
                if self.drive_stop(Instant::now()) {
                    break;
                }
            }

            let elapsed = Instant::now().duration_since(start);
            if elapsed >= self.config.tick.tick_round_timeout || !did_work {
                break;
            }
        }
        self.flags.clear(flags::IN_TICK);
        Ok(ErrorCode::Success.as_i32())
    }

    async fn retry_endpoint(&mut self, peer_id: u64, now: Instant) {
        let outcome = match self.endpoints.get_mut(&peer_id) {
            Some(endpoint) => endpoint.retry_pending_messages(now, usize::MAX).await,
            None => return,
        };
        for expired in outcome.expired {
            if let Some(cb) = &self.on_forward_response {
                cb(peer_id, expired.msg_type, expired.sequence, ErrorCode::Timeout.as_i32());
            }
        }
        if outcome.handle_failed {
            self.topology.mark_unready(peer_id, now);
            if let Some(cb) = &self.on_app_disconnected {
                cb(peer_id, true);
            }
        }
        if let Some(endpoint) = self.endpoints.get(&peer_id) {
            if endpoint.is_idle() {
                self.endpoints.remove(&peer_id);
            }
        }
    }

    /// Re-polls stopping modules at `stop_interval` cadence; force-escalates
    /// to `TimedOut` past `stop_timeout`.
    fn drive_stop(&mut self, now: Instant) -> bool {
        let started = match self.last_stop_tick {
            Some(t) => t,
            None => return true,
        };
        let should_poll = self
            .last_stop_poll
            .map_or(true, |last| now.duration_since(last) >= self.config.tick.stop_interval);
        if !should_poll {
            return false;
        }
        self.last_stop_poll = Some(now);

        let mut all_stopped = true;
        for module in &mut self.modules {
            if module.stop() > 0 {
                all_stopped = false;
            }
        }
        if all_stopped {
            self.finish_stop();
            return true;
        }
        if now.duration_since(started) >= self.config.tick.stop_timeout {
            self.flags.set(flags::TIMED_OUT);
            for module in &mut self.modules {
                module.timeout();
            }
            self.finish_stop();
            return true;
        }
        false
    }

    fn finish_stop(&mut self) {
        self.flags.set(flags::STOPPED);
        self.flags.clear(flags::RUNNING | flags::STOPPING);
        while let Some(cb) = self.on_finally.pop() {
            cb();
        }
    }

    // ---- Discovery / topology event dispatch ------------------------

    /// Discovery event dispatch. On PUT, upserts, invalidates caches (via
    /// `DiscoverySet::add_node`), and lets the Topology Connector progress
    /// any handle waiting on this peer. On DELETE, removes the index entry
    /// and marks the handle `LOST_TOPOLOGY`; the `Endpoint` itself is left
    /// to drain/expire on its own.
    pub fn handle_discovery_event(&mut self, peer: PeerRecord, is_delete: bool) {
        let peer_id = peer.id;
        if is_delete {
            self.discovery.remove_node_by_id(peer_id);
        } else {
            self.discovery.add_node(peer.clone());
        }
        self.topology.on_discovery_event(peer_id, is_delete);
        if let Some(cb) = &self.on_discovery_event {
            cb(is_delete, &peer);
        }
    }

    pub fn handle_topology_event(&mut self, record: TopologyRecord, is_delete: bool) {
        let peer_id = record.id;
        if is_delete {
            self.topology.remove_topology(peer_id);
        } else {
            self.topology.upsert_topology(record.clone());
        }
        if let Some(cb) = &self.on_topology_event {
            cb(is_delete, &record);
        }
    }

    // ---- Messaging ----------------------------------------------------

    pub async fn send_message(
        &mut self,
        target: SendTarget,
        msg_type: i32,
        payload: Vec<u8>,
        metadata: Option<String>,
    ) -> Result<u64> {
        let now = Instant::now();
        let peer_id = self.resolve_target(&target)?;
        if let Err(e) = self.ensure_connected(peer_id, now).await {
            match e {
                MeshError::DiscoveryNotFound(_) | MeshError::TopologyDeny(_) => return Err(e),
                other => tracing::debug!("deferred connect to peer {}: {}", peer_id, other),
            }
        }
        let endpoint = self.mutable_endpoint(peer_id);
        endpoint.push_forward_message(msg_type, 0, payload, metadata, now)
    }

    pub async fn send_message_by_consistent_hash(
        &mut self,
        hash_key: &[u8],
        filter: Option<&Metadata>,
        msg_type: i32,
        payload: Vec<u8>,
        metadata: Option<String>,
    ) -> Result<u64> {
        let peer_id = self
            .discovery
            .get_node_by_consistent_hash(hash_key, filter)
            .ok_or_else(|| MeshError::DiscoveryNotFound("consistent-hash".into()))?
            .id;
        self.send_message(SendTarget::Id(peer_id), msg_type, payload, metadata).await
    }

    pub async fn send_message_by_random(
        &mut self,
        filter: Option<&Metadata>,
        msg_type: i32,
        payload: Vec<u8>,
        metadata: Option<String>,
    ) -> Result<u64> {
        let peer_id = self
            .discovery
            .get_node_by_random(filter)
            .ok_or_else(|| MeshError::DiscoveryNotFound("random".into()))?
            .id;
        self.send_message(SendTarget::Id(peer_id), msg_type, payload, metadata).await
    }

    pub async fn send_message_by_round_robin(
        &mut self,
        filter: Option<&Metadata>,
        msg_type: i32,
        payload: Vec<u8>,
        metadata: Option<String>,
    ) -> Result<u64> {
        let peer_id = self
            .discovery
            .get_node_by_round_robin(filter)
            .ok_or_else(|| MeshError::DiscoveryNotFound("round-robin".into()))?
            .id;
        self.send_message(SendTarget::Id(peer_id), msg_type, payload, metadata).await
    }

    fn resolve_target(&mut self, target: &SendTarget) -> Result<u64> {
        match target {
            SendTarget::Id(id) => {
                if *id == self.self_id || self.discovery.get_node_by_id(*id).is_some() || self.endpoints.contains_key(id) {
                    Ok(*id)
                } else {
                    self.node_not_found_or_bus_fallback(id.to_string())
                }
            }
            SendTarget::Name(name) => {
                if *name == self.self_peer.name {
                    return Ok(self.self_id);
                }
                match self.discovery.get_node_by_name(name) {
                    Some(peer) => Ok(peer.id),
                    None => self.node_not_found_or_bus_fallback(name.clone()),
                }
            }
        }
    }

    /// Send routing's final branch: the legacy bus transport collaborator
    /// this falls back to is out of this crate's scope, so both the
    /// fallback-enabled and fallback-disabled paths currently resolve to
    /// `NODE_NOT_FOUND`; the distinction is kept so a future bus integration
    /// only needs to replace the `Ok` arm.
    fn node_not_found_or_bus_fallback(&self, key: String) -> Result<u64> {
        if self.flags.contains(flags::DISABLE_BUS_FALLBACK) {
            Err(MeshError::NodeNotFound(key))
        } else {
            Err(MeshError::NodeNotFound(key))
        }
    }

    fn mutable_endpoint(&mut self, peer_id: u64) -> &mut Endpoint {
        if !self.endpoints.contains_key(&peer_id) {
            let peer = self
                .discovery
                .get_node_by_id(peer_id)
                .unwrap_or_else(|| {
                    if peer_id == self.self_id {
                        Arc::new(self.self_peer.clone())
                    } else {
                        Arc::new(PeerRecord { id: peer_id, ..Default::default() })
                    }
                });
            let endpoint = Endpoint::new(
                peer,
                self.config.tick.endpoint_max_message_count,
                self.config.tick.endpoint_max_total_bytes,
                self.config.tick.message_timeout,
            );
            self.endpoints.insert(peer_id, endpoint);
        }
        self.endpoints.get_mut(&peer_id).expect("just inserted above")
    }

    async fn endpoint_has_ready_handle(&self, peer_id: u64) -> bool {
        match self.endpoints.get(&peer_id) {
            Some(endpoint) => endpoint.get_ready_connection_handle().await.is_some(),
            None => false,
        }
    }

    async fn get_ready_handle(&self, peer_id: u64) -> Option<ConnectionHandle> {
        self.endpoints.get(&peer_id)?.get_ready_connection_handle().await
    }

    /// Self-send binds exclusively via the loopback transport.
    async fn ensure_loopback_bound(&mut self, peer_id: u64, now: Instant) -> Result<()> {
        if self.endpoint_has_ready_handle(peer_id).await {
            return Ok(());
        }
        let peer = Arc::new(self.self_peer.clone());
        let handle = self.loopback.start_connect(&peer, peer_id, "loopback://self").await?;
        self.mutable_endpoint(peer_id).attach_handle(handle).await;
        self.mutable_endpoint(peer_id).add_waker(now);
        self.wake_queue.schedule(peer_id, now);
        Ok(())
    }

    /// Drives the link-selection algorithm to completion for one peer,
    /// recursing up the upstream/proxy chain as needed so that every
    /// intermediate hop is itself connected first.
    fn ensure_connected<'a>(
        &'a mut self,
        peer_id: u64,
        now: Instant,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            if peer_id == self.self_id {
                return self.ensure_loopback_bound(peer_id, now).await;
            }
            if self.endpoint_has_ready_handle(peer_id).await {
                return Ok(());
            }
            let Some(peer) = self.discovery.get_node_by_id(peer_id) else {
                return Err(MeshError::DiscoveryNotFound(peer_id.to_string()));
            };

            let plan = self.topology.try_connect_to(&peer, &self.discovery, &self.transports, false);
            match plan {
                ConnectPlan::AlreadyReady => {
                    self.topology.mark_ready(peer_id);
                    self.dial_direct(peer, 0, now).await
                }
                ConnectPlan::DialDirect { gateway_index } => self.dial_direct(peer, gateway_index, now).await,
                ConnectPlan::DialUpstream { upstream_id } => {
                    self.ensure_connected(upstream_id, now).await?;
                    self.bind_via_proxy(peer_id, upstream_id, now).await
                }
                ConnectPlan::DialViaProxy { proxy_id } => {
                    self.ensure_connected(proxy_id, now).await?;
                    self.bind_via_proxy(peer_id, proxy_id, now).await
                }
                ConnectPlan::ProxyViaCurrentUpstream => {
                    let Some(upstream_id) = self.bus_parent_id else {
                        return Err(MeshError::TopologyUnknown(peer_id));
                    };
                    self.ensure_connected(upstream_id, now).await?;
                    self.bind_via_proxy(peer_id, upstream_id, now).await
                }
                ConnectPlan::WaitDownstream => Ok(()),
                ConnectPlan::Deny => Err(MeshError::TopologyDeny(peer_id)),
            }
        })
    }

    async fn dial_direct(&mut self, peer: Arc<PeerRecord>, gateway_index: usize, now: Instant) -> Result<()> {
        let gateway = peer
            .gateways
            .get(gateway_index)
            .ok_or(MeshError::NoAvailableAddress)?
            .clone();
        let scheme = crate::transport::parse_scheme(&gateway.address)
            .ok_or_else(|| MeshError::BadData(gateway.address.clone()))?;
        let transport = self.transports.get(&scheme).ok_or(MeshError::ChannelNotSupport)?;

        let connect_result = transport.start_connect(&peer, peer.id, &gateway.address).await;
        match connect_result {
            Ok(handle) => {
                self.mutable_endpoint(peer.id).attach_handle(handle).await;
                let should_wake = self.topology.mark_ready(peer.id);
                if should_wake {
                    self.mutable_endpoint(peer.id).add_waker(now);
                    self.wake_queue.schedule(peer.id, now);
                }
                if let Some(cb) = &self.on_app_connected {
                    cb(peer.id, true);
                }
                Ok(())
            }
            Err(e) => {
                self.topology.mark_unready(peer.id, now);
                Err(MeshError::ConnectFailed(e.to_string()))
            }
        }
    }

    /// Binds `target_id`'s endpoint to `proxy_id`'s live (already-ready)
    /// handle. Because `ConnectionHandle` shares its inner state through an
    /// `Arc`, attaching the very same handle means `target`'s readiness is
    /// thereafter derived from `proxy`'s automatically.
    async fn bind_via_proxy(&mut self, target_id: u64, proxy_id: u64, now: Instant) -> Result<()> {
        let Some(handle) = self.get_ready_handle(proxy_id).await else {
            return Err(MeshError::NoConnection);
        };
        self.mutable_endpoint(target_id).attach_handle(handle).await;
        let should_wake = self.topology.mark_ready(target_id);
        if should_wake {
            self.mutable_endpoint(target_id).add_waker(now);
            self.wake_queue.schedule(target_id, now);
        }
        Ok(())
    }

    /// Tears down a proxy's connection once `unbind_from_proxy` reports it
    /// orphaned.
    pub async fn unbind_endpoint_from_proxy(&mut self, target_id: u64) {
        if let Some(orphaned_proxy) = self.topology.unbind_from_proxy(target_id) {
            if let Some(endpoint) = self.endpoints.get_mut(&orphaned_proxy) {
                if let Some(handle) = endpoint.get_ready_connection_handle().await {
                    let _ = handle.close().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::module::NoopModule;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.identity.id = 1;
        config.identity.name = "self".into();
        config.tick.tick_interval = Duration::from_millis(10);
        config.tick.tick_round_timeout = Duration::from_millis(40);
        config
    }

    #[tokio::test]
    async fn init_rejects_reentry() {
        let mut app = AppCore::new(test_config());
        assert_eq!(app.init().await.unwrap(), ErrorCode::Success.as_i32());
        // A second concurrent-looking init (flag already INITIALIZED) is rejected.
        assert!(matches!(app.init().await, Err(MeshError::RecursiveCall("init"))));
    }

    #[tokio::test]
    async fn tick_runs_registered_modules() {
        let mut app = AppCore::new(test_config());
        app.add_module(Box::new(NoopModule { name: "noop".into(), tick_count: 0 }));
        app.init().await.unwrap();
        app.tick().await.unwrap();
    }

    #[tokio::test]
    async fn send_to_self_uses_loopback_and_dispatches_on_tick() {
        let mut app = AppCore::new(test_config());
        app.init().await.unwrap();
        let seq = app
            .send_message(SendTarget::Id(1), 7, b"hello".to_vec(), None)
            .await
            .unwrap();
        assert!(seq >= 1);
        app.tick().await.unwrap();
    }

    #[tokio::test]
    async fn self_send_is_woken_and_delivered_without_a_second_send() {
        // The endpoint must be scheduled on the wake queue as part of
        // binding the loopback handle, not only on a later dial/proxy path,
        // or the pending message would sit forever since nothing else
        // drains it.
        let mut app = AppCore::new(test_config());
        let received: Arc<std::sync::Mutex<Vec<(i32, Vec<u8>)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_cb = received.clone();
        app.on_forward_request(Arc::new(move |_sender, msg_type, _seq, payload, _metadata| {
            received_cb.lock().unwrap().push((msg_type, payload.to_vec()));
        }));
        app.init().await.unwrap();
        app.send_message(SendTarget::Id(1), 7, b"hi".to_vec(), None).await.unwrap();

        for _ in 0..2 {
            app.tick().await.unwrap();
            if !received.lock().unwrap().is_empty() {
                break;
            }
        }
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 7);
        assert_eq!(got[0].1, b"hi");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_returns_node_not_found() {
        let mut app = AppCore::new(test_config());
        app.init().await.unwrap();
        let err = app
            .send_message(SendTarget::Id(999), 1, b"x".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NodeNotFound);
    }

    #[tokio::test]
    async fn stop_then_tick_transitions_to_stopped_with_no_modules() {
        let mut app = AppCore::new(test_config());
        app.init().await.unwrap();
        assert_eq!(app.stop(), ErrorCode::Success.as_i32());
        app.tick().await.unwrap();
        assert!(app.flags().contains(flags::STOPPED));
    }

    #[test]
    fn tick_timer_shortens_next_delay_after_overrun() {
        let mut config = crate::config::TickConfig::default();
        config.tick_interval = Duration::from_millis(100);
        config.reserve_permille = 100;
        config.reserve_interval_min = Duration::from_millis(5);
        config.reserve_interval_max = Duration::from_millis(50);
        config.clock_granularity = Duration::from_millis(1);
        let mut timer = TickTimer::new(config);
        let first = timer.record(Duration::from_millis(95));
        assert!(first < Duration::from_millis(100));
    }

    #[test]
    fn discovery_event_dispatch_upserts_and_removes() {
        let mut app = AppCore::new(test_config());
        let peer = PeerRecord { id: 5, name: "svc-5".into(), ..Default::default() };
        app.handle_discovery_event(peer.clone(), false);
        assert!(app.discovery().get_node_by_id(5).is_some());
        app.handle_discovery_event(peer, true);
        assert!(app.discovery().get_node_by_id(5).is_none());
    }
}
