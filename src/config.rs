//! Configuration surface.
//!
//! CLI / INI / YAML parsing is out of scope for this crate; it owns only
//! the in-memory shape plus the `ATAPP_*` environment overlay, written by
//! hand against plain structs rather than through a config crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub enable: bool,
    pub endpoints: Vec<String>,
    pub authorization_username: Option<String>,
    pub authorization_password: Option<String>,
    pub configure_path: String,
    pub keepalive_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max_failures: u32,
    pub auto_update: bool,
    pub member_update_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub dns_cache_ttl: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            enable: false,
            endpoints: Vec::new(),
            authorization_username: None,
            authorization_password: None,
            configure_path: "/meshbus/".to_string(),
            keepalive_timeout: Duration::from_secs(16),
            keepalive_interval: Duration::from_secs(5),
            keepalive_max_failures: 3,
            auto_update: true,
            member_update_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            dns_cache_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub start_interval: Duration,
    pub max_interval: Duration,
    pub max_try_times: u32,
    pub lost_topology_deadline: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            start_interval: Duration::from_secs(8),
            max_interval: Duration::from_secs(60),
            max_try_times: 0,
            lost_topology_deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyPolicy {
    pub allow_direct_connection: bool,
    pub require_same_upstream: bool,
    pub require_same_host: bool,
    pub require_same_process: bool,
    pub require_label_values: std::collections::HashMap<String, String>,
    pub allow_proxy_via_upstream: bool,
}

impl Default for TopologyPolicy {
    fn default() -> Self {
        Self {
            allow_direct_connection: true,
            require_same_upstream: false,
            require_same_host: false,
            require_same_process: false,
            require_label_values: std::collections::HashMap::new(),
            allow_proxy_via_upstream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    pub tick_interval: Duration,
    pub tick_round_timeout: Duration,
    pub reserve_permille: i64,
    pub reserve_interval_min: Duration,
    pub reserve_interval_max: Duration,
    pub clock_granularity: Duration,
    pub stop_timeout: Duration,
    pub stop_interval: Duration,
    pub message_timeout: Duration,
    pub endpoint_max_message_count: usize,
    pub endpoint_max_total_bytes: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(32),
            tick_round_timeout: Duration::from_millis(256),
            reserve_permille: 10,
            reserve_interval_min: Duration::from_millis(8),
            reserve_interval_max: Duration::from_millis(256),
            clock_granularity: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(10),
            stop_interval: Duration::from_millis(128),
            message_timeout: Duration::from_secs(5),
            endpoint_max_message_count: 256,
            endpoint_max_total_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Identity {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub identity: Identity,
    pub etcd: EtcdConfig,
    pub reconnect: ReconnectConfig,
    pub topology_policy: TopologyPolicy,
    pub tick: TickConfig,
    pub disable_bus_fallback: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            etcd: EtcdConfig::default(),
            reconnect: ReconnectConfig::default(),
            topology_policy: TopologyPolicy::default(),
            tick: TickConfig::default(),
            disable_bus_fallback: false,
        }
    }
}

/// Applies `ATAPP_*` environment variable overrides onto `config`.
/// Unrecognized or unparseable values are logged and ignored, never fatal.
pub fn apply_env_overlay(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("ATAPP_ETCD_ENDPOINTS") {
        config.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        config.etcd.enable = !config.etcd.endpoints.is_empty();
    }
    if let Ok(v) = std::env::var("ATAPP_ETCD_AUTHORIZATION_USERNAME") {
        config.etcd.authorization_username = Some(v);
    }
    if let Ok(v) = std::env::var("ATAPP_ETCD_AUTHORIZATION_PASSWORD") {
        config.etcd.authorization_password = Some(v);
    }
    if let Ok(v) = std::env::var("ATAPP_ID") {
        match v.parse::<u64>() {
            Ok(id) => config.identity.id = id,
            Err(_) => tracing::warn!("ATAPP_ID={} is not a valid u64, ignoring", v),
        }
    }
    if let Ok(v) = std::env::var("ATAPP_NAME") {
        config.identity.name = v;
    }
    if let Ok(v) = std::env::var("ATAPP_CONFIGURE_PATH") {
        config.etcd.configure_path = crate::model::normalize_prefix(&v);
    }
    if let Ok(v) = std::env::var("ATAPP_KEEPALIVE_TIMEOUT") {
        match v.parse::<u64>() {
            Ok(secs) => config.etcd.keepalive_timeout = Duration::from_secs(secs),
            Err(_) => tracing::warn!("ATAPP_KEEPALIVE_TIMEOUT={} is not a valid integer, ignoring", v),
        }
    }
    if let Ok(v) = std::env::var("ATAPP_KEEPALIVE_INTERVAL") {
        match v.parse::<u64>() {
            Ok(secs) => config.etcd.keepalive_interval = Duration::from_secs(secs),
            Err(_) => tracing::warn!("ATAPP_KEEPALIVE_INTERVAL={} is not a valid integer, ignoring", v),
        }
    }
    if let Ok(v) = std::env::var("ATAPP_TICK_INTERVAL_MS") {
        match v.parse::<u64>() {
            Ok(ms) => config.tick.tick_interval = Duration::from_millis(ms),
            Err(_) => tracing::warn!("ATAPP_TICK_INTERVAL_MS={} is not a valid integer, ignoring", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.etcd.keepalive_timeout, Duration::from_secs(16));
        assert_eq!(cfg.etcd.keepalive_interval, Duration::from_secs(5));
        assert_eq!(cfg.reconnect.start_interval, Duration::from_secs(8));
        assert_eq!(cfg.reconnect.max_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconnect.lost_topology_deadline, Duration::from_secs(120));
        assert_eq!(cfg.tick.message_timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_overlay_parses_endpoints() {
        std::env::set_var("ATAPP_ETCD_ENDPOINTS", "http://a:2379, http://b:2379");
        let mut cfg = AppConfig::default();
        apply_env_overlay(&mut cfg);
        assert_eq!(cfg.etcd.endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert!(cfg.etcd.enable);
        std::env::remove_var("ATAPP_ETCD_ENDPOINTS");
    }

    #[test]
    fn env_overlay_ignores_bad_integers() {
        std::env::set_var("ATAPP_ID", "not-a-number");
        let mut cfg = AppConfig::default();
        apply_env_overlay(&mut cfg);
        assert_eq!(cfg.identity.id, 0);
        std::env::remove_var("ATAPP_ID");
    }
}
