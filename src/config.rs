use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_DISCOVERY_GRACE_MS: u64 = 1500;
pub const DEFAULT_DESCRIPTOR_CACHE_TTL_SECS: u64 = 30;

/// Settings for an [`AssetManager`](crate::AssetManager).
///
/// Every field has a default, so a JSON document only needs to name what it
/// changes:
///
/// ```
/// let config = assets2036_rt::ManagerConfig::from_json_str(
///     r#"{"host": "broker.local", "namespace": "factory", "endpoint_name": "press_1"}"#,
/// ).unwrap();
/// assert_eq!(config.port, 1883);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    /// Namespace used when a call does not name one explicitly.
    pub namespace: String,
    /// Name of this process's endpoint asset, `namespace/endpoint_name`.
    pub endpoint_name: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub health_interval_ms: u64,
    /// Discovery stops once no new `_meta` arrived for this long.
    pub discovery_grace_ms: u64,
    /// Upper bound on a discovery round, regardless of traffic.
    pub discovery_max_wait_ms: u64,
    pub descriptor_cache_ttl_secs: u64,
    /// Pending calls older than this are swept from the response store.
    pub response_max_age_ms: u64,
    /// Run at most one local call per consumer operation at a time.
    pub serialize_invocations: bool,
    /// Skip TLS certificate verification when fetching https descriptors.
    pub accept_invalid_certs: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            host: "localhost".to_string(),
            port: 1883,
            namespace: "assets2036".to_string(),
            endpoint_name: "rust_endpoint".to_string(),
            keep_alive_secs: 5,
            connect_timeout_ms: 5000,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            health_interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            discovery_grace_ms: DEFAULT_DISCOVERY_GRACE_MS,
            discovery_max_wait_ms: 30_000,
            descriptor_cache_ttl_secs: DEFAULT_DESCRIPTOR_CACHE_TTL_SECS,
            response_max_age_ms: 60_000,
            serialize_invocations: true,
            accept_invalid_certs: false,
        }
    }
}

impl ManagerConfig {
    pub fn new(host: &str, port: u16, namespace: &str, endpoint_name: &str) -> Self {
        ManagerConfig {
            host: host.to_string(),
            port,
            namespace: namespace.to_string(),
            endpoint_name: endpoint_name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn discovery_grace(&self) -> Duration {
        Duration::from_millis(self.discovery_grace_ms)
    }

    pub fn discovery_max_wait(&self) -> Duration {
        Duration::from_millis(self.discovery_max_wait_ms)
    }

    pub fn descriptor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.descriptor_cache_ttl_secs)
    }

    pub fn response_max_age(&self) -> Duration {
        Duration::from_millis(self.response_max_age_ms)
    }

    /// `namespace/endpoint_name`
    pub fn endpoint_full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.endpoint_name)
    }
}
