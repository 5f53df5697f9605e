#![allow(dead_code)]

use assets2036_rt::{AssetManager, InMemoryBroker, ManagerConfig, MemoryTransport, Parameters};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

pub const NAMESPACE: &str = "test_ns";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config(endpoint_name: &str) -> ManagerConfig {
    ManagerConfig {
        operation_timeout_ms: 1000,
        health_interval_ms: 100,
        discovery_grace_ms: 200,
        discovery_max_wait_ms: 3000,
        ..ManagerConfig::new("memory", 0, NAMESPACE, endpoint_name)
    }
}

/// Manager on its own session of `broker`, already connected.
pub async fn connected_manager(broker: &InMemoryBroker, endpoint_name: &str) -> AssetManager {
    connected_manager_with_transport(broker, endpoint_name).await.0
}

/// Same as [`connected_manager`], also returning the session for fault injection.
pub async fn connected_manager_with_transport(
    broker: &InMemoryBroker,
    endpoint_name: &str,
) -> (AssetManager, Arc<MemoryTransport>) {
    init_logging();
    let transport = Arc::new(broker.transport());
    let manager = AssetManager::with_transport(test_config(endpoint_name), transport.clone())
        .expect("manager construction failed");
    manager.connect().await.expect("connect to in-memory broker failed");
    (manager, transport)
}

pub fn submodel_path(file_name: &str) -> String {
    format!("{}/tests/test_submodels/{}", env!("CARGO_MANIFEST_DIR"), file_name)
}

pub fn submodel_json(file_name: &str) -> String {
    std::fs::read_to_string(submodel_path(file_name)).expect("test submodel missing")
}

pub fn params(entries: &[(&str, Value)]) -> Parameters {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Polls `check` until it holds or two seconds have passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
