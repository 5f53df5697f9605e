//! The `_endpoint` asset every connected manager owns: liveness properties,
//! a `ping` operation, lifecycle hooks and a `log` event.

use crate::asset::Asset;
use crate::event::Event;
use crate::property::Property;
use crate::submodel::SubModel;
use crate::Error;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

pub const ENDPOINT_SUBMODEL: &str = "_endpoint";
pub const ONLINE: &str = "online";
pub const HEALTHY: &str = "healthy";
pub const PING: &str = "ping";
pub const SHUTDOWN: &str = "shutdown";
pub const RESTART: &str = "restart";
pub const LOG: &str = "log";

pub(crate) const ENDPOINT_SUBMODEL_JSON: &str = r#"
{
    "name": "_endpoint",
    "rev": "1.0.0",
    "description": "Liveness and control of a runtime endpoint",
    "properties": {
        "online": {"type": "boolean"},
        "healthy": {"type": "boolean"}
    },
    "operations": {
        "ping": {},
        "shutdown": {},
        "restart": {}
    },
    "events": {
        "log": {
            "parameters": {"entry": {"type": "string"}}
        }
    }
}
"#;

pub type HealthCallback = Arc<dyn Fn() -> Result<bool, Error> + Send + Sync>;
pub type EndpointHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EndpointHooks {
    shutdown: RwLock<Option<EndpointHook>>,
    restart: RwLock<Option<EndpointHook>>,
}

fn run_hook(slot: &RwLock<Option<EndpointHook>>, name: &str) {
    let hook = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
    match hook {
        Some(hook) => {
            log::info!("Endpoint {} requested", name);
            hook();
        }
        None => log::warn!("Endpoint {} requested but no hook is registered", name),
    }
}

/// Periodically writes the health callback's verdict to `healthy`.
struct HealthMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    fn start(healthy: Arc<Property>, callback: HealthCallback, interval: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                let check = callback.clone();
                let verdict = match tokio::task::spawn_blocking(move || check()).await {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(e)) => {
                        log::warn!("Health callback failed: {}", e);
                        false
                    }
                    Err(e) => {
                        log::error!("Health callback panicked: {}", e);
                        false
                    }
                };
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(e) = healthy.set_value(json!(verdict)).await {
                    log::warn!("Could not publish health: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Health monitor stopped.");
        });
        HealthMonitor { stop, task }
    }

    /// Returns once the task has finished; nothing is written afterwards.
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            log::error!("Health monitor ended abnormally: {}", e);
        }
    }
}

/// Owner handle on this process's `_endpoint` asset.
#[derive(Clone)]
pub struct AssetEndpoint {
    asset: Asset,
    submodel: Arc<SubModel>,
    hooks: Arc<EndpointHooks>,
    health: Arc<TokioMutex<Option<HealthMonitor>>>,
    health_interval: Duration,
}

impl fmt::Debug for AssetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetEndpoint")
            .field("asset", &self.asset.full_name())
            .field("health_interval", &self.health_interval)
            .finish_non_exhaustive()
    }
}

impl AssetEndpoint {
    /// Binds `ping`, `shutdown` and `restart` on an owned `_endpoint` asset.
    pub(crate) fn attach(asset: Asset, health_interval: Duration) -> Result<Self, Error> {
        let submodel = asset.submodel(ENDPOINT_SUBMODEL)?;
        let hooks = Arc::new(EndpointHooks::default());

        submodel.operation(PING)?.bind(|_| Ok(Value::Null))?;
        let shutdown_hooks = hooks.clone();
        submodel.operation(SHUTDOWN)?.bind(move |_| {
            run_hook(&shutdown_hooks.shutdown, SHUTDOWN);
            Ok(Value::Null)
        })?;
        let restart_hooks = hooks.clone();
        submodel.operation(RESTART)?.bind(move |_| {
            run_hook(&restart_hooks.restart, RESTART);
            Ok(Value::Null)
        })?;

        Ok(AssetEndpoint {
            asset,
            submodel,
            hooks,
            health: Arc::new(TokioMutex::new(None)),
            health_interval,
        })
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn full_name(&self) -> String {
        self.asset.full_name()
    }

    pub fn submodel(&self) -> &Arc<SubModel> {
        &self.submodel
    }

    fn property(&self, name: &str) -> Result<Arc<Property>, Error> {
        self.submodel.property(name)
    }

    pub(crate) fn log_event(&self) -> Result<Arc<Event>, Error> {
        self.submodel.event(LOG)
    }

    pub async fn set_online(&self, online: bool) -> Result<(), Error> {
        self.property(ONLINE)?.set_value(json!(online)).await
    }

    /// `None` clears the retained value.
    pub async fn set_healthy(&self, healthy: Option<bool>) -> Result<(), Error> {
        let value = healthy.map(Value::Bool).unwrap_or(Value::Null);
        self.property(HEALTHY)?.set_value(value).await
    }

    /// Emits the `log` event with `{"entry": entry}`.
    pub async fn log(&self, entry: &str) -> Result<(), Error> {
        let mut params = crate::Parameters::new();
        params.insert("entry".to_string(), json!(entry));
        self.log_event()?.emit(params).await
    }

    pub fn on_shutdown<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.hooks.shutdown.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn on_restart<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.hooks.restart.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Installs (or with `None` removes) the periodic health check. Any
    /// running check is stopped first. Removing it clears `healthy`.
    pub async fn set_health_callback(&self, callback: Option<HealthCallback>) -> Result<(), Error> {
        let mut slot = self.health.lock().await;
        if let Some(running) = slot.take() {
            running.stop().await;
        }
        match callback {
            Some(callback) => {
                let healthy = self.property(HEALTHY)?;
                *slot = Some(HealthMonitor::start(healthy, callback, self.health_interval));
                Ok(())
            }
            None => self.set_healthy(None).await,
        }
    }

    pub async fn has_health_callback(&self) -> bool {
        self.health.lock().await.is_some()
    }

    /// Stops the health task without touching `healthy`.
    pub(crate) async fn stop_health(&self) {
        if let Some(running) = self.health.lock().await.take() {
            running.stop().await;
        }
    }
}
