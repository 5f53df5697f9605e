use crate::asset::{Asset, AssetInner, AssetRegistry};
use crate::config::ManagerConfig;
use crate::correlation::ResponseStore;
use crate::definition::SubmodelDescriptor;
use crate::discovery::{self, MetaWatchers};
use crate::dispatcher::{ConnectionMonitor, Dispatcher, UpdateQueue};
use crate::endpoint::{AssetEndpoint, HealthCallback, ENDPOINT_SUBMODEL, ENDPOINT_SUBMODEL_JSON, ONLINE};
use crate::loader::{DescriptorLoader, UrlDescriptorLoader, INLINE_SOURCE_URL};
use crate::logging::EndpointLogHandler;
use crate::operation::InvocationSettings;
use crate::submodel::{BindContext, SubModel};
use crate::subscriptions::SubscriptionTable;
use crate::transport::{ConnectOptions, InboundMessage, LastWill, MqttTransport, Transport, TransportEvent};
use crate::{topic, Error, Mode};
use log::LevelFilter;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as TokioMutex, RwLock as TokioRwLock};
use tokio::task::JoinHandle;

pub(crate) struct ManagerShared {
    config: ManagerConfig,
    client_id: String,
    transport: Arc<dyn Transport>,
    loader: Arc<dyn DescriptorLoader>,
    registry: Arc<AssetRegistry>,
    responses: Arc<ResponseStore>,
    watchers: Arc<MetaWatchers>,
    connection: Arc<ConnectionMonitor>,
    subscriptions: SubscriptionTable,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    endpoint: TokioRwLock<Option<AssetEndpoint>>,
    lifecycle: TokioMutex<()>,
    next_asset_id: AtomicU64,
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let task = self
            .dispatcher_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl ManagerShared {
    fn require_connected(&self) -> Result<(), Error> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn ensure_dispatcher(&self) {
        let mut task = self.dispatcher_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let Some(events) = self.events_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let dispatcher = Dispatcher {
            registry: self.registry.clone(),
            responses: self.responses.clone(),
            watchers: self.watchers.clone(),
            connection: self.connection.clone(),
        };
        *task = Some(dispatcher.spawn(events));
    }

    async fn load_descriptors(&self, sources: &[&str]) -> Vec<SubmodelDescriptor> {
        let mut descriptors: Vec<SubmodelDescriptor> = Vec::new();
        for source in sources {
            match self.loader.load(source).await {
                Ok(descriptor) if descriptors.iter().any(|d| d.name() == descriptor.name()) => {
                    log::warn!("Submodel '{}' given twice, keeping the first", descriptor.name());
                }
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => log::error!("Skipping submodel from '{}': {}", short_source(source), e),
            }
        }
        descriptors
    }

    fn build_handle(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        mode: Mode,
        descriptors: Vec<SubmodelDescriptor>,
    ) -> Arc<AssetInner> {
        let ctx = BindContext {
            namespace: namespace.to_string(),
            asset_name: name.to_string(),
            mode,
            transport: self.transport.clone(),
            responses: self.responses.clone(),
            invocation: InvocationSettings {
                default_timeout: self.config.operation_timeout(),
                serialize: self.config.serialize_invocations,
            },
        };
        let submodels: HashMap<String, Arc<SubModel>> = descriptors
            .into_iter()
            .map(|descriptor| {
                let submodel = SubModel::bind(descriptor, &ctx);
                (submodel.name().to_string(), Arc::new(submodel))
            })
            .collect();
        if submodels.is_empty() {
            log::warn!("Handle for {}/{} has no submodels", namespace, name);
        }
        Arc::new(AssetInner {
            id: self.next_asset_id.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.to_string(),
            name: name.to_string(),
            mode,
            submodels,
            released: AtomicBool::new(false),
            manager: Arc::downgrade(self),
            updates: UpdateQueue::default(),
        })
    }

    /// Registers the handle, subscribes what it needs and, for owners,
    /// announces every submodel through `_meta`.
    async fn activate(&self, inner: Arc<AssetInner>) -> Result<Asset, Error> {
        self.registry.register(inner.clone());
        if let Err(e) = self
            .subscriptions
            .acquire(self.transport.as_ref(), &inner.subscriptions())
            .await
        {
            self.registry.unregister(&inner);
            return Err(e);
        }
        if inner.mode == Mode::Owner {
            let source = self.config.endpoint_full_name();
            for submodel in inner.submodels.values() {
                if let Err(e) = submodel.publish_meta(&source).await {
                    self.release_handle(&inner).await?;
                    return Err(e);
                }
            }
        }
        log::info!(
            "{} handle for {} ready with submodels {:?}",
            inner.mode,
            inner.full_name(),
            inner.submodels.keys().collect::<Vec<_>>()
        );
        Ok(Asset::from_inner(inner))
    }

    /// Pushes every owned value out again, for a broker that may have lost
    /// its retained store while we were away.
    async fn republish_owned(&self) {
        for handle in self.registry.all(Mode::Owner) {
            for submodel in handle.submodels.values() {
                for property in submodel.owned_properties() {
                    if let Err(e) = property.republish().await {
                        log::warn!("Could not republish {}: {}", property.get_topic(), e);
                    }
                }
            }
        }
    }

    pub(crate) async fn release_handle(&self, inner: &AssetInner) -> Result<(), Error> {
        if self.registry.unregister(inner) {
            self.subscriptions
                .release(self.transport.as_ref(), &inner.subscriptions())
                .await;
            log::debug!("{} handle for {} released", inner.mode, inner.full_name());
        }
        Ok(())
    }

    async fn collect_metas(&self, filter: &str) -> Result<Vec<InboundMessage>, Error> {
        self.require_connected()?;
        let mut watch = self.watchers.watch(filter);
        let filters = BTreeSet::from([filter.to_string()]);
        self.subscriptions
            .acquire(self.transport.as_ref(), &filters)
            .await?;
        let messages = watch
            .collect_until_quiet(self.config.discovery_grace(), self.config.discovery_max_wait())
            .await;
        self.subscriptions
            .release(self.transport.as_ref(), &filters)
            .await;
        log::debug!("Collected {} _meta message(s) on {}", messages.len(), filter);
        Ok(messages)
    }
}

fn short_source(source: &str) -> &str {
    let trimmed = source.trim();
    match trimmed.char_indices().nth(60) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

/// Entry point of the runtime: owns the broker session, the endpoint asset
/// and every asset handle created through it.
pub struct AssetManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for AssetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetManager")
            .field("client_id", &self.shared.client_id)
            .field("endpoint", &self.shared.config.endpoint_full_name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl AssetManager {
    /// A manager talking MQTT to `config.host:config.port`.
    pub fn new(config: ManagerConfig) -> Result<Self, Error> {
        Self::with_transport(config, Arc::new(MqttTransport::new()))
    }

    pub fn with_transport(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let loader = UrlDescriptorLoader::new(config.descriptor_cache_ttl(), config.accept_invalid_certs)?;
        Ok(Self::with_components(config, transport, Arc::new(loader)))
    }

    pub fn with_components(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        loader: Arc<dyn DescriptorLoader>,
    ) -> Self {
        let client_id = format!(
            "{}/{}-{}",
            config.namespace,
            config.endpoint_name,
            uuid::Uuid::new_v4()
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let responses = Arc::new(ResponseStore::new(config.response_max_age()));
        AssetManager {
            shared: Arc::new(ManagerShared {
                config,
                client_id,
                transport,
                loader,
                registry: Arc::new(AssetRegistry::default()),
                responses,
                watchers: Arc::new(MetaWatchers::default()),
                connection: Arc::new(ConnectionMonitor::default()),
                subscriptions: SubscriptionTable::default(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                dispatcher_task: Mutex::new(None),
                endpoint: TokioRwLock::new(None),
                lifecycle: TokioMutex::new(()),
                next_asset_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn namespace(&self) -> &str {
        &self.shared.config.namespace
    }

    pub fn endpoint_name(&self) -> &str {
        &self.shared.config.endpoint_name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    /// Opens the broker session with the last will `online = false` and, on
    /// first connect, creates the endpoint asset. After a reconnect all
    /// subscriptions are re-established and `online` is asserted again.
    pub async fn connect(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        if shared.connection.is_connected() {
            log::warn!("AssetManager already connected.");
            return Ok(());
        }
        shared.ensure_dispatcher();

        let config = &shared.config;
        let options = ConnectOptions {
            client_id: shared.client_id.clone(),
            host: config.host.clone(),
            port: config.port,
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            last_will: Some(LastWill {
                topic: topic::build([
                    config.namespace.as_str(),
                    config.endpoint_name.as_str(),
                    ENDPOINT_SUBMODEL,
                    ONLINE,
                ]),
                payload: b"false".to_vec(),
                retain: true,
            }),
        };
        shared
            .transport
            .connect(options, shared.events_tx.clone())
            .await?;
        shared.connection.set_connected(true);
        shared
            .subscriptions
            .resubscribe_all(shared.transport.as_ref())
            .await?;

        let existing = shared.endpoint.read().await.clone();
        match existing {
            Some(endpoint) => {
                shared.republish_owned().await;
                endpoint.set_online(true).await?
            }
            None => {
                let descriptor = SubmodelDescriptor::parse(ENDPOINT_SUBMODEL_JSON, INLINE_SOURCE_URL)?;
                let inner = shared.build_handle(
                    &config.namespace,
                    &config.endpoint_name,
                    Mode::Owner,
                    vec![descriptor],
                );
                let asset = shared.activate(inner).await?;
                let endpoint = AssetEndpoint::attach(asset, config.health_interval())?;
                endpoint.set_online(true).await?;
                *shared.endpoint.write().await = Some(endpoint);
            }
        }
        log::info!(
            "AssetManager {} connected to {}:{}",
            config.endpoint_full_name(),
            config.host,
            config.port
        );
        Ok(())
    }

    /// Graceful shutdown: stops the health check, publishes `online = false`
    /// and closes the session. Handles stay valid for a later `connect`.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        if !shared.connection.is_connected() {
            log::warn!("AssetManager already disconnected.");
            return Ok(());
        }
        if let Some(endpoint) = shared.endpoint.read().await.clone() {
            endpoint.stop_health().await;
            if let Err(e) = endpoint.set_online(false).await {
                log::error!("Failed to set endpoint offline: {}", e);
            }
        }
        shared.connection.set_connected(false);
        shared.transport.disconnect().await?;
        log::info!("AssetManager {} disconnected.", shared.config.endpoint_full_name());
        Ok(())
    }

    /// Drops whatever is left of the session and connects again.
    pub async fn reconnect(&self) -> Result<(), Error> {
        {
            let _lifecycle = self.shared.lifecycle.lock().await;
            self.shared.connection.set_connected(false);
            if let Err(e) = self.shared.transport.disconnect().await {
                log::debug!("Ignoring disconnect error before reconnect: {}", e);
            }
        }
        self.connect().await
    }

    /// `listener(reason)` runs when the session ends without `disconnect`.
    /// Nothing reconnects automatically.
    pub fn on_connection_lost<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.connection.add_listener(Arc::new(listener));
    }

    /// The endpoint asset, available once connected.
    pub async fn endpoint(&self) -> Option<AssetEndpoint> {
        self.shared.endpoint.read().await.clone()
    }

    async fn require_endpoint(&self) -> Result<AssetEndpoint, Error> {
        self.endpoint().await.ok_or(Error::NotConnected)
    }

    /// Runs `check` every health interval and publishes its verdict to
    /// `_endpoint/healthy`. An error or panic counts as unhealthy.
    pub async fn set_health_callback<F>(&self, check: F) -> Result<(), Error>
    where
        F: Fn() -> Result<bool, Error> + Send + Sync + 'static,
    {
        let callback: HealthCallback = Arc::new(check);
        self.require_endpoint()
            .await?
            .set_health_callback(Some(callback))
            .await
    }

    /// Stops the health check and clears `_endpoint/healthy`.
    pub async fn clear_health_callback(&self) -> Result<(), Error> {
        self.require_endpoint().await?.set_health_callback(None).await
    }

    /// A `log::Log` implementation forwarding records to `_endpoint/log`.
    /// Must be called from within a tokio runtime.
    pub async fn logging_handler(&self, level: LevelFilter) -> Result<EndpointLogHandler, Error> {
        let endpoint = self.require_endpoint().await?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("no tokio runtime: {}", e)))?;
        Ok(EndpointLogHandler::new(endpoint.log_event()?, level, runtime))
    }

    /// Owner handle in the default namespace. Each source is inline JSON or
    /// a `file://`/`http(s)://` URL; sources that fail to load are skipped.
    pub async fn create_asset(&self, name: &str, sources: &[&str]) -> Result<Asset, Error> {
        self.create_asset_in(&self.shared.config.namespace, name, sources)
            .await
    }

    pub async fn create_asset_in(&self, namespace: &str, name: &str, sources: &[&str]) -> Result<Asset, Error> {
        self.create_handle(namespace, name, Mode::Owner, sources)
            .await
    }

    /// Consumer handle in the default namespace, bound to the given descriptors.
    pub async fn create_asset_proxy(&self, name: &str, sources: &[&str]) -> Result<Asset, Error> {
        self.create_asset_proxy_in(&self.shared.config.namespace, name, sources)
            .await
    }

    pub async fn create_asset_proxy_in(
        &self,
        namespace: &str,
        name: &str,
        sources: &[&str],
    ) -> Result<Asset, Error> {
        self.create_handle(namespace, name, Mode::Consumer, sources)
            .await
    }

    async fn create_handle(&self, namespace: &str, name: &str, mode: Mode, sources: &[&str]) -> Result<Asset, Error> {
        self.shared.require_connected()?;
        for segment in [namespace, name] {
            if !topic::is_valid_name(segment) {
                return Err(Error::InvalidParameter {
                    context: "asset address".to_string(),
                    reason: format!("'{}' cannot be used as an address segment", segment),
                });
            }
        }
        let descriptors = self.shared.load_descriptors(sources).await;
        let inner = self.shared.build_handle(namespace, name, mode, descriptors);
        self.shared.activate(inner).await
    }

    /// Consumer handle bound to every submodel the asset announces through
    /// `_meta`. Fails with `AssetNotFoundError` if nothing is announced.
    pub async fn create_full_asset_proxy(&self, namespace: &str, name: &str) -> Result<Asset, Error> {
        let descriptors = self.supported_submodels(namespace, name).await?;
        if descriptors.is_empty() {
            return Err(Error::AssetNotFoundError {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let inner = self
            .shared
            .build_handle(namespace, name, Mode::Consumer, descriptors);
        self.shared.activate(inner).await
    }

    /// Descriptors announced for `namespace/name`, collected until the
    /// discovery grace period passes without news.
    pub async fn supported_submodels(&self, namespace: &str, name: &str) -> Result<Vec<SubmodelDescriptor>, Error> {
        let filter = discovery::asset_meta_filter(namespace, name);
        let messages = self.shared.collect_metas(&filter).await?;
        Ok(discovery::descriptors_from_metas(&messages))
    }

    /// Full names of announced assets implementing all of `submodel_names`,
    /// in one namespace or (with `None`) across all of them.
    pub async fn query_assets(&self, namespace: Option<&str>, submodel_names: &[&str]) -> Result<Vec<String>, Error> {
        let filter = discovery::namespace_meta_filter(namespace);
        let messages = self.shared.collect_metas(&filter).await?;
        Ok(discovery::assets_from_metas(&messages)
            .into_iter()
            .filter(|(_, submodels)| submodel_names.iter().all(|n| submodels.contains(*n)))
            .map(|(name, _)| name)
            .collect())
    }

    /// Same as [`Asset::release`].
    pub async fn release(&self, asset: &Asset) -> Result<(), Error> {
        asset.release().await
    }
}
