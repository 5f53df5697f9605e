//! Client runtime for the assets2036 asset model.
//!
//! Assets are named `namespace/asset` and expose submodels of properties,
//! operations and events over MQTT. An [`AssetManager`] connects to the
//! broker, announces this process as an `_endpoint` asset and hands out
//! [`Asset`] handles, either as owner (implementing the asset) or as
//! consumer (mirroring a remote one).
//!
//! ```no_run
//! use assets2036_rt::{AssetManager, ManagerConfig, Parameters};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), assets2036_rt::Error> {
//! let manager = AssetManager::new(ManagerConfig::new("localhost", 1883, "demo", "calculator"))?;
//! manager.connect().await?;
//!
//! let math = r#"{"name": "math", "operations": {"square": {
//!     "parameters": {"x": {"type": "number"}}, "response": {"type": "number"}}}}"#;
//! let owner = manager.create_asset("calc", &[math]).await?;
//! owner.submodel("math")?.operation("square")?.bind(|req| {
//!     let x = req.param_f64("x").unwrap_or_default();
//!     Ok(json!(x * x))
//! })?;
//!
//! let proxy = manager.create_full_asset_proxy("demo", "calc").await?;
//! let mut params = Parameters::new();
//! params.insert("x".to_string(), json!(7));
//! let squared = proxy.submodel("math")?.operation("square")?.invoke(params).await?;
//! assert_eq!(squared, json!(49.0));
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod config;
pub mod correlation;
pub mod definition;
mod discovery;
mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod loader;
pub mod logging;
mod manager;
pub mod operation;
pub mod property;
pub mod submodel;
mod subscriptions;
pub mod topic;
pub mod transport;

pub use asset::{Asset, Mode};
pub use config::{
    ManagerConfig, DEFAULT_DESCRIPTOR_CACHE_TTL_SECS, DEFAULT_DISCOVERY_GRACE_MS, DEFAULT_HEALTH_INTERVAL_MS,
    DEFAULT_OPERATION_TIMEOUT_MS,
};
pub use correlation::{OperationRequest, OperationResponse, Parameters};
pub use definition::{
    validate_value, EventDefinition, MetaDescriptor, OperationDefinition, PropertyDefinition, PropertyType,
    SubModelDefinition, SubmodelDescriptor,
};
pub use dispatcher::ConnectionLostListener;
pub use endpoint::{AssetEndpoint, HealthCallback};
pub use error::Error;
pub use event::{Event, EventListener, EventMessage};
pub use loader::{DescriptorLoader, UrlDescriptorLoader};
pub use logging::EndpointLogHandler;
pub use manager::AssetManager;
pub use operation::{Operation, OperationCallback};
pub use property::{Property, PropertyListener};
pub use submodel::SubModel;
pub use transport::{InMemoryBroker, MemoryTransport, MqttTransport, Transport};
