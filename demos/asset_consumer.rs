use assets2036_rt::{Asset, AssetManager, ManagerConfig, Parameters};
use serde_json::json;
use tokio::time::{sleep, Duration};

const BROKER_HOST: &str = "localhost";
const BROKER_PORT: u16 = 1883;
const NAMESPACE: &str = "org_assets2036_example"; // Same namespace as the provider
const ASSET_NAME: &str = "lamp_1";
const ENDPOINT_NAME: &str = "rust_consumer_endpoint";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let manager = AssetManager::new(ManagerConfig::new(BROKER_HOST, BROKER_PORT, NAMESPACE, ENDPOINT_NAME))?;
    manager.on_connection_lost(|reason| log::error!("Broker connection lost: {}", reason));
    manager
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("AssetManager connection failed: {}", e))?;

    let lamps = manager.query_assets(Some(NAMESPACE), &["light"]).await?;
    log::info!("Assets implementing 'light': {:?}", lamps);

    // Built from whatever the provider announces, no local descriptor needed.
    let lamp = manager.create_full_asset_proxy(NAMESPACE, ASSET_NAME).await?;
    log::info!("Proxy for {} with submodels {:?}", lamp.full_name(), lamp.submodel_names());

    let light = lamp.submodel("light")?;
    light.event("light_switched")?.on_event(|_, message| {
        log::info!(
            "'light_switched' at {}: {:?}",
            message.timestamp,
            message.param_bool("new_state")
        );
    })?;
    let light_on = light.property("light_on")?;
    light_on.on_change(|_, old, new| log::info!("'light_on' changed from {} to {}", old, new))?;
    log::info!("Current 'light_on': {:?}", light_on.value_bool().await?);

    let endpoint = lamp_endpoint(&lamp, &manager).await?;
    let ping = endpoint.submodel("_endpoint")?.operation("ping")?;
    ping.invoke(Parameters::new()).await?;
    log::info!("Provider endpoint answered ping.");

    let switch_light = light.operation("switch_light")?;
    let mut target = true;
    for _ in 0..5 {
        let mut params = Parameters::new();
        params.insert("state".to_string(), json!(target));
        match switch_light.invoke(params).await {
            Ok(response) => log::info!("'switch_light({})' answered {}", target, response),
            Err(e) => log::error!("'switch_light({})' failed: {}", target, e),
        }
        target = !target;
        sleep(Duration::from_secs(2)).await;
        log::info!("Polled 'light_on': {:?}", light_on.value_bool().await?);
    }

    lamp.release().await?;
    endpoint.release().await?;
    manager.disconnect().await?;
    Ok(())
}

/// The provider's `_endpoint`, named by the `source` of an announced `_meta`.
async fn lamp_endpoint(lamp: &Asset, manager: &AssetManager) -> Result<Asset, anyhow::Error> {
    let meta_property = lamp.submodel("light")?.meta_property();
    // The retained `_meta` arrives shortly after the proxy subscribes.
    let mut meta = meta_property.get_value().await?;
    for _ in 0..20 {
        if !meta.is_null() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
        meta = meta_property.get_value().await?;
    }
    let source = meta["source"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("{} has no announced source", lamp.full_name()))?;
    let (namespace, name) = source
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("malformed source '{}'", source))?;
    Ok(manager.create_full_asset_proxy(namespace, name).await?)
}
