use assets2036_rt::{AssetManager, Error, ManagerConfig, Parameters};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};

const BROKER_HOST: &str = "localhost";
const BROKER_PORT: u16 = 1883;
const NAMESPACE: &str = "org_assets2036_example";
const ASSET_NAME: &str = "lamp_1";
const ENDPOINT_NAME: &str = "rust_provider_endpoint";

const LIGHT_SUBMODEL_JSON: &str = r#"
{
    "name": "light",
    "rev": "1.0.0",
    "properties": {
        "light_on": {
            "type": "boolean",
            "description": "Current state of the light (on/off)",
            "readOnly": true
        }
    },
    "operations": {
        "switch_light": {
            "description": "Switches the light on or off",
            "parameters": {
                "state": {"type": "boolean"}
            },
            "response": {"type": "boolean"}
        }
    },
    "events": {
        "light_switched": {
            "description": "Emitted when the light state changes",
            "parameters": {
                "new_state": {"type": "boolean"}
            }
        }
    }
}
"#;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // With `--forward-logs` application logs go to `_endpoint/log` instead of stderr.
    let forward_logs = std::env::args().any(|a| a == "--forward-logs");
    if !forward_logs {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = ManagerConfig::new(BROKER_HOST, BROKER_PORT, NAMESPACE, ENDPOINT_NAME);
    let manager = AssetManager::new(config)?;
    manager
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("AssetManager connection failed: {}", e))?;
    log::info!("Connected to {}:{} as {}/{}", BROKER_HOST, BROKER_PORT, NAMESPACE, ENDPOINT_NAME);

    if forward_logs {
        let handler = manager.logging_handler(log::LevelFilter::Info).await?;
        log::set_logger(Box::leak(Box::new(handler))).map_err(|e| anyhow::anyhow!("{}", e))?;
        log::set_max_level(log::LevelFilter::Info);
    }

    let lamp = manager.create_asset(ASSET_NAME, &[LIGHT_SUBMODEL_JSON]).await?;
    let light = lamp.submodel("light")?;
    let light_on = light.property("light_on")?;
    let light_switched = light.event("light_switched")?;
    light_on.set_value(json!(false)).await?;

    let is_on = AtomicBool::new(false);
    light.operation("switch_light")?.bind(move |req| {
        let new_state = req.param_bool("state").ok_or_else(|| Error::InvalidParameter {
            context: "switch_light".to_string(),
            reason: "'state' must be a boolean".to_string(),
        })?;
        if is_on.swap(new_state, Ordering::SeqCst) != new_state {
            log::info!("Light is now {}", if new_state { "ON" } else { "OFF" });
            let light_on = light_on.clone();
            let light_switched = light_switched.clone();
            tokio::spawn(async move {
                if let Err(e) = light_on.set_value(json!(new_state)).await {
                    log::error!("Failed to set 'light_on': {}", e);
                }
                let mut params = Parameters::new();
                params.insert("new_state".to_string(), Value::Bool(new_state));
                if let Err(e) = light_switched.emit(params).await {
                    log::error!("Failed to emit 'light_switched': {}", e);
                }
            });
        }
        Ok(json!(new_state))
    })?;

    manager.set_health_callback(|| Ok(true)).await?;

    let endpoint = manager.endpoint().await.ok_or(Error::NotConnected)?;
    endpoint.on_shutdown(|| log::warn!("Remote shutdown requested, press Ctrl+C to stop."));
    endpoint.log(&format!("{} ready", lamp.full_name())).await?;

    log::info!("Asset provider '{}' is running. Press Ctrl+C to exit.", ASSET_NAME);
    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl+C received, shutting down...");

    manager.clear_health_callback().await?;
    lamp.release().await?;
    manager.disconnect().await?;
    Ok(())
}
