use crate::definition::{validate_value, PropertyDefinition};
use crate::transport::Transport;
use crate::{Error, Mode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex as TokioMutex;

pub type PropertyListener = Arc<dyn Fn(&Property, &Value, &Value) + Send + Sync>;

#[derive(Debug, Default)]
struct PropertyState {
    value: Value,
    /// Serialized form of the last value that went out, owner side only.
    last_published: Option<String>,
}

/// A retained, replicated value. The owner writes it, consumers observe it.
pub struct Property {
    name: String,
    topic: String,
    definition: PropertyDefinition,
    mode: Mode,
    transport: Arc<dyn Transport>,
    state: TokioMutex<PropertyState>,
    listeners: RwLock<Vec<PropertyListener>>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl Property {
    pub(crate) fn new(
        name: &str,
        definition: PropertyDefinition,
        mode: Mode,
        transport: Arc<dyn Transport>,
        parent_topic: &str,
    ) -> Self {
        Property {
            name: name.to_string(),
            topic: format!("{}/{}", parent_topic, name),
            definition,
            mode,
            transport,
            state: TokioMutex::new(PropertyState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_topic(&self) -> &str {
        &self.topic
    }

    pub fn definition(&self) -> &PropertyDefinition {
        &self.definition
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn require(&self, mode: Mode, action: &'static str) -> Result<(), Error> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(Error::WrongMode {
                element: self.topic.clone(),
                action,
                mode: self.mode,
            })
        }
    }

    /// Owner only. Publishes the value retained unless it serializes exactly
    /// like the last published one. `Value::Null` clears the retained value.
    pub async fn set_value(&self, new_value: Value) -> Result<(), Error> {
        self.require(Mode::Owner, "write")?;
        if !new_value.is_null() {
            validate_value(&new_value, &self.definition).map_err(|e| Error::InvalidParameter {
                context: self.topic.clone(),
                reason: e.to_string(),
            })?;
        }
        let serialized = serde_json::to_string(&new_value)?;
        let mut state = self.state.lock().await;
        state.value = new_value.clone();
        if state.last_published.as_deref() == Some(serialized.as_str()) {
            log::trace!("Property {} unchanged, not republished", self.topic);
            return Ok(());
        }
        let payload = if new_value.is_null() {
            Vec::new()
        } else {
            serialized.clone().into_bytes()
        };
        self.transport.publish(&self.topic, payload, true).await?;
        state.last_published = Some(serialized);
        Ok(())
    }

    /// Removes the retained value from the broker.
    pub async fn clear(&self) -> Result<(), Error> {
        self.set_value(Value::Null).await
    }

    /// Consumer only. The last value seen from the broker, `Null` if none.
    pub async fn get_value(&self) -> Result<Value, Error> {
        self.require(Mode::Consumer, "read")?;
        Ok(self.state.lock().await.value.clone())
    }

    /// `None` when the property is unset.
    pub async fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        let value = self.get_value().await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn value_i64(&self) -> Result<Option<i64>, Error> {
        Ok(self.get_value().await?.as_i64())
    }

    pub async fn value_f64(&self) -> Result<Option<f64>, Error> {
        Ok(self.get_value().await?.as_f64())
    }

    pub async fn value_bool(&self) -> Result<Option<bool>, Error> {
        Ok(self.get_value().await?.as_bool())
    }

    pub async fn value_string(&self) -> Result<Option<String>, Error> {
        Ok(self.get_value().await?.as_str().map(str::to_string))
    }

    /// Consumer only. `listener(property, old, new)` runs on every change,
    /// in registration order.
    pub fn on_change<F>(&self, listener: F) -> Result<(), Error>
    where
        F: Fn(&Property, &Value, &Value) + Send + Sync + 'static,
    {
        self.require(Mode::Consumer, "observe")?;
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
        Ok(())
    }

    /// Publishes the current value again regardless of what went out before.
    pub(crate) async fn republish(&self) -> Result<(), Error> {
        let value = {
            let mut state = self.state.lock().await;
            state.last_published = None;
            state.value.clone()
        };
        if value.is_null() {
            return Ok(());
        }
        self.set_value(value).await
    }

    /// Applies an inbound payload. An empty payload means the retained value
    /// was cleared. Listeners only run if the value actually changed, and they
    /// run on the blocking pool so a slow one cannot hold up the caller's
    /// runtime thread.
    pub(crate) async fn apply_remote(self: &Arc<Self>, payload: &[u8]) -> Result<bool, Error> {
        let new_value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice::<Value>(payload)?
        };
        let old_value = {
            let mut state = self.state.lock().await;
            if state.value == new_value {
                return Ok(false);
            }
            std::mem::replace(&mut state.value, new_value.clone())
        };
        let property = self.clone();
        let notified = tokio::task::spawn_blocking(move || property.notify(&old_value, &new_value)).await;
        if let Err(e) = notified {
            log::error!("Change listeners on {} did not finish: {}", self.topic, e);
        }
        Ok(true)
    }

    fn notify(&self, old_value: &Value, new_value: &Value) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(self, old_value, new_value)));
            if outcome.is_err() {
                log::error!("Change listener on {} panicked", self.topic);
            }
        }
    }
}
