use crate::correlation::Parameters;
use crate::definition::{validate_parameters, EventDefinition};
use crate::transport::Transport;
use crate::{Error, Mode};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

/// Payload of an event emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(serialize_with = "write_timestamp", deserialize_with = "read_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub params: Parameters,
}

impl EventMessage {
    pub fn now(params: Parameters) -> Self {
        EventMessage {
            timestamp: Utc::now(),
            params,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn param_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.params
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(Value::as_i64)
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(Value::as_f64)
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(Value::as_bool)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

fn write_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Millis(i64),
}

// Peers differ: RFC 3339, ISO-8601 without zone (taken as UTC), epoch millis.
fn read_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    use serde::de::Error as _;
    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Text(text) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
                return Ok(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|e| D::Error::custom(format!("bad timestamp '{}': {}", text, e)))
        }
        RawTimestamp::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp {} out of range", ms))),
    }
}

pub type EventListener = Arc<dyn Fn(&Event, &EventMessage) + Send + Sync>;

/// A non-retained notification. The owner emits, consumers listen.
pub struct Event {
    name: String,
    topic: String,
    definition: EventDefinition,
    mode: Mode,
    transport: Arc<dyn Transport>,
    listeners: RwLock<Vec<EventListener>>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Event {
    pub(crate) fn new(
        name: &str,
        definition: EventDefinition,
        mode: Mode,
        transport: Arc<dyn Transport>,
        parent_topic: &str,
    ) -> Self {
        Event {
            name: name.to_string(),
            topic: format!("{}/{}", parent_topic, name),
            definition,
            mode,
            transport,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_topic(&self) -> &str {
        &self.topic
    }

    pub fn definition(&self) -> &EventDefinition {
        &self.definition
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn emit(&self, params: Parameters) -> Result<(), Error> {
        if self.mode != Mode::Owner {
            return Err(Error::WrongMode {
                element: self.topic.clone(),
                action: "emit",
                mode: self.mode,
            });
        }
        validate_parameters(&self.topic, &params, self.definition.parameters.as_ref())?;
        let payload = serde_json::to_vec(&EventMessage::now(params))?;
        self.transport.publish(&self.topic, payload, false).await?;
        log::debug!("Event '{}' emitted on {}", self.name, self.topic);
        Ok(())
    }

    pub fn on_event<F>(&self, listener: F) -> Result<(), Error>
    where
        F: Fn(&Event, &EventMessage) + Send + Sync + 'static,
    {
        if self.mode != Mode::Consumer {
            return Err(Error::WrongMode {
                element: self.topic.clone(),
                action: "listen to",
                mode: self.mode,
            });
        }
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
        Ok(())
    }

    /// Delivers an inbound emission to the listeners, on the blocking pool.
    pub(crate) async fn apply_remote(self: &Arc<Self>, payload: &[u8]) -> Result<(), Error> {
        let message: EventMessage = serde_json::from_slice(payload)?;
        let event = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || event.notify(&message)).await {
            log::error!("Event listeners on {} did not finish: {}", self.topic, e);
        }
        Ok(())
    }

    fn notify(&self, message: &EventMessage) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(self, message))).is_err() {
                log::error!("Event listener on {} panicked", self.topic);
            }
        }
    }
}
