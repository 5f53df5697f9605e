use crate::event::Event;
use crate::Parameters;
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Handle;

/// A logging handler that forwards log records to the endpoint's `log` event.
///
/// This struct implements the `log::Log` trait. Once installed with
/// `log::set_boxed_logger`, every record at or above `level` is formatted and
/// emitted as `{"entry": "<record>"}` on `namespace/endpoint/_endpoint/log`.
///
/// Records whose target belongs to this crate are dropped: emitting an event
/// logs through the crate, which would otherwise feed back into the handler.
#[derive(Debug, Clone)]
pub struct EndpointLogHandler {
    log_event: Arc<Event>,
    level: LevelFilter,
    runtime: Handle,
}

impl EndpointLogHandler {
    pub(crate) fn new(log_event: Arc<Event>, level: LevelFilter, runtime: Handle) -> Self {
        EndpointLogHandler {
            log_event,
            level,
            runtime,
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

fn is_own_target(target: &str) -> bool {
    target == env!("CARGO_CRATE_NAME") || target.starts_with(concat!(env!("CARGO_CRATE_NAME"), "::"))
}

impl log::Log for EndpointLogHandler {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && !is_own_target(metadata.target())
    }

    /// Emission happens on the runtime captured at construction, so this can
    /// be called from any thread. Failures go to `stderr`; reporting them
    /// through `log` would recurse.
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = format!(
            "[{level} {target}] {args}",
            level = record.level(),
            target = record.target(),
            args = record.args()
        );
        let mut params = Parameters::new();
        params.insert("entry".to_string(), json!(entry));

        let event = Arc::clone(&self.log_event);
        self.runtime.spawn(async move {
            if let Err(e) = event.emit(params).await {
                eprintln!("Failed to forward log entry to {}: {}", event.get_topic(), e);
            }
        });
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::EventDefinition;
    use crate::event::EventMessage;
    use crate::transport::InMemoryBroker;
    use crate::Mode;
    use log::{Level, Log};
    use std::time::Duration;

    #[test]
    fn own_targets_are_recognised() {
        assert!(is_own_target("assets2036_rt"));
        assert!(is_own_target("assets2036_rt::operation"));
        assert!(!is_own_target("assets2036_rt_extra"));
        assert!(!is_own_target("my_app"));
    }

    #[tokio::test]
    async fn forwards_records_as_log_events() {
        let broker = InMemoryBroker::new();
        let (transport, _rx) = broker.connected_transport("ep").await.unwrap();
        let definition: EventDefinition =
            serde_json::from_value(json!({"parameters": {"entry": {"type": "string"}}})).unwrap();
        let event = Arc::new(Event::new("log", definition, Mode::Owner, transport, "ns/ep/_endpoint"));
        let handler = EndpointLogHandler::new(event, LevelFilter::Info, Handle::current());

        handler.log(
            &Record::builder()
                .level(Level::Warn)
                .target("my_app")
                .args(format_args!("disk almost full"))
                .build(),
        );
        handler.log(
            &Record::builder()
                .level(Level::Debug)
                .target("my_app")
                .args(format_args!("too chatty"))
                .build(),
        );
        handler.log(
            &Record::builder()
                .level(Level::Error)
                .target("assets2036_rt::property")
                .args(format_args!("internal"))
                .build(),
        );

        for _ in 0..50 {
            if !broker.published_to("ns/ep/_endpoint/log").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let records = broker.published_to("ns/ep/_endpoint/log");
        assert_eq!(records.len(), 1);
        let message: EventMessage = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(message.param_str("entry"), Some("[WARN my_app] disk almost full"));
    }
}
