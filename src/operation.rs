use crate::correlation::{OperationRequest, OperationResponse, Parameters, ResponseStore};
use crate::definition::{validate_parameters, validate_value, OperationDefinition};
use crate::transport::Transport;
use crate::{topic, Error, Mode};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

/// Provider side handler. Returning `Err` (or panicking) sends no reply.
pub type OperationCallback = Arc<dyn Fn(&OperationRequest) -> Result<Value, Error> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct InvocationSettings {
    pub default_timeout: Duration,
    pub serialize: bool,
}

/// A remote procedure. Consumers invoke it, the owner binds the callback
/// that answers.
pub struct Operation {
    name: String,
    topic: String,
    request_topic: String,
    response_topic: String,
    definition: OperationDefinition,
    mode: Mode,
    transport: Arc<dyn Transport>,
    responses: Arc<ResponseStore>,
    callback: RwLock<Option<OperationCallback>>,
    call_lock: TokioMutex<()>,
    settings: InvocationSettings,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub(crate) fn new(
        name: &str,
        definition: OperationDefinition,
        mode: Mode,
        transport: Arc<dyn Transport>,
        responses: Arc<ResponseStore>,
        settings: InvocationSettings,
        parent_topic: &str,
    ) -> Self {
        let topic = format!("{}/{}", parent_topic, name);
        Operation {
            name: name.to_string(),
            request_topic: topic::build([topic.as_str(), topic::REQUEST_SUFFIX]),
            response_topic: topic::build([topic.as_str(), topic::RESPONSE_SUFFIX]),
            topic,
            definition,
            mode,
            transport,
            responses,
            callback: RwLock::new(None),
            call_lock: TokioMutex::new(()),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_topic(&self) -> &str {
        &self.topic
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    pub fn definition(&self) -> &OperationDefinition {
        &self.definition
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn wrong_mode(&self, action: &'static str) -> Error {
        Error::WrongMode {
            element: self.topic.clone(),
            action,
            mode: self.mode,
        }
    }

    /// Owner only. Replaces any previously bound callback.
    pub fn bind<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&OperationRequest) -> Result<Value, Error> + Send + Sync + 'static,
    {
        if self.mode != Mode::Owner {
            return Err(self.wrong_mode("bind"));
        }
        let previous = self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(callback));
        if previous.is_some() {
            log::debug!("Replaced callback of {}", self.topic);
        }
        Ok(())
    }

    pub fn unbind(&self) {
        self.callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_bound(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether a local call currently holds this operation's call lock.
    pub fn invocation_running(&self) -> bool {
        self.call_lock.try_lock().is_err()
    }

    /// Consumer only. Uses the configured default timeout.
    pub async fn invoke(&self, params: Parameters) -> Result<Value, Error> {
        self.invoke_with_timeout(params, self.settings.default_timeout)
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        params: Parameters,
        timeout: Duration,
    ) -> Result<Value, Error> {
        if self.mode != Mode::Consumer {
            return Err(self.wrong_mode("invoke"));
        }
        validate_parameters(&self.topic, &params, self.definition.parameters.as_ref())?;
        let _serialized = if self.settings.serialize {
            Some(self.call_lock.lock().await)
        } else {
            None
        };

        let request = OperationRequest {
            req_id: Uuid::new_v4().to_string(),
            params,
        };
        let pending = self.responses.register(&request.req_id);
        let payload = serde_json::to_vec(&request)?;
        self.transport
            .publish(&self.request_topic, payload, false)
            .await?;
        log::debug!("Invoked {} (req_id {})", self.topic, request.req_id);

        let Some(response) = pending.wait(timeout).await else {
            return Err(Error::OperationTimeoutError {
                operation: self.topic.clone(),
                timeout_ms: whole_millis(timeout),
            });
        };
        if let Some(resp_def) = self.definition.response.as_ref() {
            if !response.resp.is_null() {
                if let Err(e) = validate_value(&response.resp, resp_def) {
                    log::warn!("Response of {} does not match its definition: {}", self.topic, e);
                }
            }
        }
        Ok(response.resp)
    }

    /// Runs the bound callback for an inbound request and publishes the reply.
    pub(crate) async fn handle_request(&self, payload: &[u8]) -> Result<(), Error> {
        let request: OperationRequest = serde_json::from_slice(payload)?;
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            log::debug!("No callback bound for {}, request {} ignored", self.topic, request.req_id);
            return Ok(());
        };
        let req_id = request.req_id.clone();
        let outcome = tokio::task::spawn_blocking(move || callback(&request)).await;
        let resp = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Err(Error::OperationFailed(format!(
                    "{} (req_id {}): {}",
                    self.topic, req_id, e
                )))
            }
            Err(join_error) => {
                return Err(Error::OperationFailed(format!(
                    "{} (req_id {}) panicked: {}",
                    self.topic, req_id, join_error
                )))
            }
        };
        let response = OperationResponse { req_id, resp };
        self.transport
            .publish(&self.response_topic, serde_json::to_vec(&response)?, false)
            .await
    }
}

/// Saturates instead of truncating for timeouts beyond `u64::MAX` ms.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
