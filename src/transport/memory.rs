//! An in-process broker with just enough MQTT semantics for the runtime:
//! retained messages, `+`/`#` filters, last-will and unclean session loss.
//! Several [`MemoryTransport`]s attached to one [`InMemoryBroker`] behave like
//! separate processes talking through a real broker.

use super::{ConnectOptions, EventSink, InboundMessage, LastWill, Transport, TransportEvent};
use crate::topic;
use crate::Error;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// One message as it reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct Session {
    client_id: String,
    filters: HashSet<String>,
    sink: EventSink,
    will: Option<LastWill>,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    log: Vec<PublishRecord>,
}

impl BrokerState {
    fn route(&mut self, client_id: &str, topic: &str, payload: Vec<u8>, retain: bool) {
        self.log.push(PublishRecord {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }
        for session in self.sessions.values() {
            if session.filters.iter().any(|f| topic::matches(f, topic)) {
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    retain: false,
                };
                let _ = session.sink.send(TransportEvent::Message(message));
            }
        }
    }
}

/// Test double for a real broker. Every publish is kept in a log for
/// inspection until [`InMemoryBroker::clear_published`] is called, so it is
/// not meant for long-running use.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryBroker")
            .field("sessions", &state.sessions.len())
            .field("retained", &state.retained.len())
            .field("published", &state.log.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new, unconnected client of this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Publishes as an anonymous client, e.g. to inject foreign traffic.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        self.lock().route("", topic, payload.into(), retain);
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.lock().log.clone()
    }

    /// Forgets the publish log. Retained values and sessions are kept.
    pub fn clear_published(&self) {
        self.lock().log.clear();
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishRecord> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// A client that is already connected, with the receiving end of its sink.
    pub async fn connected_transport(
        &self,
        client_id: &str,
    ) -> Result<(Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>), Error> {
        let transport = Arc::new(self.transport());
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ConnectOptions {
            client_id: client_id.to_string(),
            host: "memory".to_string(),
            port: 0,
            keep_alive: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            last_will: None,
        };
        transport.connect(options, tx).await?;
        Ok((transport, rx))
    }
}

/// A client session on an [`InMemoryBroker`].
pub struct MemoryTransport {
    broker: InMemoryBroker,
    session: Mutex<Option<u64>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("session", &self.session_id())
            .finish()
    }
}

impl MemoryTransport {
    fn session_id(&self) -> Option<u64> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_session(&self) -> Result<u64, Error> {
        self.session_id().ok_or(Error::NotConnected)
    }

    /// Ends the session the way a dropped network link would: the broker
    /// publishes the last will and the client is told the connection is lost.
    pub fn simulate_connection_loss(&self, reason: &str) {
        let Some(id) = self.session.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let mut state = self.broker.lock();
        if let Some(session) = state.sessions.remove(&id) {
            if let Some(will) = session.will {
                state.route(&session.client_id, &will.topic, will.payload, will.retain);
            }
            let _ = session
                .sink
                .send(TransportEvent::ConnectionLost(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: ConnectOptions, sink: EventSink) -> Result<(), Error> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            log::warn!("In-memory session already open, connect ignored.");
            return Ok(());
        }
        let mut state = self.broker.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                client_id: options.client_id,
                filters: HashSet::new(),
                sink,
                will: options.last_will,
            },
        );
        *session = Some(id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Some(id) = self.session.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.broker.lock().sessions.remove(&id);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Error> {
        let id = self.require_session()?;
        let mut state = self.broker.lock();
        let client_id = state
            .sessions
            .get(&id)
            .map(|s| s.client_id.clone())
            .ok_or(Error::NotConnected)?;
        state.route(&client_id, topic, payload, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        let id = self.require_session()?;
        let mut state = self.broker.lock();
        let BrokerState {
            retained, sessions, ..
        } = &mut *state;
        let session = sessions.get_mut(&id).ok_or(Error::NotConnected)?;
        session.filters.insert(filter.to_string());
        // Retained messages are replayed on every subscribe, as a broker does.
        for (topic, payload) in retained.iter() {
            if topic::matches(filter, topic) {
                let message = InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retain: true,
                };
                let _ = session.sink.send(TransportEvent::Message(message));
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        let id = self.require_session()?;
        if let Some(session) = self.broker.lock().sessions.get_mut(&id) {
            session.filters.remove(filter);
        }
        Ok(())
    }
}
