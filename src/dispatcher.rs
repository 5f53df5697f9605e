use crate::asset::{AssetInner, AssetRegistry};
use crate::correlation::{OperationResponse, ResponseStore};
use crate::discovery::MetaWatchers;
use crate::topic::{MessageKind, Topic};
use crate::transport::{InboundMessage, TransportEvent};
use crate::Mode;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ConnectionLostListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Connected flag plus the listeners told when the broker session drops.
#[derive(Default)]
pub(crate) struct ConnectionMonitor {
    connected: AtomicBool,
    listeners: RwLock<Vec<ConnectionLostListener>>,
}

impl ConnectionMonitor {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn add_listener(&self, listener: ConnectionLostListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn connection_lost(&self, reason: &str) {
        self.set_connected(false);
        log::error!("Connection to broker lost: {}", reason);
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(reason))).is_err() {
                log::error!("Connection-lost listener panicked");
            }
        }
    }
}

/// Routes inbound messages to the handles registered for their asset.
///
/// Messages are taken off the stream one at a time. Responses are handed to
/// their waiting caller right here. Operation requests run in their own
/// tasks, and element updates go to a per-handle queue, so neither a provider
/// callback nor a listener holds up the stream. Two updates for the same
/// address still reach a handle in broker order.
pub(crate) struct Dispatcher {
    pub registry: Arc<AssetRegistry>,
    pub responses: Arc<ResponseStore>,
    pub watchers: Arc<MetaWatchers>,
    pub connection: Arc<ConnectionMonitor>,
}

impl Dispatcher {
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::debug!("Dispatcher started.");
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(message) => self.dispatch(message),
                    TransportEvent::ConnectionLost(reason) => self.connection.connection_lost(&reason),
                }
            }
            log::debug!("Dispatcher stopped.");
        })
    }

    pub fn dispatch(&self, message: InboundMessage) {
        if !self.watchers.is_empty() {
            self.watchers.offer(&message);
        }
        let address = match Topic::parse(&message.topic) {
            Ok(address) => address,
            Err(e) => {
                log::debug!("Dropping message: {}", e);
                return;
            }
        };
        match address.kind() {
            MessageKind::OperationRequest => self.dispatch_request(&address, message.payload),
            MessageKind::OperationResponse => self.dispatch_response(&address, &message.payload),
            MessageKind::ElementUpdate => self.dispatch_update(address, message.payload),
        }
    }

    fn dispatch_request(&self, address: &Topic, payload: Vec<u8>) {
        let handles = self.registry.handles(Mode::Owner, &address.full_asset_name());
        if handles.is_empty() {
            log::debug!("No owner for request on {}", address);
        }
        for handle in handles {
            let Some(operation) = operation_of(&handle, address) else {
                log::warn!("Request for unknown operation {}", address);
                continue;
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = operation.handle_request(&payload).await {
                    log::error!("Request on {} not answered: {}", operation.get_topic(), e);
                }
            });
        }
    }

    fn dispatch_response(&self, address: &Topic, payload: &[u8]) {
        let response: OperationResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Malformed response on {}: {}", address, e);
                return;
            }
        };
        let req_id = response.req_id.clone();
        if !self.responses.deliver(response) {
            log::debug!("No pending call for req_id {} on {}", req_id, address);
        }
        let evicted = self.responses.evict_expired();
        if evicted > 0 {
            log::debug!("Evicted {} stale pending call(s)", evicted);
        }
    }

    fn dispatch_update(&self, address: Topic, payload: Vec<u8>) {
        for handle in self.registry.handles(Mode::Consumer, &address.full_asset_name()) {
            UpdateQueue::push(
                &handle,
                ElementUpdate {
                    address: address.clone(),
                    payload: payload.clone(),
                },
            );
        }
    }
}

struct ElementUpdate {
    address: Topic,
    payload: Vec<u8>,
}

/// Inbound element updates for one consumer handle. A worker task, started
/// on first use, applies them in arrival order and ends with the handle.
#[derive(Default)]
pub(crate) struct UpdateQueue {
    sender: OnceLock<mpsc::UnboundedSender<ElementUpdate>>,
}

impl UpdateQueue {
    fn push(handle: &Arc<AssetInner>, update: ElementUpdate) {
        let sender = handle
            .updates
            .sender
            .get_or_init(|| spawn_update_worker(Arc::downgrade(handle)));
        if sender.send(update).is_err() {
            log::debug!("Update worker for {} is gone", handle.full_name());
        }
    }
}

fn spawn_update_worker(handle: Weak<AssetInner>) -> mpsc::UnboundedSender<ElementUpdate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ElementUpdate>();
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let Some(handle) = handle.upgrade() else {
                break;
            };
            if handle.released.load(Ordering::SeqCst) {
                continue;
            }
            apply_update(&handle, &update).await;
        }
    });
    tx
}

async fn apply_update(handle: &AssetInner, update: &ElementUpdate) {
    let address = &update.address;
    let Some(submodel) = handle.submodels.get(&address.submodel) else {
        return;
    };
    if let Some(property) = submodel.get_property(&address.element) {
        match property.apply_remote(&update.payload).await {
            Ok(true) => log::trace!("{} updated", address),
            Ok(false) => {}
            Err(e) => log::warn!("Bad value on {}: {}", address, e),
        }
    } else if let Some(event) = submodel.get_event(&address.element) {
        if let Err(e) = event.apply_remote(&update.payload).await {
            log::warn!("Bad emission on {}: {}", address, e);
        }
    } else {
        log::debug!("No element for {}", address);
    }
}

fn operation_of(handle: &AssetInner, address: &Topic) -> Option<Arc<crate::operation::Operation>> {
    handle
        .submodels
        .get(&address.submodel)
        .and_then(|sm| sm.get_operation(&address.element))
}
