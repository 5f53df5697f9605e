//! The publish/subscribe seam. The runtime only needs a handful of primitives
//! from a broker client; inbound traffic is pushed into an [`EventSink`].

pub mod memory;
pub mod mqtt;

use crate::Error;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::{InMemoryBroker, MemoryTransport, PublishRecord};
pub use mqtt::MqttTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The session ended without a call to `disconnect`.
    ConnectionLost(String),
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Message the broker publishes on our behalf if the session dies uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub last_will: Option<LastWill>,
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Opens a session. Every inbound message and a lost connection are
    /// reported to `sink`, in broker order.
    async fn connect(&self, options: ConnectOptions, sink: EventSink) -> Result<(), Error>;
    async fn disconnect(&self) -> Result<(), Error>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Error>;
    async fn subscribe(&self, filter: &str) -> Result<(), Error>;
    async fn unsubscribe(&self, filter: &str) -> Result<(), Error>;
}
