use super::{ConnectOptions, EventSink, InboundMessage, Transport, TransportEvent};
use crate::Error;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event as MqttEvent, MqttOptions, Packet, QoS};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock as TokioRwLock};
use tokio::task::JoinHandle;

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// [`Transport`] backed by a `rumqttc` client. Messages are exchanged with
/// QoS 1. There is no automatic reconnect: when the event loop fails the sink
/// receives `ConnectionLost` once and the loop stops.
pub struct MqttTransport {
    client: TokioRwLock<Option<AsyncClient>>,
    event_loop_task: TokioRwLock<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    qos: QoS,
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field(
                "client_present",
                &self.client.try_read().map(|c| c.is_some()).ok(),
            )
            .field("qos", &self.qos)
            .finish()
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        MqttTransport {
            client: TokioRwLock::new(None),
            event_loop_task: TokioRwLock::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            qos: QoS::AtLeastOnce,
        }
    }

    async fn connected_client(&self) -> Result<AsyncClient, Error> {
        self.client.read().await.clone().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: ConnectOptions, sink: EventSink) -> Result<(), Error> {
        let mut client_guard = self.client.write().await;
        let mut task_guard = self.event_loop_task.write().await;
        if let Some(task) = task_guard.as_ref() {
            if !task.is_finished() {
                log::warn!("MQTT event loop already running, connect ignored.");
                return Ok(());
            }
        }

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
        mqtt_options.set_clean_session(true);
        if let Some(will) = options.last_will.clone() {
            mqtt_options.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload,
                self.qos,
                will.retain,
            ));
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 100);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        self.closing.store(false, Ordering::SeqCst);
        let closing = self.closing.clone();

        log::info!(
            "MQTT client '{}' connecting to {}:{}",
            options.client_id,
            options.host,
            options.port
        );
        let task = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                        let outcome = if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(format!("broker refused connection: {:?}", ack.code))
                        };
                        match ready_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(outcome);
                            }
                            None => log::debug!("Unexpected ConnAck: {:?}", ack),
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        log::trace!(
                            "MQTT message on {} ({} bytes, retain={})",
                            publish.topic,
                            publish.payload.len(),
                            publish.retain
                        );
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };
                        if sink.send(TransportEvent::Message(message)).is_err() {
                            log::debug!("Inbound sink closed, stopping MQTT event loop.");
                            break;
                        }
                    }
                    Ok(MqttEvent::Incoming(packet)) => {
                        log::trace!("MQTT packet: {:?}", packet);
                    }
                    Ok(MqttEvent::Outgoing(_)) => {}
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(e.to_string()));
                        } else if closing.load(Ordering::SeqCst) {
                            log::debug!("MQTT event loop ended after disconnect: {}", e);
                        } else {
                            log::error!("MQTT connection lost: {}", e);
                            let _ = sink.send(TransportEvent::ConnectionLost(e.to_string()));
                        }
                        break;
                    }
                }
            }
        });

        let connection_error = |details: String| Error::ConnectionError {
            host: options.host.clone(),
            port: options.port,
            details,
        };
        match tokio::time::timeout(options.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                log::info!("MQTT connected to {}:{}", options.host, options.port);
                *client_guard = Some(client);
                *task_guard = Some(task);
                Ok(())
            }
            Ok(Ok(Err(details))) => {
                task.abort();
                Err(connection_error(details))
            }
            Ok(Err(_)) => {
                task.abort();
                Err(connection_error("event loop ended before ConnAck".to_string()))
            }
            Err(_) => {
                task.abort();
                Err(connection_error(format!(
                    "no ConnAck within {} ms",
                    options.connect_timeout.as_millis()
                )))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::SeqCst);
        let client = self.client.write().await.take();
        let task = self.event_loop_task.write().await.take();
        match client {
            Some(client) => {
                if let Err(e) = client.disconnect().await {
                    log::warn!("MQTT disconnect request failed: {}", e);
                }
            }
            None => log::warn!("Disconnect called but client was not present."),
        }
        if let Some(mut task) = task {
            // Give the event loop a moment to flush the DISCONNECT packet.
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                log::debug!("MQTT event loop did not stop in time.");
                task.abort();
            }
        }
        log::info!("MQTT client disconnected.");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Error> {
        let client = self.connected_client().await?;
        client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(|e| Error::PublishFailed {
                topic: topic.to_string(),
                details: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        let client = self.connected_client().await?;
        log::debug!("Subscribing to {}", filter);
        client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| Error::SubscriptionFailed {
                topic: filter.to_string(),
                details: e.to_string(),
            })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        let client = self.connected_client().await?;
        log::debug!("Unsubscribing from {}", filter);
        client
            .unsubscribe(filter)
            .await
            .map_err(|e| Error::CommunicationError(format!("unsubscribe {}: {}", filter, e)))
    }
}
