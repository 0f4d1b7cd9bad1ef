//! MQTT client plumbing shared by the host agents.

pub mod discovery;
pub mod srv;

use std::time::Duration;

use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use srv::SrvError;

/// How an agent reaches its broker. With no host configured the broker is
/// located through a `_mqtt._tcp` SRV lookup on the local domain.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error(transparent)]
    Srv(#[from] SrvError),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Publish/subscribe wrapper over `rumqttc::AsyncClient`.
///
/// A background task drives the event loop and forwards incoming publishes
/// into a channel; connection errors are retried with a short sleep rather
/// than surfaced, mirroring how the agents are expected to ride out broker
/// restarts.
pub struct MqttHandle {
    client: AsyncClient,
    message_rx: mpsc::UnboundedReceiver<MqttMessage>,
    _event_loop_task: JoinHandle<()>,
}

impl MqttHandle {
    /// Connect to the broker from `settings`, resolving it over SRV when no
    /// host is given. The last will marks `availability_topic` offline and
    /// must be set before connecting.
    pub async fn connect(
        settings: &MqttSettings,
        availability_topic: Option<&str>,
    ) -> Result<Self, MqttError> {
        let (host, port) = match &settings.host {
            Some(host) => (host.clone(), settings.port),
            None => {
                let targets = srv::lookup(None, false).await?;
                srv::first_reachable(&targets).await?
            }
        };
        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(settings.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_credentials(&settings.username, &settings.password);

        if let Some(topic) = availability_topic {
            mqtt_options.set_last_will(LastWill::new(topic, "offline", QoS::AtLeastOnce, false));
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };

                        // Receiver dropped means the agent is gone
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(event) => {
                        debug!("MQTT event: {:?}", event);
                    }
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            message_rx,
            _event_loop_task: task,
        })
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.into())
            .await?;
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    /// Next message from any subscribed topic. None once the event loop task
    /// has stopped.
    pub async fn next_message(&mut self) -> Option<MqttMessage> {
        self.message_rx.recv().await
    }
}
