use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use rumqttc::SubscribeReasonCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::BrokerConfig;
use crate::sync::lock;

/// Sender half of the transport event channel
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of the transport event channel
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Outcome notifications reported by a transport after a request was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    Connected,

    /// A connection attempt failed before the broker accepted it
    ConnectFailed(String),

    /// An explicit disconnect completed
    Disconnected,

    /// An explicit disconnect failed
    DisconnectFailed(String),

    /// An established link dropped without being asked to
    ConnectionLost(String),

    /// The broker acknowledged a subscription
    Subscribed { topic: String },

    /// The broker rejected a subscription
    SubscribeFailed { topic: String, reason: String },

    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client not connected. Call connect() first.")]
    NotConnected,

    #[error("MQTT request failed: {0}")]
    Request(String),
}

/// Trait for MQTT transport operations
///
/// Every method only issues a request. Outcomes (CONNACK, SUBACK, link loss, inbound
/// messages) are reported asynchronously as [`TransportEvent`]s on the channel the
/// transport was constructed with. This allows the transport to be replaced by a
/// scripted double in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start a connection attempt
    async fn connect(&self) -> Result<(), TransportError>;

    /// Request a clean disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Request a subscription at QoS 1
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Request an unsubscribe; no acknowledgement is reported
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Queue a QoS 1 publish; returns once the request is handed to the client
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;
}

/// Real MQTT transport implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (a fresh client is built from these on every connect)
    mqtt_options: MqttOptions,

    connect_timeout: Duration,

    auto_reconnect: bool,

    events: TransportEventSender,

    /// AsyncClient (created in connect())
    client: Mutex<Option<AsyncClient>>,

    /// Background event loop task handle
    event_loop_task: Mutex<Option<JoinHandle<()>>>,

    connected: Arc<AtomicBool>,

    /// Topics whose SUBSCRIBE has been requested but not yet written out
    pending_subscribes: Arc<Mutex<VecDeque<String>>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    pub fn new(config: &BrokerConfig, client_id: String, events: TransportEventSender) -> Self {
        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options.set_keep_alive(config.keep_alive());
        mqtt_options.set_clean_session(true);

        Self {
            mqtt_options,
            connect_timeout: config.connect_timeout(),
            auto_reconnect: config.auto_reconnect,
            events,
            client: Mutex::new(None),
            event_loop_task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            pending_subscribes: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Identifier presented to the broker in CONNECT
    pub fn client_id(&self) -> String {
        self.mqtt_options.client_id()
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        lock(&self.client)
            .as_ref()
            .cloned()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for RumqttcClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let (host, port) = self.mqtt_options.broker_address();
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            host,
            port,
            self.mqtt_options.client_id()
        );

        let (client, event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);

        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending_subscribes).clear();

        let driver = EventLoopDriver {
            events: self.events.clone(),
            connected: self.connected.clone(),
            pending_subscribes: self.pending_subscribes.clone(),
            connect_timeout: self.connect_timeout,
            auto_reconnect: self.auto_reconnect,
        };
        let task = tokio::spawn(driver.run(event_loop));

        *lock(&self.client) = Some(client);
        if let Some(previous) = lock(&self.event_loop_task).replace(task) {
            previous.abort();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .disconnect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?;

        lock(&self.pending_subscribes).push_back(topic.to_string());
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            lock(&self.pending_subscribes).pop_back();
            return Err(TransportError::Request(e.to_string()));
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.event_loop_task).take() {
            task.abort();
        }
    }
}

/// State owned by the background task that polls the rumqttc event loop
struct EventLoopDriver {
    events: TransportEventSender,
    connected: Arc<AtomicBool>,
    pending_subscribes: Arc<Mutex<VecDeque<String>>>,
    connect_timeout: Duration,
    auto_reconnect: bool,
}

enum Step {
    Continue,
    Stop,
}

impl EventLoopDriver {
    async fn run(self, mut event_loop: EventLoop) {
        // SUBSCRIBE packet id -> topic, filled when the packet goes out
        let mut in_flight: HashMap<u16, String> = HashMap::new();
        let mut ever_connected = false;

        loop {
            let polled = if self.connected.load(Ordering::SeqCst) {
                event_loop.poll().await.map_err(|e| e.to_string())
            } else {
                match tokio::time::timeout(self.connect_timeout, event_loop.poll()).await {
                    Ok(polled) => polled.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "connection timed out after {}s",
                        self.connect_timeout.as_secs()
                    )),
                }
            };

            let step = match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        ever_connected = true;
                        self.connected.store(true, Ordering::SeqCst);
                        info!("MQTT connection established");
                        self.emit(TransportEvent::Connected)
                    } else {
                        self.emit(TransportEvent::ConnectFailed(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                        Step::Stop
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.emit(TransportEvent::Message {
                        topic: publish.topic.to_string(),
                        payload: publish.payload.to_vec(),
                    })
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => match in_flight.remove(&ack.pkid) {
                    Some(topic) => {
                        let rejected = ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        if rejected {
                            self.emit(TransportEvent::SubscribeFailed {
                                topic,
                                reason: "broker rejected subscription".to_string(),
                            })
                        } else {
                            self.emit(TransportEvent::Subscribed { topic })
                        }
                    }
                    None => {
                        debug!("SUBACK for unknown packet id {}", ack.pkid);
                        Step::Continue
                    }
                },
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    if let Some(topic) = lock(&self.pending_subscribes).pop_front() {
                        in_flight.insert(pkid, topic);
                    }
                    Step::Continue
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.emit(TransportEvent::Disconnected);
                    Step::Stop
                }
                Ok(_) => {
                    // Ignore other events (puback, pingresp, etc.)
                    Step::Continue
                }
                Err(reason) => {
                    in_flight.clear();
                    let was_connected = self.connected.swap(false, Ordering::SeqCst);
                    if was_connected {
                        warn!("MQTT connection lost: {}", reason);
                        if let Step::Stop = self.emit(TransportEvent::ConnectionLost(reason)) {
                            break;
                        }
                    } else if !(ever_connected && self.auto_reconnect) {
                        warn!("MQTT connection failed: {}", reason);
                        self.emit(TransportEvent::ConnectFailed(reason));
                        break;
                    } else {
                        debug!("MQTT reconnect attempt failed: {}", reason);
                    }

                    if !self.auto_reconnect {
                        break;
                    }

                    // Sleep briefly before letting rumqttc reconnect
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Step::Continue
                }
            };

            if let Step::Stop = step {
                break;
            }
        }

        info!("MQTT event loop task exiting");
    }

    /// Forward an event; stop polling once nobody is listening.
    fn emit(&self, event: TransportEvent) -> Step {
        if self.events.send(event).is_err() {
            Step::Stop
        } else {
            Step::Continue
        }
    }
}
