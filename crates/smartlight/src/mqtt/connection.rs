use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::client::Transport;
use super::client::TransportError;
use super::client::TransportEvent;
use super::client::TransportEventReceiver;
use crate::sync::lock;

/// Connection state as observed by the rest of the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Full connection state machine, including the transient `Connecting` phase
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("Connection manager shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to publish to {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Connection manager shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("Failed to subscribe to {topic}: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Subscription to {topic} was interrupted by a connection change")]
    Interrupted { topic: String },

    #[error("Connection manager shut down")]
    Closed,
}

/// Owns the broker connection.
///
/// The transport reports outcomes as events; a background task turns each event into
/// exactly one resolution of the operation waiting on it (connect, disconnect, or the
/// subscribe for that topic) and routes inbound messages to their subscription.
/// Only one connect and one disconnect can be outstanding at a time.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    /// Serializes issuing subscribe/unsubscribe requests to the transport
    topic_ops: tokio::sync::Mutex<()>,
    event_task: JoinHandle<()>,
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

/// State shared with the event processing task
struct Shared {
    phase: watch::Sender<Phase>,
    state: watch::Sender<ConnectionState>,
    pending: Mutex<Pending>,
    routes: Mutex<HashMap<String, Route>>,
    next_route_id: AtomicU64,
}

/// One-shot waiters, each resolved by exactly one transport event
#[derive(Default)]
struct Pending {
    connect: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    disconnect: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    subscribes: HashMap<String, oneshot::Sender<Result<(), SubscribeError>>>,
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager around `transport`, consuming the events it reports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: T, events: TransportEventReceiver) -> Self {
        let shared = Arc::new(Shared {
            phase: watch::Sender::new(Phase::Disconnected),
            state: watch::Sender::new(ConnectionState::Disconnected),
            pending: Mutex::new(Pending::default()),
            routes: Mutex::new(HashMap::new()),
            next_route_id: AtomicU64::new(0),
        });

        let event_task = tokio::spawn(Self::process_events(shared.clone(), events));

        Self {
            inner: Arc::new(Inner {
                transport,
                shared,
                topic_ops: tokio::sync::Mutex::new(()),
                event_task,
            }),
        }
    }

    async fn process_events(shared: Arc<Shared>, mut events: TransportEventReceiver) {
        while let Some(event) = events.recv().await {
            shared.handle(event);
        }
        debug!("Transport event channel closed");
    }

    /// Stream of connection state changes
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.shared.phase.borrow().clone()
    }

    /// Connect to the broker.
    ///
    /// Returns immediately when already connected. A call made while another attempt
    /// is in flight waits for that attempt instead of starting a second one.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut already_connected = false;
        let mut in_flight = false;
        self.inner.shared.phase.send_if_modified(|phase| match phase {
            Phase::Connected => {
                already_connected = true;
                false
            }
            Phase::Connecting => {
                in_flight = true;
                false
            }
            Phase::Disconnected | Phase::Error(_) => {
                *phase = Phase::Connecting;
                true
            }
        });

        if already_connected {
            debug!("connect() while already connected");
            return Ok(());
        }
        if in_flight {
            debug!("connect() while an attempt is in flight; waiting for it");
            return self.wait_for_attempt().await;
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.shared.pending).connect = Some(tx);

        if let Err(e) = self.inner.transport.connect().await {
            self.inner
                .shared
                .handle(TransportEvent::ConnectFailed(e.to_string()));
        }

        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Disconnect from the broker; a no-op unless connected.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let connecting = matches!(*self.inner.shared.phase.borrow(), Phase::Connecting);
        if connecting {
            // Let the in-flight attempt settle first
            let _ = self.wait_for_attempt().await;
        }

        let connected = matches!(*self.inner.shared.phase.borrow(), Phase::Connected);
        if !connected {
            debug!("disconnect() while not connected");
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let already_pending = {
            let mut pending = lock(&self.inner.shared.pending);
            if pending.disconnect.is_some() {
                true
            } else {
                pending.disconnect = Some(tx);
                false
            }
        };
        if already_pending {
            return self.wait_for_disconnect().await;
        }

        info!("Disconnecting from MQTT broker");
        if let Err(e) = self.inner.transport.disconnect().await {
            self.inner
                .shared
                .handle(TransportEvent::DisconnectFailed(e.to_string()));
        }

        rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    async fn wait_for_attempt(&self) -> Result<(), ConnectionError> {
        let mut phase = self.inner.shared.phase.subscribe();
        let settled = phase
            .wait_for(|p| *p != Phase::Connecting)
            .await
            .map(|p| p.clone())
            .map_err(|_| ConnectionError::Closed)?;

        match settled {
            Phase::Connected => Ok(()),
            Phase::Error(reason) => Err(ConnectionError::Failed(reason)),
            Phase::Disconnected | Phase::Connecting => Err(ConnectionError::Failed(
                "connection attempt aborted".to_string(),
            )),
        }
    }

    async fn wait_for_disconnect(&self) -> Result<(), ConnectionError> {
        let mut phase = self.inner.shared.phase.subscribe();
        let settled = phase
            .wait_for(|p| *p != Phase::Connected)
            .await
            .map(|p| p.clone())
            .map_err(|_| ConnectionError::Closed)?;

        match settled {
            Phase::Error(reason) => Err(ConnectionError::DisconnectFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Suspend until the connection state reports Connected. There is no timeout.
    async fn wait_connected(&self) -> bool {
        let mut state = self.inner.shared.state.subscribe();
        state
            .wait_for(ConnectionState::is_connected)
            .await
            .map(|_| ())
            .is_ok()
    }

    /// Publish at QoS 1 once the connection is up.
    ///
    /// Suspends (without timeout) while not connected. Delivery is at-least-once, so
    /// receivers may see duplicates.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.wait_connected().await {
            return Err(PublishError::Closed);
        }

        info!(
            "Publishing to {}: {}",
            topic,
            String::from_utf8_lossy(&payload)
        );
        self.inner
            .transport
            .publish(topic, payload)
            .await
            .map_err(|source| {
                warn!("Publish to {} failed: {}", topic, source);
                PublishError::Send {
                    topic: topic.to_string(),
                    source,
                }
            })
    }

    /// Subscribe to `topic` once connected.
    ///
    /// The returned subscription yields payloads after the broker acknowledged the
    /// subscription. Dropping it unsubscribes, if the link is still up. Subscribing to
    /// a topic that already has a subscription replaces the earlier one, whose stream
    /// then ends.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription<T>, SubscribeError> {
        if !self.wait_connected().await {
            return Err(SubscribeError::Closed);
        }

        let (tx, messages) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let id = self.inner.shared.next_route_id.fetch_add(1, Ordering::SeqCst);

        {
            let _ops = self.inner.topic_ops.lock().await;

            let replaced = lock(&self.inner.shared.routes)
                .insert(topic.to_string(), Route { id, tx })
                .is_some();
            if replaced {
                debug!("Replacing existing subscription to {}", topic);
            }
            lock(&self.inner.shared.pending)
                .subscribes
                .insert(topic.to_string(), ack_tx);

            info!("Subscribing to {}", topic);
            if let Err(e) = self.inner.transport.subscribe(topic).await {
                lock(&self.inner.shared.pending).subscribes.remove(topic);
                self.inner.shared.remove_route(topic, id);
                warn!("Subscribe to {} failed: {}", topic, e);
                return Err(SubscribeError::Rejected {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let acked = ack_rx.await.unwrap_or(Err(SubscribeError::Closed));
        if let Err(e) = acked {
            self.inner.shared.remove_route(topic, id);
            warn!("{}", e);
            return Err(e);
        }

        debug!("Subscription to {} acknowledged", topic);
        Ok(Subscription {
            topic: topic.to_string(),
            id,
            messages,
            manager: self.clone(),
        })
    }

    /// Drop the route for a cancelled subscription and unsubscribe in the background.
    fn release(&self, topic: &str, id: u64) {
        if !self.inner.shared.remove_route(topic, id) {
            // Replaced by a newer subscription, or already closed by a link change
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let inner = self.inner.clone();
        let topic = topic.to_string();
        runtime.spawn(async move {
            let _ops = inner.topic_ops.lock().await;

            let resubscribed = lock(&inner.shared.routes).contains_key(&topic);
            if resubscribed {
                debug!("{} was re-subscribed; keeping broker subscription", topic);
                return;
            }
            if !inner.transport.is_connected() {
                debug!("Not connected; skipping unsubscribe from {}", topic);
                return;
            }

            match inner.transport.unsubscribe(&topic).await {
                Ok(()) => info!("Unsubscribed from {}", topic),
                Err(e) => warn!("Failed to unsubscribe from {}: {}", topic, e),
            }
        });
    }
}

impl Shared {
    fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.transition(Phase::Connected);
                let waiter = lock(&self.pending).connect.take();
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(()));
                }
            }
            TransportEvent::ConnectFailed(reason) => {
                warn!("MQTT connection failed: {}", reason);
                self.close_routes();
                self.transition(Phase::Error(reason.clone()));
                let waiter = lock(&self.pending).connect.take();
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(ConnectionError::Failed(reason)));
                }
            }
            TransportEvent::Disconnected => {
                self.close_routes();
                self.transition(Phase::Disconnected);
                let (connect, disconnect) = {
                    let mut pending = lock(&self.pending);
                    (pending.connect.take(), pending.disconnect.take())
                };
                if let Some(tx) = connect {
                    let _ = tx.send(Err(ConnectionError::Failed(
                        "disconnected during connection attempt".to_string(),
                    )));
                }
                if let Some(tx) = disconnect {
                    let _ = tx.send(Ok(()));
                }
            }
            TransportEvent::DisconnectFailed(reason) => {
                warn!("MQTT disconnect failed: {}", reason);
                self.transition(Phase::Error(reason.clone()));
                let waiter = lock(&self.pending).disconnect.take();
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(ConnectionError::DisconnectFailed(reason)));
                }
            }
            TransportEvent::ConnectionLost(reason) => {
                warn!("MQTT connection lost: {}", reason);
                self.close_routes();
                self.transition(Phase::Error(reason.clone()));
                let (connect, disconnect) = {
                    let mut pending = lock(&self.pending);
                    (pending.connect.take(), pending.disconnect.take())
                };
                if let Some(tx) = connect {
                    let _ = tx.send(Err(ConnectionError::Failed(reason.clone())));
                }
                if let Some(tx) = disconnect {
                    let _ = tx.send(Err(ConnectionError::DisconnectFailed(reason)));
                }
            }
            TransportEvent::Subscribed { topic } => {
                let waiter = lock(&self.pending).subscribes.remove(&topic);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => debug!("Unexpected SUBACK for {}", topic),
                }
            }
            TransportEvent::SubscribeFailed { topic, reason } => {
                let waiter = lock(&self.pending).subscribes.remove(&topic);
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(SubscribeError::Rejected { topic, reason }));
                }
            }
            TransportEvent::Message { topic, payload } => {
                let routes = lock(&self.routes);
                match routes.get(&topic) {
                    Some(route) => {
                        if route.tx.send(payload).is_err() {
                            debug!("Subscriber for {} is gone", topic);
                        }
                    }
                    None => debug!("Dropping message on unsubscribed topic {}", topic),
                }
            }
        }
    }

    fn transition(&self, next: Phase) {
        let previous = self.phase.send_replace(next.clone());
        if previous != next {
            info!("MQTT connection {} -> {}", previous, next);
        }

        let observed = match next {
            Phase::Connecting => return,
            Phase::Connected => ConnectionState::Connected,
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Error(reason) => ConnectionState::Error(reason),
        };
        self.state.send_replace(observed);
    }

    /// End every subscription stream and fail any unacknowledged subscribe.
    fn close_routes(&self) {
        lock(&self.routes).clear();
        let waiters: Vec<_> = lock(&self.pending).subscribes.drain().collect();
        for (topic, tx) in waiters {
            let _ = tx.send(Err(SubscribeError::Interrupted { topic }));
        }
    }

    /// Remove the route for `topic` if it still belongs to subscription `id`.
    fn remove_route(&self, topic: &str, id: u64) -> bool {
        let mut routes = lock(&self.routes);
        match routes.get(topic) {
            Some(route) if route.id == id => {
                routes.remove(topic);
                true
            }
            _ => false,
        }
    }
}

/// Inbound payload stream for one topic.
///
/// Dropping the subscription unsubscribes from the broker, if still connected.
pub struct Subscription<T: Transport> {
    topic: String,
    id: u64,
    messages: mpsc::UnboundedReceiver<Vec<u8>>,
    manager: ConnectionManager<T>,
}

impl<T: Transport> Subscription<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or None once the subscription has been closed
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.messages.recv().await
    }
}

impl<T: Transport> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.manager.release(&self.topic, self.id);
    }
}
