use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use super::notification::Notifier;
use super::notification::RetryAction;
use super::snapshot::UiSnapshot;
use crate::config::SessionConfig;
use crate::light::codec::clamp_brightness;
use crate::light::Command;
use crate::light::DeviceChannel;
use crate::light::LightStateStream;
use crate::mqtt::ConnectionError;
use crate::mqtt::ConnectionManager;
use crate::mqtt::ConnectionState;
use crate::mqtt::PublishError;
use crate::mqtt::SubscribeError;
use crate::mqtt::Transport;
use crate::sync::lock;

/// Drives one device session and owns the [`UiSnapshot`] shown for it.
///
/// The session is the only writer of the snapshot. Each write is a single
/// read-modify-write on the watch channel, so concurrent tasks never interleave
/// partial updates.
///
/// Failures are never retried automatically: each one produces a single
/// notification whose [`RetryAction`] can be passed back to [`Session::retry`].
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    manager: ConnectionManager<T>,
    channel: DeviceChannel<T>,
    device_id: String,
    brightness_debounce: Duration,
    notifier: Notifier,
    snapshot: watch::Sender<UiSnapshot>,
    tasks: Mutex<Tasks>,
}

/// Background work owned by the session; each slot holds at most one live task
#[derive(Default)]
struct Tasks {
    connection_watcher: Option<JoinHandle<()>>,
    state_observer: Option<JoinHandle<()>>,
    pending_brightness: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        let slots = [
            self.connection_watcher.take(),
            self.state_observer.take(),
            self.pending_brightness.take(),
            self.connect.take(),
        ];
        for task in slots.into_iter().flatten() {
            task.abort();
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        lock(&self.tasks).abort_all();
    }
}

impl<T: Transport> Session<T> {
    pub fn new(
        manager: ConnectionManager<T>,
        channel: DeviceChannel<T>,
        config: &SessionConfig,
        device_id: impl Into<String>,
        notifier: Notifier,
    ) -> Self {
        let device_id = device_id.into();
        let snapshot = watch::Sender::new(UiSnapshot::initial(device_id.clone()));

        Self {
            inner: Arc::new(Inner {
                manager,
                channel,
                device_id,
                brightness_debounce: config.brightness_debounce(),
                notifier,
                snapshot,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Start reacting to connection changes and issue the first connect.
    pub fn start(&self) {
        {
            let mut tasks = lock(&self.inner.tasks);
            if tasks.connection_watcher.is_some() {
                debug!("Session already started");
                return;
            }

            // Only changes after this point are reported
            let states = self.inner.manager.state_stream();
            tasks.connection_watcher = Some(tokio::spawn(watch_connection(
                Arc::downgrade(&self.inner),
                states,
            )));
        }

        info!("Starting session for device {}", self.inner.device_id);
        self.reconnect();
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.inner.manager
    }

    pub fn snapshot(&self) -> UiSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<UiSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Apply `f` to the snapshot, notifying observers only if something changed
    fn update(&self, f: impl FnOnce(&mut UiSnapshot)) {
        self.inner.snapshot.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            *snapshot != before
        });
    }

    /// Connect to the broker, showing the loading state while the attempt runs.
    ///
    /// Failures are reported through the connection state; this only returns them.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.update(|s| s.is_loading = true);

        let result = self.inner.manager.connect().await;

        let failed = result.is_err();
        self.update(|s| {
            s.is_loading = false;
            if failed {
                s.is_connected = false;
            }
        });
        result
    }

    /// Start a connect attempt in the background
    pub fn reconnect(&self) {
        let session = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = session.connect().await {
                debug!("Connect attempt failed: {}", e);
            }
        });
        lock(&self.inner.tasks).connect = Some(task);
    }

    fn on_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.update(|s| {
                    s.is_connected = true;
                    s.is_loading = false;
                });
                self.observe_light_state();
            }
            ConnectionState::Disconnected => {
                self.update(|s| {
                    s.is_connected = false;
                    s.is_loading = false;
                });
                self.inner
                    .notifier
                    .notify("Disconnected from server", RetryAction::Reconnect);
            }
            ConnectionState::Error(reason) => {
                self.update(|s| {
                    s.is_connected = false;
                    s.is_loading = false;
                });
                let message = if reason.is_empty() {
                    "Connection error".to_string()
                } else {
                    format!("Connection error: {}", reason)
                };
                self.inner.notifier.notify(message, RetryAction::Reconnect);
            }
        }
    }

    /// (Re)open the state stream for the device, replacing any existing observer
    pub fn observe_light_state(&self) {
        let stream = self.inner.channel.state_stream(&self.inner.device_id);

        let mut tasks = lock(&self.inner.tasks);
        if let Some(previous) = tasks.state_observer.take() {
            previous.abort();
        }
        tasks.state_observer = Some(tokio::spawn(observe_states(
            Arc::downgrade(&self.inner),
            stream,
        )));
    }

    fn apply_state_error(&self, error: SubscribeError) {
        match error {
            SubscribeError::Rejected { .. } => self.inner.notifier.notify(
                format!("Failed to observe light state: {}", error),
                RetryAction::Resubscribe,
            ),
            // Link changes are reported once, through the connection state
            SubscribeError::Interrupted { .. } | SubscribeError::Closed => {
                debug!("State stream for {} closed: {}", self.inner.device_id, error)
            }
        }
    }

    /// Flip power optimistically; on publish failure the previous value is restored.
    ///
    /// The flip is applied when this is called, before the returned future is polled.
    pub fn toggle_power(
        &self,
    ) -> impl Future<Output = Result<(), PublishError>> + Send + 'static {
        let mut prior = false;
        let mut target = false;
        self.inner.snapshot.send_modify(|s| {
            prior = s.is_on;
            target = !s.is_on;
            s.is_on = target;
        });

        let session = self.clone();
        async move {
            let command = Command::Power { is_on: target };
            let result = session
                .inner
                .channel
                .publish_command(&session.inner.device_id, &command)
                .await;

            if let Err(e) = &result {
                session.update(|s| s.is_on = prior);
                session.inner.notifier.notify(
                    format!("Failed to toggle power: {}", e),
                    RetryAction::TogglePower,
                );
            }
            result
        }
    }

    /// Show `level` immediately and publish it once input has been quiet for the
    /// debounce period. A newer level cancels the pending publish.
    ///
    /// Unlike power, a failed brightness publish leaves the snapshot as is.
    pub fn set_brightness(&self, level: i64) {
        let level = clamp_brightness(level);
        self.update(|s| s.brightness = level);

        let session = Arc::downgrade(&self.inner);
        let quiet_period = self.inner.brightness_debounce;

        let mut tasks = lock(&self.inner.tasks);
        if let Some(pending) = tasks.pending_brightness.take() {
            pending.abort();
        }
        tasks.pending_brightness = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            let Some(inner) = session.upgrade() else {
                return;
            };
            let _ = Session { inner }.publish_brightness(level).await;
        }));
    }

    /// Publish one debounced level; only the debounce task calls this
    async fn publish_brightness(&self, level: u8) -> Result<(), PublishError> {
        let command = Command::brightness(i64::from(level));
        let result = self
            .inner
            .channel
            .publish_command(&self.inner.device_id, &command)
            .await;

        if let Err(e) = &result {
            self.inner.notifier.notify(
                format!("Failed to update brightness: {}", e),
                RetryAction::PublishBrightness { level },
            );
        }
        result
    }

    /// Run the action bound to a notification
    pub async fn retry(&self, action: RetryAction) {
        info!("Retrying {}", action);
        match action {
            RetryAction::Reconnect => {
                let _ = self.connect().await;
            }
            RetryAction::Resubscribe => self.observe_light_state(),
            RetryAction::TogglePower => {
                let _ = self.toggle_power().await;
            }
            // Goes back through the debounce slot and shows the level again
            RetryAction::PublishBrightness { level } => self.set_brightness(i64::from(level)),
        }
    }

    /// Stop all background work and disconnect from the broker.
    ///
    /// A brightness change still inside its quiet period is discarded.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        info!("Ending session for device {}", self.inner.device_id);
        lock(&self.inner.tasks).abort_all();

        let result = self.inner.manager.disconnect().await;
        self.update(|s| {
            s.is_connected = false;
            s.is_loading = false;
        });
        result
    }
}

async fn watch_connection<T: Transport>(
    session: Weak<Inner<T>>,
    mut states: watch::Receiver<ConnectionState>,
) {
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        let Some(inner) = session.upgrade() else {
            break;
        };
        Session { inner }.on_connection_state(state);
    }
}

async fn observe_states<T: Transport>(session: Weak<Inner<T>>, mut stream: LightStateStream<T>) {
    while let Some(item) = stream.next().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        let session = Session { inner };

        match item {
            Ok(state) => session.update(|s| {
                s.is_on = state.is_on;
                s.brightness = state.brightness;
            }),
            Err(e) => session.apply_state_error(e),
        }
    }
}
