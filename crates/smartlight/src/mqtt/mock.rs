//! Scripted transport for tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::Transport;
use super::client::TransportError;
use super::client::TransportEvent;
use super::client::TransportEventReceiver;
use super::client::TransportEventSender;
use crate::sync::lock;

/// Mock transport; clones share the same script and recordings
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    events: TransportEventSender,
    connected: AtomicBool,
    /// When false, connect() only records the call; the test completes it
    auto_connect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fail_connect: Mutex<Option<String>>,
    fail_disconnect: Mutex<Option<String>>,
    fail_subscribe: Mutex<Option<String>>,
    fail_unsubscribe: Mutex<Option<String>>,
    fail_publish: Mutex<Option<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Create a new mock transport and the event receiver to hand to a manager
    pub fn new() -> (Self, TransportEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let mock = Self {
            inner: Arc::new(MockInner {
                events,
                connected: AtomicBool::new(false),
                auto_connect: AtomicBool::new(true),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                fail_connect: Mutex::new(None),
                fail_disconnect: Mutex::new(None),
                fail_subscribe: Mutex::new(None),
                fail_unsubscribe: Mutex::new(None),
                fail_publish: Mutex::new(None),
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                unsubscriptions: Mutex::new(Vec::new()),
            }),
        };
        (mock, rx)
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, reason: Option<&str>) {
        *lock(&self.inner.fail_connect) = reason.map(str::to_string);
    }

    pub fn set_fail_disconnect(&self, reason: Option<&str>) {
        *lock(&self.inner.fail_disconnect) = reason.map(str::to_string);
    }

    pub fn set_fail_subscribe(&self, reason: Option<&str>) {
        *lock(&self.inner.fail_subscribe) = reason.map(str::to_string);
    }

    /// Unsubscribe requests are still recorded, then fail
    pub fn set_fail_unsubscribe(&self, reason: Option<&str>) {
        *lock(&self.inner.fail_unsubscribe) = reason.map(str::to_string);
    }

    pub fn set_fail_publish(&self, reason: Option<&str>) {
        *lock(&self.inner.fail_publish) = reason.map(str::to_string);
    }

    /// Complete a held connect attempt (see `set_auto_connect`)
    pub fn complete_connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        self.send(TransportEvent::Connected);
    }

    /// Simulate an inbound publish from the broker
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Simulate the link dropping underneath an established connection
    pub fn drop_link(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.send(TransportEvent::ConnectionLost(reason.to_string()));
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.inner.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.inner.published).clone()
    }

    /// Published payloads on one topic, as UTF-8 strings
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| String::from_utf8_lossy(&payload).into_owned())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.inner.unsubscriptions).clone()
    }

    fn send(&self, event: TransportEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);

        let failure = lock(&self.inner.fail_connect).clone();
        if let Some(reason) = failure {
            self.send(TransportEvent::ConnectFailed(reason));
        } else if self.inner.auto_connect.load(Ordering::SeqCst) {
            self.complete_connect();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect_calls.fetch_add(1, Ordering::SeqCst);

        let failure = lock(&self.inner.fail_disconnect).clone();
        if let Some(reason) = failure {
            self.send(TransportEvent::DisconnectFailed(reason));
            return Ok(());
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        self.send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        lock(&self.inner.subscriptions).push(topic.to_string());

        let failure = lock(&self.inner.fail_subscribe).clone();
        match failure {
            Some(reason) => self.send(TransportEvent::SubscribeFailed {
                topic: topic.to_string(),
                reason,
            }),
            None => self.send(TransportEvent::Subscribed {
                topic: topic.to_string(),
            }),
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        lock(&self.inner.unsubscriptions).push(topic.to_string());

        let failure = lock(&self.inner.fail_unsubscribe).clone();
        match failure {
            Some(reason) => Err(TransportError::Request(reason)),
            None => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let failure = lock(&self.inner.fail_publish).clone();
        if let Some(reason) = failure {
            return Err(TransportError::Request(reason));
        }
        lock(&self.inner.published).push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds, failing the test after a few (virtual) seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
