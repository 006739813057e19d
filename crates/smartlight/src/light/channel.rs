use tracing::debug;
use tracing::info;
use tracing::warn;

use super::codec;
use super::codec::Command;
use super::codec::LightState;
use crate::mqtt::ConnectionManager;
use crate::mqtt::PublishError;
use crate::mqtt::SubscribeError;
use crate::mqtt::Subscription;
use crate::mqtt::Topics;
use crate::mqtt::Transport;

/// Typed per-device view over the connection: a state stream in, commands out.
pub struct DeviceChannel<T: Transport> {
    manager: ConnectionManager<T>,
    topics: Topics,
}

impl<T: Transport> Clone for DeviceChannel<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            topics: self.topics.clone(),
        }
    }
}

impl<T: Transport> DeviceChannel<T> {
    pub fn new(manager: ConnectionManager<T>, topics: Topics) -> Self {
        Self { manager, topics }
    }

    /// Lazy stream of state broadcasts for `device_id`.
    ///
    /// Nothing is subscribed until the first call to [`LightStateStream::next`].
    pub fn state_stream(&self, device_id: &str) -> LightStateStream<T> {
        LightStateStream {
            manager: self.manager.clone(),
            topic: self.topics.state(device_id),
            state: StreamState::Idle,
        }
    }

    /// Encode `command` and publish it on the topic for its kind
    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &Command,
    ) -> Result<(), PublishError> {
        let topic = match command {
            Command::Power { .. } => self.topics.command(device_id),
            Command::Brightness { .. } => self.topics.brightness(device_id),
        };

        self.manager.publish(&topic, codec::encode(command)).await?;
        info!("Sent command to light {}: {:?}", device_id, command);
        Ok(())
    }
}

enum StreamState<T: Transport> {
    Idle,
    Active(Subscription<T>),
    Done,
}

/// Decoded state broadcasts for one device.
///
/// Malformed payloads are logged and skipped. Dropping the stream unsubscribes.
pub struct LightStateStream<T: Transport> {
    manager: ConnectionManager<T>,
    topic: String,
    state: StreamState<T>,
}

impl<T: Transport> LightStateStream<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next decoded state.
    ///
    /// Yields a single `Err` if subscribing fails, and `None` once the subscription
    /// has ended (link loss, disconnect, or replacement). Both end the stream.
    pub async fn next(&mut self) -> Option<Result<LightState, SubscribeError>> {
        if let StreamState::Idle = self.state {
            match self.manager.subscribe(&self.topic).await {
                Ok(subscription) => self.state = StreamState::Active(subscription),
                Err(e) => {
                    self.state = StreamState::Done;
                    return Some(Err(e));
                }
            }
        }

        let StreamState::Active(subscription) = &mut self.state else {
            return None;
        };

        loop {
            let Some(payload) = subscription.next().await else {
                debug!("State stream for {} ended", self.topic);
                self.state = StreamState::Done;
                return None;
            };

            match codec::decode(&payload) {
                Ok(state) => {
                    debug!("Received state on {}: {:?}", self.topic, state);
                    return Some(Ok(state));
                }
                Err(e) => warn!("Failed to parse state on {}: {}", self.topic, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::mqtt::mock::eventually;
    use crate::mqtt::mock::MockTransport;

    const STATE_TOPIC: &str = "smart-light/light1/state";

    async fn connected_channel() -> (DeviceChannel<MockTransport>, MockTransport) {
        let (mock, events) = MockTransport::new();
        let manager = ConnectionManager::new(mock.clone(), events);
        manager.connect().await.unwrap();
        (DeviceChannel::new(manager, Topics::default()), mock)
    }

    /// Drive a stream on a background task, forwarding every item
    fn forward(
        mut stream: LightStateStream<MockTransport>,
    ) -> mpsc::UnboundedReceiver<Option<Result<LightState, SubscribeError>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let item = stream.next().await;
                let done = !matches!(item, Some(Ok(_)));
                if tx.send(item).is_err() || done {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_lazily() {
        let (channel, mock) = connected_channel().await;

        let stream = channel.state_stream("light1");
        assert_eq!(stream.topic(), STATE_TOPIC);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mock.subscriptions().is_empty());

        let _rx = forward(stream);
        eventually(|| mock.subscriptions() == vec![STATE_TOPIC.to_string()]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_does_not_end_stream() {
        let (channel, mock) = connected_channel().await;
        let mut rx = forward(channel.state_stream("light1"));
        eventually(|| !mock.subscriptions().is_empty()).await;

        mock.inject(STATE_TOPIC, b"{\"isOn\": tru");
        mock.inject(
            STATE_TOPIC,
            br#"{"isOn": true, "brightness": 40, "deviceId": "light1", "lastUpdated": 5}"#,
        );

        let state = rx.recv().await.unwrap().unwrap().unwrap();
        assert!(state.is_on);
        assert_eq!(state.brightness, 40);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_delivered_in_order() {
        let (channel, mock) = connected_channel().await;
        let mut rx = forward(channel.state_stream("light1"));
        eventually(|| !mock.subscriptions().is_empty()).await;

        for level in [10, 20, 30] {
            let payload = format!(
                r#"{{"isOn": true, "brightness": {}, "deviceId": "light1", "lastUpdated": 1}}"#,
                level
            );
            mock.inject(STATE_TOPIC, payload.as_bytes());
        }

        for level in [10, 20, 30] {
            let state = rx.recv().await.unwrap().unwrap().unwrap();
            assert_eq!(state.brightness, level);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unsubscribes_and_resubscribe_is_allowed() {
        let (channel, mock) = connected_channel().await;

        let mut stream = channel.state_stream("light1");
        let consumer = tokio::spawn(async move { stream.next().await.map(|r| r.is_ok()) });
        eventually(|| mock.subscriptions().len() == 1).await;

        consumer.abort();
        eventually(|| mock.unsubscriptions() == vec![STATE_TOPIC.to_string()]).await;

        let mut rx = forward(channel.state_stream("light1"));
        eventually(|| mock.subscriptions().len() == 2).await;
        mock.inject(
            STATE_TOPIC,
            br#"{"isOn": false, "brightness": 0, "deviceId": "light1", "lastUpdated": 1}"#,
        );
        assert!(rx.recv().await.unwrap().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_is_yielded_once() {
        let (channel, mock) = connected_channel().await;
        mock.set_fail_subscribe(Some("not authorized"));

        let mut stream = channel.state_stream("light1");
        assert!(matches!(
            stream.next().await,
            Some(Err(SubscribeError::Rejected { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_command_selects_topic_by_kind() {
        let (channel, mock) = connected_channel().await;

        channel
            .publish_command("light1", &Command::Power { is_on: true })
            .await
            .unwrap();
        channel
            .publish_command("light1", &Command::brightness(65))
            .await
            .unwrap();

        let published = mock.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "smart-light/light1/command");
        assert_eq!(published[1].0, "smart-light/light1/brightness");
        assert_eq!(
            codec::decode_command(&published[1].1).unwrap(),
            Command::Brightness { level: 65 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_command_failure() {
        let (channel, mock) = connected_channel().await;
        mock.set_fail_publish(Some("broker unavailable"));

        let err = channel
            .publish_command("light1", &Command::Power { is_on: false })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broker unavailable"));
    }
}
