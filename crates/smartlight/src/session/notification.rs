//! Retryable user-facing failure notifications.
//!
//! Every failure the session surfaces carries exactly one [`RetryAction`]. Nothing is
//! retried until that action is handed back to [`Session::retry`](super::Session::retry).

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

/// The operation a notification offers to run again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "type")]
pub enum RetryAction {
    /// Connect to the broker again
    Reconnect,
    /// Re-open the device state stream
    Resubscribe,
    /// Toggle power again
    TogglePower,
    /// Show this brightness level again and republish it through the debounce
    PublishBrightness { level: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub action: RetryAction,
}

/// Sending half of the notification channel, injected into the session
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, message: impl Into<String>, action: RetryAction) {
        let notification = Notification {
            message: message.into(),
            action,
        };
        warn!("{} (retry: {})", notification.message, notification.action);

        if self.tx.send(notification).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}
