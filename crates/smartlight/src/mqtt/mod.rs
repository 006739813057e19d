mod client;
mod connection;
#[cfg(test)]
pub(crate) mod mock;
mod topics;

pub use client::RumqttcClient;
pub use client::Transport;
pub use client::TransportError;
pub use client::TransportEvent;
pub use client::TransportEventReceiver;
pub use client::TransportEventSender;
pub use connection::ConnectionError;
pub use connection::ConnectionManager;
pub use connection::ConnectionState;
pub use connection::Phase;
pub use connection::PublishError;
pub use connection::SubscribeError;
pub use connection::Subscription;
pub use topics::Topics;
