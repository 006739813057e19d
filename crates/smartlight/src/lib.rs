pub mod api;
pub mod config;
pub mod light;
pub mod mqtt;
pub mod session;
mod sync;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use light::Command;
pub use light::DeviceChannel;
pub use light::LightState;
pub use mqtt::ConnectionManager;
pub use mqtt::ConnectionState;
pub use mqtt::RumqttcClient;
pub use mqtt::Topics;
pub use session::Notification;
pub use session::Notifier;
pub use session::RetryAction;
pub use session::Session;
pub use session::UiSnapshot;
