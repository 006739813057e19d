mod notification;
mod orchestrator;
mod snapshot;

pub use notification::Notification;
pub use notification::Notifier;
pub use notification::RetryAction;
pub use orchestrator::Session;
pub use snapshot::UiSnapshot;
