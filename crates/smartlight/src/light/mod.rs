pub mod channel;
pub mod codec;

pub use channel::DeviceChannel;
pub use channel::LightStateStream;
pub use codec::Command;
pub use codec::DecodeError;
pub use codec::LightState;
