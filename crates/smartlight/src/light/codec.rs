//! Wire format for light commands and state broadcasts.
//!
//! Commands are JSON objects tagged with a `type` discriminator:
//! `{"type": "Power", "isOn": true}` or `{"type": "Brightness", "level": 40}`.
//!
//! The device broadcasts its state as
//! `{"isOn": true, "brightness": 40, "deviceId": "light1", "lastUpdated": 1700000000000}`.
//! Unknown fields are ignored.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

pub const MAX_BRIGHTNESS: u8 = 100;

/// Clamp any brightness input into `0..=100`
pub fn clamp_brightness(level: i64) -> u8 {
    level.clamp(0, i64::from(MAX_BRIGHTNESS)) as u8
}

/// Last known state reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightState {
    pub device_id: String,
    pub is_on: bool,
    /// Always within `0..=100`
    pub brightness: u8,
    /// Milliseconds since the Unix epoch
    pub last_updated: i64,
}

/// A user intent sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Power { is_on: bool },
    Brightness { level: u8 },
}

impl Command {
    /// Brightness command with the level clamped into range
    pub fn brightness(level: i64) -> Self {
        Command::Brightness {
            level: clamp_brightness(level),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Malformed payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// State payload as it appears on the wire
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireState {
    device_id: String,
    is_on: bool,
    brightness: i64,
    #[serde(default = "now_millis")]
    last_updated: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Encode a command for publishing
pub fn encode(command: &Command) -> Vec<u8> {
    let payload = match *command {
        Command::Power { is_on } => serde_json::json!({
            "type": "Power",
            "isOn": is_on,
        }),
        Command::Brightness { level } => serde_json::json!({
            "type": "Brightness",
            "level": level.min(MAX_BRIGHTNESS),
        }),
    };
    payload.to_string().into_bytes()
}

/// Decode a device state broadcast; out-of-range brightness is clamped
pub fn decode(payload: &[u8]) -> Result<LightState, DecodeError> {
    let wire: WireState = serde_json::from_slice(payload)?;
    Ok(LightState {
        device_id: wire.device_id,
        is_on: wire.is_on,
        brightness: clamp_brightness(wire.brightness),
        last_updated: wire.last_updated,
    })
}

/// Decode a command payload (the device side of [`encode`])
#[cfg(test)]
pub fn decode_command(payload: &[u8]) -> Result<Command, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}
