use serde::Serialize;

/// What the presentation layer shows for the active device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSnapshot {
    pub is_connected: bool,
    pub is_on: bool,
    pub brightness: u8,
    pub device_id: String,
    pub is_loading: bool,
}

impl UiSnapshot {
    /// Snapshot at session start: nothing known yet, connection pending
    pub fn initial(device_id: impl Into<String>) -> Self {
        Self {
            is_connected: false,
            is_on: false,
            brightness: 0,
            device_id: device_id.into(),
            is_loading: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(UiSnapshot::initial("light1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "isConnected": false,
                "isOn": false,
                "brightness": 0,
                "deviceId": "light1",
                "isLoading": true,
            })
        );
    }
}
