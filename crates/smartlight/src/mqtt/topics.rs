/// Topic layout for a device: `<base>/<device_id>/{state,command,brightness}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Device -> app state broadcasts
    pub fn state(&self, device_id: &str) -> String {
        format!("{}/{}/state", self.base, device_id)
    }

    /// App -> device power commands
    pub fn command(&self, device_id: &str) -> String {
        format!("{}/{}/command", self.base, device_id)
    }

    /// App -> device brightness commands
    pub fn brightness(&self, device_id: &str) -> String {
        format!("{}/{}/brightness", self.base, device_id)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("smart-light")
    }
}
