use serde::{Deserialize, Serialize};

/// Access discipline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// OS name of the dedicated write thread.
    pub write_thread_name: String,
    /// How many times a cancellable read is restarted after yielding to a
    /// writer before giving up.
    pub cancellable_read_attempts: u32,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            write_thread_name: "tether-write".to_string(),
            cancellable_read_attempts: 10,
        }
    }
}
