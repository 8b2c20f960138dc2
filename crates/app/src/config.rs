//! Application configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! is a valid configuration. Command-line flags are applied on top by the
//! binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tether_access::AccessConfig;
use tether_core::{TetherError, TetherResult};
use tether_disposer::DisposerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub disposer: DisposerConfig,
    pub access: AccessConfig,
    /// Run `assert_is_empty` after the root has been torn down.
    pub leak_check_on_shutdown: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            disposer: DisposerConfig::default(),
            access: AccessConfig::default(),
            leak_check_on_shutdown: true,
        }
    }
}

impl AppConfig {
    pub fn from_json(text: &str) -> TetherResult<Self> {
        serde_json::from_str(text).map_err(|e| TetherError::Config(e.to_string()))
    }

    /// Reads `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> TetherResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| TetherError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn to_json(&self) -> TetherResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TetherError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(AppConfig::from_json("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn partial_override() {
        let config = AppConfig::from_json(
            r#"{ "disposer": { "debug_mode": true }, "access": { "cancellable_read_attempts": 2 } }"#,
        )
        .unwrap();
        assert!(config.disposer.debug_mode);
        assert_eq!(config.access.cancellable_read_attempts, 2);
        assert_eq!(config.access.write_thread_name, "tether-write");
        assert!(config.leak_check_on_shutdown);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = AppConfig::from_json(r#"{ "leak_check": false }"#).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/tether.json"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tether.json"));
    }

    #[test]
    fn json_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!("tether-config-{}.json", std::process::id()));
        let mut config = AppConfig::default();
        config.leak_check_on_shutdown = false;
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let loaded = AppConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
