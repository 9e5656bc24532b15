//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
pub use crate::ipc::BootstrapMode;

/// Environment overrides, applied after the config file.
pub const ENV_THREADED_CALLBACKS: &str = "CALLBRIDGE_THREADED_CALLBACKS";
pub const ENV_BOOTSTRAP: &str = "CALLBRIDGE_BOOTSTRAP";
pub const ENV_INTERRUPT_GRACE_MS: &str = "CALLBRIDGE_INTERRUPT_GRACE_MS";

/// Tunables for one engine session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run each inbound call on a fresh thread. When false, inbound calls run
    /// on the thread waiting for the goal that caused them.
    pub threaded_callbacks: bool,

    /// How the first goal reaches the engine.
    pub bootstrap: BootstrapMode,

    /// How long an interrupt waits for the engine before cancelling goals locally.
    pub interrupt_grace_ms: u64,

    /// Log every message crossing the channel at info level.
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threaded_callbacks: true,
            bootstrap: BootstrapMode::Sentinel,
            interrupt_grace_ms: 2000,
            debug: false,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("Invalid config '{}': {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loaded session config");
        Ok(config)
    }

    /// Apply `CALLBRIDGE_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_THREADED_CALLBACKS) {
            self.threaded_callbacks = parse_bool(ENV_THREADED_CALLBACKS, &v)?;
        }
        if let Some(v) = lookup(ENV_BOOTSTRAP) {
            self.bootstrap = v.parse()?;
        }
        if let Some(v) = lookup(ENV_INTERRUPT_GRACE_MS) {
            self.interrupt_grace_ms = v.trim().parse().map_err(|e| {
                Error::Config(format!("{} must be milliseconds: {}", ENV_INTERRUPT_GRACE_MS, e))
            })?;
        }
        Ok(self)
    }

    pub fn with_threaded_callbacks(mut self, threaded: bool) -> Self {
        self.threaded_callbacks = threaded;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapMode) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(config.threaded_callbacks);
        assert_eq!(config.bootstrap, BootstrapMode::Sentinel);
        assert_eq!(config.interrupt_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bootstrap": "direct", "debug": true}}"#).unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.bootstrap, BootstrapMode::Direct);
        assert!(config.debug);
        assert!(config.threaded_callbacks);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            SessionConfig::load(file.path()),
            Err(Error::Config(_))
        ));
        assert!(SessionConfig::load("/nonexistent/callbridge.json").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_THREADED_CALLBACKS, "off"),
            (ENV_BOOTSTRAP, "direct"),
            (ENV_INTERRUPT_GRACE_MS, "150"),
        ]
        .into_iter()
        .collect();

        let config = SessionConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.threaded_callbacks);
        assert_eq!(config.bootstrap, BootstrapMode::Direct);
        assert_eq!(config.interrupt_grace_ms, 150);
    }

    #[test]
    fn test_bad_override() {
        let result = SessionConfig::default()
            .with_overrides(|k| (k == ENV_THREADED_CALLBACKS).then(|| "maybe".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
