//! Configuration loading from `~/.piconet/config.toml` with defaults.

use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application id used when none is configured. Every deployment should
/// override it, otherwise unrelated applications will find each other.
pub const DEFAULT_APPLICATION_ID: &str = "PROVIDE_UNIQUE_ID";

/// Default UDP/TCP port shared by discovery and peer connections.
pub const DEFAULT_PORT: u16 = 10515;

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Namespace filter; peers with a different id are ignored.
    pub application_id: String,
    /// Port for broadcasts and connections.
    pub network_port: u16,
    /// Period between discovery broadcasts.
    pub broadcast_interval_ms: u64,
    /// Period between pump ticks.
    pub pump_interval_ms: u64,
    /// Use dual-stack sockets and advertise over IPv6 as well.
    pub ipv6_enabled: bool,
    /// Start the service as soon as it is initialised.
    pub auto_start: bool,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            network_port: DEFAULT_PORT,
            broadcast_interval_ms: 3000,
            pump_interval_ms: 32,
            ipv6_enabled: false,
            auto_start: true,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Default configuration with the given application id.
    pub fn with_application_id(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            ..Self::default()
        }
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.application_id.trim().is_empty() {
            return Err(ServiceError::Config(
                "application_id must not be empty".to_string(),
            ));
        }
        if self.network_port == 0 {
            return Err(ServiceError::Config(
                "network_port must be non-zero".to_string(),
            ));
        }
        if self.broadcast_interval_ms == 0 {
            return Err(ServiceError::Config(
                "broadcast_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.pump_interval_ms == 0 {
            return Err(ServiceError::Config(
                "pump_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load service configuration from a TOML file, with defaults.
///
/// A missing, unreadable or unparsable file yields the defaults.
pub fn load_config(path: Option<&Path>) -> ServiceConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return ServiceConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ServiceConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                ServiceConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            ServiceConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".piconet")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.application_id, "PROVIDE_UNIQUE_ID");
        assert_eq!(config.network_port, 10515);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(3));
        assert_eq!(config.pump_interval(), Duration::from_millis(32));
        assert!(!config.ipv6_enabled);
        assert!(config.auto_start);
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "application_id = \"chat\"").unwrap();
        writeln!(f, "network_port = 9000").unwrap();
        writeln!(f, "ipv6_enabled = true").unwrap();
        drop(f);

        let config = load_config(Some(&path));
        assert_eq!(config.application_id, "chat");
        assert_eq!(config.network_port, 9000);
        assert!(config.ipv6_enabled);
        // Unset keys keep their defaults.
        assert_eq!(config.broadcast_interval_ms, 3000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "network_port = \"not a number\"").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_validate() {
        assert_ok!(ServiceConfig::with_application_id("X").validate());

        let mut config = ServiceConfig::with_application_id("  ");
        assert!(matches!(config.validate(), Err(ServiceError::Config(_))));

        config.application_id = "X".to_string();
        config.network_port = 0;
        assert_err!(config.validate());

        config.network_port = 9000;
        config.pump_interval_ms = 0;
        assert_err!(config.validate());

        config.pump_interval_ms = 32;
        config.broadcast_interval_ms = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".piconet/config.toml"));
    }
}
