//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vigil_telemetry::{StorageBackend, TelemetryConfig};

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: HttpConfig,

    /// Telemetry pipeline configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Overrides taken from the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub retention_days: Option<i64>,
}

impl ServerConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        // Try to load from file, or use defaults
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply(overrides);
        config.telemetry.validate()?;
        Ok(config)
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(listen) = &overrides.listen {
            self.http.listen = listen.clone();
        }
        if let Some(port) = overrides.port {
            self.http.port = port;
        }
        // A data directory implies file-backed storage
        if let Some(dir) = &overrides.data_dir {
            self.telemetry.storage.backend = StorageBackend::Jsonl;
            self.telemetry.storage.persistence.data_dir = dir.clone();
        }
        if let Some(days) = overrides.retention_days {
            self.telemetry.retention.days_to_keep = days;
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Largest `hours` accepted by the rollups endpoint
    #[serde(default = "default_max_rollup_hours")]
    pub max_rollup_hours: i64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_rollup_hours: default_max_rollup_hours(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9464
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_rollup_hours() -> i64 {
    24 * 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load("/nonexistent/vigil.yaml", &Overrides::default()).unwrap();
        assert_eq!(config.http.port, 9464);
        assert_eq!(config.telemetry.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_yaml_with_overrides() {
        let yaml = r#"
http:
  port: 8081
telemetry:
  health:
    error_budget: 4
  retention:
    days_to_keep: 60
"#;
        let mut config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.http.port, 8081);
        assert_eq!(config.http.listen, "0.0.0.0");
        assert_eq!(config.telemetry.health.error_budget, 4);

        config.apply(&Overrides {
            data_dir: Some(PathBuf::from("/var/lib/vigil")),
            retention_days: Some(14),
            ..Overrides::default()
        });
        assert_eq!(config.telemetry.storage.backend, StorageBackend::Jsonl);
        assert_eq!(config.telemetry.retention.days_to_keep, 14);
    }
}
