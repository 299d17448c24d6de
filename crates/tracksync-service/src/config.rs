//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// External telemetry source.
    pub telemetry: TelemetryConfig,
    /// Background ingestion.
    pub ingest: IngestConfig,
    /// Mock telemetry server.
    pub mock: MockConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem at once.
    ///
    /// # Example
    ///
    /// ```
    /// use tracksync_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.telemetry.validate());
        errors.extend(self.ingest.validate());
        errors.extend(self.mock.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Directory served under `/icons`.
    pub icons_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            icons_dir: PathBuf::from("./icons"),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_bind("server.bind", &self.bind)
            .into_iter()
            .collect()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Deadline for a single store operation, in milliseconds.
    pub op_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: tracksync_store::default_db_path(),
            op_timeout_ms: 10_000,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        if self.op_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "storage.op_timeout_ms".to_string(),
                message: "operation timeout must be greater than 0".to_string(),
            });
        }

        errors
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// External telemetry source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Snapshot endpoint.
    pub url: String,
    /// API key, appended verbatim to `url`.
    pub api_key: String,
    /// Deadline for one snapshot fetch, in seconds.
    pub timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8081/api/v1/devices".to_string(),
            api_key: String::new(),
            timeout_secs: 10,
        }
    }
}

impl TelemetryConfig {
    /// Validate telemetry configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.url.is_empty() {
            errors.push(ValidationError {
                field: "telemetry.url".to_string(),
                message: "telemetry URL cannot be empty".to_string(),
            });
        } else if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            errors.push(ValidationError {
                field: "telemetry.url".to_string(),
                message: format!(
                    "invalid telemetry URL '{}': must start with http:// or https://",
                    self.url
                ),
            });
        }

        if self.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "telemetry.timeout_secs".to_string(),
                message: "timeout must be greater than 0".to_string(),
            });
        }

        errors
    }

    /// The full snapshot URL, with the API key appended.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.url, self.api_key)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Minimum ingestion interval in seconds.
pub const MIN_INGEST_INTERVAL: u64 = 1;
/// Maximum ingestion interval in seconds (1 hour).
pub const MAX_INGEST_INTERVAL: u64 = 3600;

/// Background ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Seconds between snapshot fetches.
    pub interval_secs: u64,
    /// Whether the background ingestor starts with the server.
    pub enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

impl IngestConfig {
    /// Validate ingestion configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_secs < MIN_INGEST_INTERVAL {
            errors.push(ValidationError {
                field: "ingest.interval_secs".to_string(),
                message: format!(
                    "interval {} is too short (minimum {} second)",
                    self.interval_secs, MIN_INGEST_INTERVAL
                ),
            });
        } else if self.interval_secs > MAX_INGEST_INTERVAL {
            errors.push(ValidationError {
                field: "ingest.interval_secs".to_string(),
                message: format!(
                    "interval {} is too long (maximum {} seconds / 1 hour)",
                    self.interval_secs, MAX_INGEST_INTERVAL
                ),
            });
        }

        errors
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Mock telemetry server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Bind address for the mock server.
    pub bind: String,
    /// Seconds between mutation rounds.
    pub interval_secs: u64,
    /// Probability (0.0 to 1.0) that a round mutates anything.
    pub mutate_chance: f64,
    /// How many devices a mutating round touches.
    pub mutate_devices: usize,
    /// Snapshot file to seed the fleet from. When absent the fleet is seeded
    /// from one fetch of the telemetry source.
    pub seed_file: Option<PathBuf>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8081".to_string(),
            interval_secs: 5,
            mutate_chance: 0.3,
            mutate_devices: 2,
            seed_file: None,
        }
    }
}

impl MockConfig {
    /// Validate mock server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors: Vec<_> = validate_bind("mock.bind", &self.bind).into_iter().collect();

        if self.interval_secs == 0 {
            errors.push(ValidationError {
                field: "mock.interval_secs".to_string(),
                message: "interval must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.mutate_chance) {
            errors.push(ValidationError {
                field: "mock.mutate_chance".to_string(),
                message: format!(
                    "mutate chance {} must be between 0.0 and 1.0",
                    self.mutate_chance
                ),
            });
        }

        errors
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn validate_bind(field: &str, bind: &str) -> Option<ValidationError> {
    let error = |message: String| ValidationError {
        field: field.to_string(),
        message,
    };

    if bind.is_empty() {
        return Some(error("bind address cannot be empty".to_string()));
    }

    let Some((_, port)) = bind.rsplit_once(':') else {
        return Some(error(format!(
            "invalid bind address '{}': expected format 'host:port'",
            bind
        )));
    };

    match port.parse::<u16>() {
        Ok(0) => Some(error("port cannot be 0".to_string())),
        Err(_) => Some(error(format!(
            "invalid port '{}': must be a number 1-65535",
            port
        ))),
        Ok(_) => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `mock.mutate_chance`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tracksync")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.server.icons_dir, PathBuf::from("./icons"));
        assert_eq!(config.storage.path, tracksync_store::default_db_path());
        assert_eq!(config.storage.op_timeout(), Duration::from_secs(10));
        assert_eq!(config.ingest.interval(), Duration::from_secs(60));
        assert!(config.ingest.enabled);
        assert_eq!(config.mock.bind, "127.0.0.1:8081");
        assert_eq!(config.mock.mutate_devices, 2);
        assert!(config.mock.seed_file.is_none());
    }

    #[test]
    fn test_telemetry_endpoint_appends_key() {
        let config = TelemetryConfig {
            url: "https://api.example.com/v3/device?latest_point=true&api-key=".to_string(),
            api_key: "secret".to_string(),
            timeout_secs: 5,
        };
        assert_eq!(
            config.endpoint(),
            "https://api.example.com/v3/device?latest_point=true&api-key=secret"
        );
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [telemetry]
            url = "https://telemetry.example.com/devices?key="

            [ingest]
            interval_secs = 15
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.telemetry.url, "https://telemetry.example.com/devices?key=");
        assert_eq!(config.telemetry.timeout_secs, 10);
        assert_eq!(config.ingest.interval_secs, 15);
        assert!(config.ingest.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = Config::default();
        config.server.bind = "0.0.0.0:9090".to_string();
        config.storage.path = PathBuf::from("/tmp/test.db");
        config.ingest.enabled = false;
        config.mock.seed_file = Some(PathBuf::from("fleet.json"));

        std::fs::write(&config_path, toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(loaded.server.bind, "0.0.0.0:9090");
        assert_eq!(loaded.storage.path, PathBuf::from("/tmp/test.db"));
        assert!(!loaded.ingest.enabled);
        assert_eq!(loaded.mock.seed_file, Some(PathBuf::from("fleet.json")));
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_loaded_config_with_bad_values_fails_validation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        std::fs::write(&config_path, "[ingest]\ninterval_secs = 0\n").unwrap();

        let config = Config::load(&config_path).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("tracksync/server.toml"));
    }

    // ==========================================================================
    // Validation tests
    // ==========================================================================

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_bind_validation() {
        assert!(validate_bind("server.bind", "127.0.0.1:8080").is_none());
        assert!(validate_bind("server.bind", "[::1]:8080").is_none());
        assert!(validate_bind("server.bind", "localhost:8080").is_none());

        let error = validate_bind("server.bind", "").unwrap();
        assert!(error.message.contains("cannot be empty"));

        let error = validate_bind("server.bind", "127.0.0.1").unwrap();
        assert!(error.message.contains("host:port"));

        let error = validate_bind("mock.bind", "127.0.0.1:0").unwrap();
        assert_eq!(error.field, "mock.bind");
        assert!(error.message.contains("cannot be 0"));

        let error = validate_bind("server.bind", "127.0.0.1:abc").unwrap();
        assert!(error.message.contains("must be a number"));
    }

    #[test]
    fn test_telemetry_validation() {
        let mut config = TelemetryConfig::default();
        assert!(config.validate().is_empty());

        config.url = "ftp://example.com".to_string();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("http://"));

        config.url = String::new();
        config.timeout_secs = 0;
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn test_ingest_interval_bounds() {
        let mut config = IngestConfig::default();

        config.interval_secs = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("too short"));

        config.interval_secs = 7200;
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("too long"));

        config.interval_secs = MAX_INGEST_INTERVAL;
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_mock_validation() {
        let mut config = MockConfig::default();
        assert!(config.validate().is_empty());

        config.mutate_chance = 1.5;
        config.interval_secs = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "mock.mutate_chance"));
    }

    #[test]
    fn test_validation_collects_all_sections() {
        let mut config = Config::default();
        config.server.bind = String::new();
        config.storage.path = PathBuf::new();
        config.mock.mutate_chance = -0.1;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, ["server.bind", "storage.path", "mock.mutate_chance"]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_config_validation_error_display() {
        let errors = vec![
            ValidationError {
                field: "server.bind".to_string(),
                message: "port cannot be 0".to_string(),
            },
            ValidationError {
                field: "ingest.interval_secs".to_string(),
                message: "too long".to_string(),
            },
        ];
        let display = format!("{}", ConfigError::Validation(errors));
        assert!(display.contains("server.bind"));
        assert!(display.contains("ingest.interval_secs"));
    }
}
