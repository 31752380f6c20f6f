//! Configuration loading
//!
//! Layers, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. TOML file (`$PROCGOV_CONFIG`, or `procgov.toml` in the working directory if present)
//! 3. Environment variables, `PROCGOV__<SECTION>__<KEY>`, e.g. `PROCGOV__ADMISSION__LIMITS__MAX_TOTAL=20`

use crate::retry::circuit::CircuitBreakerConfig;
use crate::retry::coordinator::RetryConfig;
use crate::runtime::admission::AdmissionConfig;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::telemetry::monitor::MonitorConfig;
use crate::utils::errors::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PROCGOV_CONFIG";

/// Config file used when `PROCGOV_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "procgov.toml";

const ENV_PREFIX: &str = "PROCGOV";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` overrides it
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener, e.g. `127.0.0.1:9464`. Disabled when unset.
    pub prometheus_listen: Option<String>,
}

/// Complete governor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub admission: AdmissionConfig,
    pub limits: ResourceLimits,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl GovernorConfig {
    /// Load from `$PROCGOV_CONFIG` (required if set) or `procgov.toml` (optional)
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from(Some(&PathBuf::from(path)), true),
            None => Self::load_from(Some(Path::new(DEFAULT_CONFIG_FILE)), false),
        }
    }

    /// Load from an explicit file plus environment overrides
    pub fn load_from(path: Option<&Path>, required: bool) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if required && !path.exists() {
                return Err(GovernorError::ConfigError(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GovernorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        let sections: [(&str, std::result::Result<(), String>); 5] = [
            ("admission", self.admission.validate()),
            ("limits", self.limits.validate()),
            ("monitor", self.monitor.validate()),
            ("retry", self.retry.validate()),
            ("circuit", self.circuit.validate()),
        ];

        for (section, result) in sections {
            result.map_err(|e| GovernorError::ConfigError(format!("[{}] {}", section, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GovernorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.limits.max_ai_assistant, 5);
        assert_eq!(config.admission.limits.max_total, 12);
        assert_eq!(config.limits.violation_threshold, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[admission.limits]
max_ai_assistant = 2
max_total = 6
warning_threshold = 5

[limits]
execution_timeout_ms = 60000

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = GovernorConfig::load_from(Some(file.path()), true).unwrap();
        assert_eq!(config.admission.limits.max_ai_assistant, 2);
        assert_eq!(config.admission.limits.max_total, 6);
        assert_eq!(config.admission.limits.max_test_runner_a, 3);
        assert_eq!(config.limits.execution_timeout_ms, 60_000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[limits]\ncpu_kill_percent = 50.0").unwrap();

        let err = GovernorConfig::load_from(Some(file.path()), true).unwrap_err();
        assert!(err.to_string().contains("[limits]"));
    }

    #[test]
    fn test_missing_required_file() {
        let result = GovernorConfig::load_from(Some(Path::new("/nonexistent/procgov.toml")), true);
        assert!(matches!(result, Err(GovernorError::ConfigError(_))));
    }
}
