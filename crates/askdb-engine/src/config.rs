//! Configuration for the askdb engine.
//!
//! Loads from:
//! 1. config.yaml - operational settings (database, model, limits, logging)
//! 2. .env file - secrets (API keys)
//!
//! Environment variables always override config.yaml values. Per-session
//! parameters (temperature, token ceiling, row limits, timeouts) are fixed
//! at session start and never change mid-session.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub use askdb_guard::GuardConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Model call configuration. Query synthesis is latency-sensitive, so it
/// carries its own temperature and token ceiling, distinct from any other
/// generation task an embedding application might run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Prior turns included in the prompt context.
    pub history_turns: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 1000,
            timeout_ms: 30_000,
            history_turns: 5,
        }
    }
}

/// Execution configuration for the DuckDB gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub database_path: String,

    /// LIMIT ceiling injected/clamped by the validator.
    pub row_limit_ceiling: u64,

    /// Wall-clock budget per query.
    pub timeout_ms: u64,

    /// Hard cap on fetched rows, independent of the injected LIMIT.
    pub max_fetch_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            database_path: "data/askdb.duckdb".to_string(),
            row_limit_ceiling: 500,
            timeout_ms: 30_000,
            max_fetch_rows: 10_000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific.
    pub level: String,

    /// Output format: pretty, json, compact.
    pub format: String,

    /// Output destination: stdout, file, both.
    pub output: String,

    /// Directory for log files.
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment
    /// overrides. A missing file yields defaults plus overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables override file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("ASKDB_DATABASE_PATH") {
            self.execution.database_path = path;
        }
        if let Ok(model) = std::env::var("ASKDB_MODEL") {
            self.model.model = model;
        }
        if let Ok(ceiling) = std::env::var("ASKDB_ROW_LIMIT") {
            if let Ok(value) = ceiling.parse() {
                self.execution.row_limit_ceiling = value;
            }
        }
        if let Ok(level) = std::env::var("ASKDB_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// OpenAI API key from the environment or a `.env` file. Never stored in
    /// the config file.
    pub fn openai_api_key() -> Result<String, ConfigError> {
        dotenvy::dotenv().ok();
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.execution.row_limit_ceiling, 500);
        assert!(config.model.temperature < 0.5);
        assert!(config.guard.block_threshold > config.guard.flag_threshold);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "execution:\n  database_path: /tmp/x.duckdb\n  row_limit_ceiling: 100\n  timeout_ms: 1000\n  max_fetch_rows: 50\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.execution.row_limit_ceiling, 100);
        assert_eq!(config.model.history_turns, ModelConfig::default().history_turns);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("/definitely/not/here.yaml").unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
