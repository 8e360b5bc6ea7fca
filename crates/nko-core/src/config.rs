//! Pipeline Configuration Management
//!
//! Handles configuration from environment variables and TOML config files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{CostModel, RetryPolicy};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Hosted database (REST) configuration
    pub database: DatabaseConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Batch and stage configuration
    pub pipeline: PipelineConfig,

    /// Retry presets per collaborator
    pub retry: RetryConfig,

    /// Cost estimation constants
    pub cost: CostModel,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.batch_size".to_string(),
                value: "0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.pipeline.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.similarity_threshold".to_string(),
                value: self.pipeline.similarity_threshold.to_string(),
            });
        }
        for (name, policy) in [
            ("retry.llm", &self.retry.llm),
            ("retry.database", &self.retry.database),
            ("retry.network", &self.retry.network),
        ] {
            policy.validate().map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                value: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Database
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var("SUPABASE_KEY") {
            self.database.api_key = Some(key);
        }
        if let Ok(table) = std::env::var("DETECTIONS_TABLE") {
            self.database.detections_table = table;
        }
        if let Ok(table) = std::env::var("TRAJECTORIES_TABLE") {
            self.database.trajectories_table = table;
        }

        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.llm.gemini_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }

        // Pipeline
        if let Ok(dir) = std::env::var("NKO_DATA_DIR") {
            self.pipeline.data_dir = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("NKO_BATCH_SIZE") {
            self.pipeline.batch_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NKO_BATCH_SIZE".to_string(),
                value: size,
            })?;
        }
        if let Ok(threshold) = std::env::var("NKO_SIMILARITY_THRESHOLD") {
            self.pipeline.similarity_threshold =
                threshold.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "NKO_SIMILARITY_THRESHOLD".to_string(),
                    value: threshold,
                })?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }
}

/// Hosted database configuration (PostgREST-style API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Service base URL
    pub url: String,

    /// Service API key
    pub api_key: Option<String>,

    /// Table holding raw detections
    pub detections_table: String,

    /// Table receiving generated worlds
    pub trajectories_table: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: None,
            detections_table: "nko_detections".to_string(),
            trajectories_table: "nko_trajectories".to_string(),
            timeout_secs: 30,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// Gemini API key
    pub gemini_api_key: Option<String>,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// Override for the provider base URL
    pub base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Gemini,
            gemini_api_key: None,
            openai_api_key: None,
            base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "gemini-2.0-flash".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Gemini,
    OpenAI,
    Ollama,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Batch and stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding stage artifacts
    pub data_dir: PathBuf,

    /// Items per checkpointed batch
    pub batch_size: usize,

    /// Character-set similarity needed to merge phrases
    pub similarity_threshold: f64,

    /// Rows requested per upstream page
    pub page_size: usize,

    /// Input cap applied in test mode
    pub test_limit: usize,

    /// Pause between items within a batch
    pub inter_item_delay_ms: u64,

    /// Pause between batches
    pub inter_batch_delay_ms: u64,

    /// Worlds requested per phrase
    pub worlds_per_phrase: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            batch_size: 10,
            similarity_threshold: 0.85,
            page_size: 1000,
            test_limit: 5,
            inter_item_delay_ms: 500,
            inter_batch_delay_ms: 2000,
            worlds_per_phrase: 5,
        }
    }
}

impl PipelineConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn detections_path(&self) -> PathBuf {
        self.data_dir.join("detections.json")
    }

    pub fn vocabulary_path(&self) -> PathBuf {
        self.data_dir.join("vocabulary.json")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("generation_checkpoint.json")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.data_dir.join("generation_progress.json")
    }
}

/// Named retry presets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Generative-AI API
    pub llm: RetryPolicy,

    /// Hosted database API
    pub database: RetryPolicy,

    /// Generic network calls
    ///
    /// Reserved: every current collaborator is either the LLM or the
    /// database. Still validated so a bad override fails at startup.
    pub network: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            llm: RetryPolicy::llm(),
            database: RetryPolicy::database(),
            network: RetryPolicy::network(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {message}", path.display())]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl From<ConfigError> for crate::NkoError {
    fn from(err: ConfigError) -> Self {
        crate::NkoError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.pipeline.similarity_threshold, 0.85);
        assert_eq!(config.pipeline.test_limit, 5);
        assert_eq!(config.retry.database.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_provider_parse() {
        assert_eq!(
            "gemini".parse::<LlmProvider>().unwrap(),
            LlmProvider::Gemini
        );
        assert_eq!(
            "OpenAI".parse::<LlmProvider>().unwrap(),
            LlmProvider::OpenAI
        );
        assert!("invalid".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [pipeline]
            batch_size = 25
            similarity_threshold = 0.9

            [retry.llm]
            max_retries = 1
            base_delay_secs = 0.5
            max_delay_secs = 10.0
            jitter_secs = 0.0
            retry_on = ["transient"]
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.batch_size, 25);
        assert_eq!(config.pipeline.page_size, 1000);
        assert_eq!(config.retry.llm.max_retries, 1);
        assert_eq!(config.retry.database.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_checks_every_retry_preset() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [retry.network]
            max_retries = 2
            base_delay_secs = 5.0
            max_delay_secs = 30.0
            jitter_secs = 0.5
            retry_on = ["transient", "rate_limited"]
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.network.max_retries, 2);
        assert_eq!(config.retry.llm, RetryPolicy::llm());
        assert!(config.validate().is_ok());

        config.retry.network.jitter_secs = 1e12;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.network"));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = AppConfig::default();
        config.pipeline.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        config.pipeline.similarity_threshold = 0.85;
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_artifact_paths() {
        let config = PipelineConfig {
            data_dir: PathBuf::from("/tmp/nko"),
            ..Default::default()
        };
        assert_eq!(
            config.vocabulary_path(),
            PathBuf::from("/tmp/nko/vocabulary.json")
        );
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/tmp/nko/generation_checkpoint.json")
        );
    }
}
