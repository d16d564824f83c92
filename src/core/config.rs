//! Configuration management

use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::rate_limiter::RefillMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid pool configuration: {0}")]
    InvalidPool(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from the process arguments
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(&CliArgs::parse())
    }

    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load_from_args(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Example: SOURCE_RUNTIME_POOL__MAX_POOL_SIZE=8
        builder = builder.add_source(
            Environment::with_prefix("SOURCE_RUNTIME")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(data_dir) = &cli_args.data_dir {
            builder = builder.set_override("storage.data_dir", data_dir.display().to_string())?;
        }
        if let Some(db) = &cli_args.preferences_db {
            builder = builder.set_override("storage.preferences_db", db.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }
        if let Some(max_pool_size) = cli_args.max_pool_size {
            builder = builder.set_override("pool.max_pool_size", max_pool_size as u64)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self, ConfigError> {
        let config: Config = with_defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.logging.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

fn with_defaults(builder: Builder<DefaultState>) -> Result<Builder<DefaultState>, ConfigError> {
    Ok(builder
        .set_default("pool.max_pool_size", 5)?
        .set_default("pool.max_concurrent_executions", 3)?
        .set_default("pool.max_cache_size_bytes", 10485760)? // 10 MB
        .set_default("pool.evaluation_timeout_secs", 30)?
        .set_default("pool.estimated_engine_memory_bytes", 33554432)? // 32 MB
        .set_default("rate_limit.capacity", 5)?
        .set_default("rate_limit.refill_rate_ms", 1000)?
        .set_default("rate_limit.refill_mode", "compatible")?
        .set_default("retry.max_retries", 3)?
        .set_default("retry.initial_backoff_ms", 1000)?
        .set_default("retry.max_backoff_ms", 10000)?
        .set_default("retry.retry_on_403", true)?
        .set_default("retry.request_timeout_secs", 20)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("storage.data_dir", "./data")?
        .set_default("storage.preferences_db", "./data/preferences.db")?
        .set_default("storage.busy_timeout_ms", 5000)?)
}

/// Command-line arguments for configuration override
#[derive(Debug, Parser)]
#[command(name = "source-runtime")]
#[command(about = "Runtime resource manager for source plugins", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Preference database path
    #[arg(long, value_name = "PATH", global = true)]
    pub preferences_db: Option<PathBuf>,

    /// Maximum number of pooled engines
    #[arg(long, value_name = "N", global = true)]
    pub max_pool_size: Option<usize>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the engine provider snapshot
    Status,
    /// Print the persisted rate bucket for a source
    Bucket {
        /// Source key
        source: String,
    },
    /// Evaluate a script file through the engine pool
    Eval {
        /// Script file
        file: PathBuf,
        /// Pool key to run under
        #[arg(long, default_value = "cli")]
        key: String,
    },
    /// Fetch a URL through the rate limiter and challenge-aware executor
    Fetch {
        /// Target URL
        url: String,
        /// Source key (defaults to the URL host)
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub max_concurrent_executions: usize,
    pub max_cache_size_bytes: u64,
    pub evaluation_timeout_secs: u64,
    pub estimated_engine_memory_bytes: u64,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::InvalidPool("max_pool_size must be greater than 0".to_string()));
        }

        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::InvalidPool(
                "max_concurrent_executions must be greater than 0".to_string(),
            ));
        }

        if self.max_cache_size_bytes == 0 {
            return Err(ConfigError::InvalidPool("max_cache_size_bytes must be greater than 0".to_string()));
        }

        if self.evaluation_timeout_secs == 0 {
            return Err(ConfigError::InvalidPool(
                "evaluation_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            max_concurrent_executions: 3,
            max_cache_size_bytes: 10 * 1024 * 1024,
            evaluation_timeout_secs: 30,
            estimated_engine_memory_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_rate_ms: u64,
    pub refill_mode: RefillMode,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit("capacity must be greater than 0".to_string()));
        }

        if self.refill_rate_ms == 0 {
            return Err(ConfigError::InvalidRateLimit("refill_rate_ms must be greater than 0".to_string()));
        }

        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_rate_ms: 1000,
            refill_mode: RefillMode::Compatible,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_on_403: bool,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidRetry("initial_backoff_ms must be greater than 0".to_string()));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidRetry("request_timeout_secs must be greater than 0".to_string()));
        }

        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidRetry(
                "max_backoff_ms must not be smaller than initial_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
            retry_on_403: true,
            request_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub preferences_db: PathBuf,
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("data_dir cannot be empty".to_string()));
        }

        if self.preferences_db.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("preferences_db cannot be empty".to_string()));
        }

        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::InvalidStorage("busy_timeout_ms must be greater than 0".to_string()));
        }

        Ok(())
    }
}
