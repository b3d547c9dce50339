//! Configuration management.
//!
//! A consumer process is configured from a TOML file:
//!
//! ```toml
//! [connection]
//! host = "127.0.0.1"
//! port = 6379
//! database = 0
//! protocol = "resp3"
//!
//! [consumer]
//! table = "PORT"
//! pop_batch_size = 128
//!
//! [consumer.retry]
//! max_attempts = 0
//! backoff_ms = 0
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! Every section and key is optional; missing values take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::initializer::RetryPolicy;
use crate::naming::TABLE_NAME_SEPARATOR;

/// Default number of keys claimed per batch.
pub const DEFAULT_POP_BATCH_SIZE: usize = 128;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store connection.
    pub connection: ConnectionConfig,
    /// Consumed table and batching.
    pub consumer: ConsumerConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;
        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connection.port == 0 {
            return Err(Error::Config("port cannot be 0".to_string()));
        }
        if self.connection.buffer_size == 0 {
            return Err(Error::Config("buffer size cannot be 0".to_string()));
        }
        self.consumer.validate()
    }
}

/// Settings of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Logical table name.
    pub table: String,
    /// Maximum keys claimed per batch.
    pub pop_batch_size: usize,
    /// Retry policy of the start-up transaction.
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            pop_batch_size: DEFAULT_POP_BATCH_SIZE,
            retry: RetryPolicy::unbounded(),
        }
    }
}

impl ConsumerConfig {
    /// Defaults for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Set the batch size.
    pub fn with_pop_batch_size(mut self, size: usize) -> Self {
        self.pop_batch_size = size;
        self
    }

    /// Set the start-up retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the consumer settings.
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::Config("consumer table cannot be empty".to_string()));
        }
        if self.table.contains(TABLE_NAME_SEPARATOR) {
            return Err(Error::Config(format!(
                "consumer table {:?} cannot contain '{}'",
                self.table, TABLE_NAME_SEPARATOR
            )));
        }
        if self.pop_batch_size == 0 {
            return Err(Error::Config("pop batch size cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub level: String,
    /// Log format.
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

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}
