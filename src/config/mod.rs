// pg2parquet configuration
//
// Supports configuration from multiple sources:
// 1. CLI flags (highest priority, applied by the binary)
// 2. Environment variables (PG2PARQUET_* prefix)
// 3. Config file path from PG2PARQUET_CONFIG env var
// 4. Config file contents from PG2PARQUET_CONFIG_CONTENT env var
// 5. Default config file location (./pg2parquet.toml)
// 6. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Source database connection and extraction settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Table to extract from, optionally schema-qualified (`public.orders`)
    pub table: String,
    /// Monotonic column driving incremental extraction
    pub watermark_column: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            table: "public.orders".to_string(),
            watermark_column: "updated_at".to_string(),
        }
    }
}

impl SourceConfig {
    /// Connection target for logs and errors (never includes the password)
    pub fn display_target(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &redact_secret(&self.password))
            .field("table", &self.table)
            .field("watermark_column", &self.watermark_column)
            .finish()
    }
}

/// Row normalization and enrichment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Conversion rate applied to the amount column
    pub usd_to_inr: f64,
    /// Required numeric column; rows where it is null are dropped
    pub amount_column: String,
    /// Derived column holding `amount * usd_to_inr`
    pub converted_column: String,
    /// Business date used for partitioning when present in the schema
    pub partition_column: String,
    /// Explicit datetime columns. When unset, columns are matched by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime_columns: Option<Vec<String>>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            usd_to_inr: 83.0,
            amount_column: "amount_usd".to_string(),
            converted_column: "amount_inr".to_string(),
            partition_column: "order_ts".to_string(),
            datetime_columns: None,
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Key prefix under which partitions are laid out
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Artifact file name prefix, followed by the run id
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

fn default_prefix() -> String {
    "raw".to_string()
}

fn default_file_prefix() -> String {
    "orders".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            prefix: default_prefix(),
            file_prefix: default_file_prefix(),
            fs: None,
            s3: Some(S3Config::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" => Ok(StorageBackend::S3),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, s3", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint: None,
        }
    }
}

/// Watermark state location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: "state/last_watermark.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from a specific file path (for CLI usage).
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Merge another config into this one (used for TOML layering).
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.source = other.source;
        self.transform = other.transform;
        self.storage = other.storage;
        self.state = other.state;
        self.logging = other.logging;
    }

    /// Apply environment overrides from a custom source.
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Build a configuration from optional inline TOML plus overrides
    /// supplied by an `EnvSource`.
    pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(inline) = inline_config {
            let file_config: RuntimeConfig =
                toml::from_str(inline).context("Failed to parse inline config content")?;
            config.merge(file_config);
        }

        config.apply_env_overrides_from(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Non-fatal configuration warnings.
    pub fn warnings(&self) -> Vec<String> {
        validation::config_warnings(self)
    }

    /// Emit [`warnings`](Self::warnings) through `tracing`. Call after the
    /// subscriber is installed.
    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            tracing::warn!("{}", warning);
        }
    }
}

/// Mask a secret for diagnostics, keeping only its length visible.
pub fn redact_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("<redacted:{} chars>", secret.chars().count())
    }
}
