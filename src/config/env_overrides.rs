use super::{FsConfig, LogFormat, RuntimeConfig, S3Config, StorageBackend};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "PG2PARQUET_";

/// Unprefixed names read from the process environment when the prefixed
/// variable is unset, so deployments configured with bare names keep working.
const LEGACY_KEYS: [&str; 10] = [
    "PG_HOST",
    "PG_PORT",
    "PG_DB",
    "PG_USER",
    "PG_PASSWORD",
    "TABLE_NAME",
    "WATERMARK_COLUMN",
    "USD_TO_INR",
    "S3_BUCKET",
    "S3_PREFIX",
];

/// Abstraction over environment-variable lookups so tests can supply
/// overrides without touching the process environment.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the PG2PARQUET_ prefix
    /// Used for AWS standard variables (AWS_REGION, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Source database
    if let Some(host) = get_env_string(env, "PG_HOST") {
        config.source.host = host;
    }
    if let Some(port) = get_env_u16(env, "PG_PORT")? {
        config.source.port = port;
    }
    if let Some(db) = get_env_string(env, "PG_DB") {
        config.source.database = db;
    }
    if let Some(user) = get_env_string(env, "PG_USER") {
        config.source.user = user;
    }
    if let Some(password) = get_env_string(env, "PG_PASSWORD") {
        config.source.password = password;
    }
    if let Some(table) = get_env_string(env, "TABLE_NAME") {
        config.source.table = table;
    }
    if let Some(column) = get_env_string(env, "WATERMARK_COLUMN") {
        config.source.watermark_column = column;
    }

    // Transform
    if let Some(rate) = get_env_f64(env, "USD_TO_INR")? {
        config.transform.usd_to_inr = rate;
    }
    if let Some(column) = get_env_string(env, "AMOUNT_COLUMN") {
        config.transform.amount_column = column;
    }
    if let Some(column) = get_env_string(env, "CONVERTED_COLUMN") {
        config.transform.converted_column = column;
    }
    if let Some(column) = get_env_string(env, "PARTITION_COLUMN") {
        config.transform.partition_column = column;
    }
    if let Some(list) = get_env_string(env, "DATETIME_COLUMNS") {
        config.transform.datetime_columns = parse_column_list(&list);
    }

    // Storage backend
    if let Some(backend) = get_env_string(env, "STORAGE_BACKEND") {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid PG2PARQUET_STORAGE_BACKEND value")?;
    }
    if let Some(path) = get_env_string(env, "STORAGE_PATH") {
        config.storage.fs.get_or_insert_with(FsConfig::default).path = path;
    }
    if let Some(prefix) = get_env_string(env, "S3_PREFIX") {
        config.storage.prefix = normalize_prefix(&prefix);
    }
    if let Some(file_prefix) = get_env_string(env, "FILE_PREFIX") {
        config.storage.file_prefix = file_prefix;
    }

    // S3 storage
    if let Some(bucket) = get_env_string(env, "S3_BUCKET") {
        ensure_s3(config).bucket = bucket;
    }
    // AWS standard region (without PG2PARQUET_ prefix for compatibility),
    // superseded by the prefixed variable when both are set
    if let Some(region) = env.get_raw("AWS_REGION") {
        ensure_s3(config).region = region;
    }
    if let Some(region) = get_env_string(env, "S3_REGION") {
        ensure_s3(config).region = region;
    }
    if let Some(endpoint) = get_env_string(env, "S3_ENDPOINT") {
        ensure_s3(config).endpoint = Some(endpoint);
    }

    // State and logging
    if let Some(path) = get_env_string(env, "STATE_PATH") {
        config.state.path = path;
    }
    if let Some(level) = get_env_string(env, "LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT") {
        config.logging.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn ensure_s3(config: &mut RuntimeConfig) -> &mut S3Config {
    config.storage.s3.get_or_insert_with(S3Config::default)
}

/// Value of `key` plus the variable name it was read from. The prefixed
/// name wins over a legacy bare name.
fn lookup<E: EnvSource>(env: &E, key: &str) -> Option<(String, String)> {
    if let Some(val) = env.get(key) {
        return Some((format!("{ENV_PREFIX}{key}"), val));
    }
    if LEGACY_KEYS.contains(&key) {
        return env.get_raw(key).map(|val| (key.to_string(), val));
    }
    None
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    lookup(env, key).map(|(_, val)| val)
}

fn get_env_u16<E: EnvSource>(env: &E, key: &str) -> Result<Option<u16>> {
    match lookup(env, key) {
        Some((name, val)) => {
            let parsed = val
                .trim()
                .parse::<u16>()
                .map_err(|e| anyhow!("Failed to parse {}: {}", name, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_f64<E: EnvSource>(env: &E, key: &str) -> Result<Option<f64>> {
    match lookup(env, key) {
        Some((name, val)) => {
            let parsed = val
                .trim()
                .parse::<f64>()
                .map_err(|e| anyhow!("Failed to parse {} (expected number): {}", name, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Object keys are joined with `/`, so surrounding slashes are dropped.
fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

fn parse_column_list(list: &str) -> Option<Vec<String>> {
    let columns: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if columns.is_empty() {
        None
    } else {
        Some(columns)
    }
}
