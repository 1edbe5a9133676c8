// Initialization utilities for the batch job
//
// Logging setup and construction of the pipeline's collaborators from config

use std::sync::Arc;

use crate::config::{LogConfig, LogFormat, RuntimeConfig, StateConfig, StorageBackend};
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::source::PostgresSource;
use crate::watermark::{FileWatermarkStore, WatermarkStore};
use crate::writer::ObjectStoreUploader;
use tracing::info;

/// Initialize tracing/logging from the logging section
pub fn init_tracing(config: &LogConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // RUST_LOG wins over the configured level when set
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Try to set the global subscriber; ignore error if already set (idempotent)
    let _ = match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}

/// File-backed watermark store at the configured path
pub fn init_store(config: &StateConfig) -> Arc<dyn WatermarkStore> {
    Arc::new(FileWatermarkStore::new(&config.path))
}

/// Storage backend for artifact uploads
pub fn init_uploader(config: &RuntimeConfig) -> Result<Arc<ObjectStoreUploader>, PipelineError> {
    match config.storage.backend {
        StorageBackend::Fs => {
            if let Some(fs) = config.storage.fs.as_ref() {
                info!("Using filesystem storage at: {}", fs.path);
            }
        }
        StorageBackend::S3 => {
            if let Some(s3) = config.storage.s3.as_ref() {
                info!(
                    "Using S3 storage: bucket={}, region={}, prefix={}",
                    s3.bucket, s3.region, config.storage.prefix
                );
            }
        }
    }

    Ok(Arc::new(ObjectStoreUploader::from_config(&config.storage)?))
}

/// Connect to the source and assemble a pipeline from a validated config
pub async fn init_pipeline(config: &RuntimeConfig, dry_run: bool) -> Result<Pipeline, PipelineError> {
    let uploader = init_uploader(config)?;
    let store = init_store(&config.state);

    info!(
        "Connecting to source {} (table={}, watermark column={})",
        config.source.display_target(),
        config.source.table,
        config.source.watermark_column
    );
    let source = Arc::new(PostgresSource::connect(&config.source).await?);

    let options = PipelineOptions::from_config(config).with_dry_run(dry_run);
    Ok(Pipeline::new(source, store, uploader, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::Watermark;

    #[test]
    fn store_uses_state_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("wm.txt");
        let store = init_store(&StateConfig {
            path: path.display().to_string(),
        });

        assert_eq!(store.read().unwrap(), Watermark::minimum());
        store.write(&Watermark::new("2025-01-01 00:00:00")).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            "2025-01-01 00:00:00"
        );
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = LogConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
