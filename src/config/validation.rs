// Configuration validation
//
// Runs before any connection is attempted so a missing bucket or a bad
// rate fails the run immediately.

use super::*;
use anyhow::{bail, Result};

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_source_config(&config.source)?;
    validate_transform_config(&config.transform)?;
    validate_storage_config(&config.storage)?;

    if config.state.path.trim().is_empty() {
        bail!(
            "Watermark state path is required\n\n\
            How to fix:\n\
              • Environment: export {}STATE_PATH=state/last_watermark.txt\n\
              • TOML: [state]\n              path = \"state/last_watermark.txt\"",
            ENV_PREFIX
        );
    }

    Ok(())
}

fn validate_source_config(config: &SourceConfig) -> Result<()> {
    if config.table.trim().is_empty() {
        bail!(
            "Source table is required\n\n\
            How to fix:\n\
              • Environment: export {}TABLE_NAME=public.orders\n\
              • TOML: [source]\n              table = \"public.orders\"",
            ENV_PREFIX
        );
    }

    if config.watermark_column.trim().is_empty() {
        bail!(
            "Watermark column is required\n\n\
            How to fix:\n\
              • Environment: export {}WATERMARK_COLUMN=updated_at\n\
              • TOML: [source]\n              watermark_column = \"updated_at\"",
            ENV_PREFIX
        );
    }

    if config.port == 0 {
        bail!("source.port must be greater than 0");
    }

    Ok(())
}

fn validate_transform_config(config: &TransformConfig) -> Result<()> {
    if !config.usd_to_inr.is_finite() || config.usd_to_inr <= 0.0 {
        bail!(
            "transform.usd_to_inr must be a positive number, got {}",
            config.usd_to_inr
        );
    }

    if config.amount_column.trim().is_empty() {
        bail!("transform.amount_column must not be empty");
    }

    if config.converted_column.trim().is_empty() {
        bail!("transform.converted_column must not be empty");
    }

    if config.converted_column == config.amount_column {
        bail!(
            "transform.converted_column '{}' would overwrite the amount column",
            config.converted_column
        );
    }

    Ok(())
}

/// Settings that are valid but probably unintended.
///
/// Collected rather than logged so callers can report them once tracing is up.
pub fn config_warnings(config: &RuntimeConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.source.password.is_empty() {
        warnings.push(format!(
            "source.password is empty for user '{}'; relying on trust or peer authentication",
            config.source.user
        ));
    }

    if config
        .transform
        .datetime_columns
        .as_ref()
        .is_some_and(|columns| columns.is_empty())
    {
        warnings.push("transform.datetime_columns is empty; no columns will be normalized".into());
    }

    warnings
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    if config.file_prefix.trim().is_empty() {
        bail!("storage.file_prefix must not be empty");
    }

    match config.backend {
        StorageBackend::Fs => {
            let fs = config
                .fs
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("fs storage backend requires 'fs' configuration"))?;

            if fs.path.is_empty() {
                bail!(
                    "Filesystem path is required\n\n\
                    How to fix:\n\
                      • Environment: export {}STORAGE_PATH=/data/lake\n\
                      • TOML: [storage.fs]\n              path = \"/data/lake\"",
                    ENV_PREFIX
                );
            }
        }
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("s3 storage backend requires 's3' configuration"))?;

            if s3.bucket.is_empty() {
                bail!(
                    "S3 bucket name is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_BUCKET=my-bucket\n\
                      • TOML: [storage.s3]\n              bucket = \"my-bucket\"",
                    ENV_PREFIX
                );
            }

            if s3.region.is_empty() {
                bail!(
                    "S3 region is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_REGION=us-east-1 (or AWS_REGION)\n\
                      • TOML: [storage.s3]\n              region = \"us-east-1\"",
                    ENV_PREFIX
                );
            }
        }
    }

    Ok(())
}
