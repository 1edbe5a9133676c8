//! Storage operator initialization.

use crate::config::{StorageBackend, StorageConfig};
use crate::error::PipelineError;

/// Build an OpenDAL operator for the configured backend.
///
/// S3 credentials come from the standard AWS environment and profile chain.
pub fn build_operator(config: &StorageConfig) -> Result<opendal::Operator, PipelineError> {
    let operator = match config.backend {
        StorageBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                PipelineError::configuration("fs config required for filesystem backend")
            })?;

            let fs_builder = opendal::services::Fs::default().root(&fs.path);
            opendal::Operator::new(fs_builder)
                .map_err(|e| {
                    PipelineError::connection(
                        format!("fs://{}", fs.path),
                        format!("Failed to create filesystem operator: {}", e),
                    )
                })?
                .finish()
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                PipelineError::configuration("s3 config required for S3 backend")
            })?;

            let mut s3_builder = opendal::services::S3::default()
                .bucket(&s3.bucket)
                .region(&s3.region);

            if let Some(endpoint) = &s3.endpoint {
                s3_builder = s3_builder.endpoint(endpoint);
            }

            opendal::Operator::new(s3_builder)
                .map_err(|e| {
                    PipelineError::connection(
                        format!("s3://{}", s3.bucket),
                        format!("Failed to create S3 operator: {}", e),
                    )
                })?
                .finish()
        }
    };

    tracing::debug!(backend = %config.backend, "Storage operator initialized");
    Ok(operator)
}
