//! Publishing partition files to object storage.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::partition::{Artifact, PartitionKey};
use super::storage::build_operator;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::PipelineError;

/// Where an artifact lands in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub bucket: String,
    pub key: String,
    pub uri: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read artifact {path}: {source}")]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to put {key} into {bucket}: {source}")]
    Put {
        bucket: String,
        key: String,
        #[source]
        source: opendal::Error,
    },
}

/// Destination for partition files.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Destination of `artifact` without transferring anything.
    fn locate(&self, artifact: &Artifact) -> UploadDescriptor;

    /// Store the file's bytes under its object key. Existing objects are
    /// overwritten.
    async fn publish(&self, artifact: &Artifact) -> Result<UploadDescriptor, UploadError>;
}

/// `{prefix}/YYYY/MM/DD/{file_name}`; an empty prefix has no leading slash.
pub fn object_key(prefix: &str, key: &PartitionKey, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", key.path_segment(), file_name)
    } else {
        format!("{}/{}/{}", prefix, key.path_segment(), file_name)
    }
}

/// OpenDAL-backed uploader (S3, local filesystem, or memory in tests).
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    operator: opendal::Operator,
    bucket: String,
    prefix: String,
    scheme: &'static str,
}

impl ObjectStoreUploader {
    pub fn new(
        operator: opendal::Operator,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        scheme: &'static str,
    ) -> Self {
        Self {
            operator,
            bucket: bucket.into(),
            prefix: prefix.into(),
            scheme,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, PipelineError> {
        let operator = build_operator(config)?;
        let (bucket, scheme) = match config.backend {
            StorageBackend::Fs => (
                config.fs.as_ref().map(|fs| fs.path.clone()).unwrap_or_default(),
                "fs",
            ),
            StorageBackend::S3 => (
                config.s3.as_ref().map(|s3| s3.bucket.clone()).unwrap_or_default(),
                "s3",
            ),
        };
        Ok(Self::new(operator, bucket, config.prefix.clone(), scheme))
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    fn locate(&self, artifact: &Artifact) -> UploadDescriptor {
        let key = object_key(&self.prefix, &artifact.key, &artifact.file_name);
        UploadDescriptor {
            uri: format!("{}://{}/{}", self.scheme, self.bucket.trim_end_matches('/'), key),
            bucket: self.bucket.clone(),
            key,
        }
    }

    async fn publish(&self, artifact: &Artifact) -> Result<UploadDescriptor, UploadError> {
        let descriptor = self.locate(artifact);
        let bytes =
            tokio::fs::read(&artifact.path)
                .await
                .map_err(|source| UploadError::ReadArtifact {
                    path: artifact.path.clone(),
                    source,
                })?;

        self.operator
            .write(&descriptor.key, bytes)
            .await
            .map_err(|source| UploadError::Put {
                bucket: descriptor.bucket.clone(),
                key: descriptor.key.clone(),
                source,
            })?;

        info!(uri = %descriptor.uri, rows = artifact.rows, "Uploaded {}", descriptor.uri);
        Ok(descriptor)
    }
}
