//! Incremental Postgres → Parquet → object storage extractor.
//!
//! Each run reads rows newer than a persisted watermark, normalizes them,
//! writes one Parquet file per calendar day and uploads the files under
//! `{prefix}/YYYY/MM/DD/`. The watermark advances only after every upload
//! succeeded.

pub mod config;
pub mod dataset;
pub mod error;
mod init;
pub mod pipeline;
pub mod source;
pub mod transform;
pub mod watermark;
pub mod writer;

pub use config::RuntimeConfig;
pub use dataset::{Dataset, Value};
pub use error::{ErrorCode, PipelineError};
pub use init::{init_pipeline, init_store, init_tracing, init_uploader};
pub use pipeline::{Pipeline, PipelineOptions, RunOutcome, RunSummary};
pub use watermark::{Watermark, WatermarkStore};

use anyhow::Result;

/// Run one extraction cycle with an already resolved configuration.
pub async fn run_with_config(config: RuntimeConfig, dry_run: bool) -> Result<RunOutcome> {
    init_tracing(&config.logging);
    config.log_warnings();

    let pipeline = init_pipeline(&config, dry_run).await?;
    let outcome = pipeline.run().await?;
    Ok(outcome)
}
