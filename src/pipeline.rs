//! One extract → transform → write → upload → commit cycle.
//!
//! Stages run strictly in sequence. The watermark is committed only after
//! every artifact has been published, so a failed run leaves the cursor where
//! it was and the next run re-extracts the same rows.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{RuntimeConfig, TransformConfig};
use crate::dataset::WM_COL;
use crate::error::PipelineError;
use crate::source::Source;
use crate::transform;
use crate::watermark::{StorageError, Watermark, WatermarkStore};
use crate::writer::{PartitionWriter, RunId, UploadDescriptor, Uploader};

/// Per-run settings taken from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub table: String,
    pub watermark_column: String,
    pub transform: TransformConfig,
    pub file_prefix: String,
    /// Extract, transform and write locally; skip uploads and the commit.
    pub dry_run: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            table: config.source.table.clone(),
            watermark_column: config.source.watermark_column.clone(),
            transform: config.transform.clone(),
            file_prefix: config.storage.file_prefix.clone(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub rows_extracted: usize,
    pub rows_written: usize,
    pub uploads: Vec<UploadDescriptor>,
    pub previous_watermark: Watermark,
    /// Committed value, or the would-be value for dry runs.
    pub watermark: Watermark,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing newer than the stored watermark.
    NoNewRows { watermark: Watermark },
    /// Rows were extracted but none survived the validity filter.
    NoValidRows {
        rows_extracted: usize,
        watermark: Watermark,
    },
    Completed(RunSummary),
}

impl RunOutcome {
    /// Watermark in effect after the run.
    pub fn watermark(&self) -> &Watermark {
        match self {
            Self::NoNewRows { watermark } | Self::NoValidRows { watermark, .. } => watermark,
            Self::Completed(summary) => &summary.watermark,
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn Source>,
    store: Arc<dyn WatermarkStore>,
    uploader: Arc<dyn Uploader>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn Source>,
        store: Arc<dyn WatermarkStore>,
        uploader: Arc<dyn Uploader>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            store,
            uploader,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        self.run_with_run_id(RunId::now()).await
    }

    pub async fn run_with_run_id(&self, run_id: RunId) -> Result<RunOutcome, PipelineError> {
        let options = &self.options;

        let start = self.store.read()?;
        info!(store = %self.store.describe(), "Using watermark > {}", start);

        let extracted = self
            .source
            .fetch(&options.table, &options.watermark_column, &start)
            .await?;
        if extracted.is_empty() {
            info!("No new/updated rows. Exiting.");
            return Ok(RunOutcome::NoNewRows { watermark: start });
        }
        let rows_extracted = extracted.len();

        let dataset = transform::apply(extracted, &options.transform)?;
        if dataset.is_empty() {
            warn!(
                rows_extracted,
                column = %options.transform.amount_column,
                "No rows left after dropping missing amounts; watermark unchanged"
            );
            return Ok(RunOutcome::NoValidRows {
                rows_extracted,
                watermark: start,
            });
        }

        let next = dataset
            .column_index(WM_COL)
            .and_then(|index| Watermark::max_of(dataset.column_values(index)))
            .ok_or_else(|| {
                PipelineError::query(format!("extracted rows carry no {WM_COL} values"))
            })?;

        let written = PartitionWriter::new(&options.file_prefix).write(&dataset, &run_id)?;

        let mut uploads = Vec::with_capacity(written.len());
        for artifact in written.artifacts() {
            if options.dry_run {
                let descriptor = self.uploader.locate(artifact);
                info!(rows = artifact.rows, "[dry-run] would upload {}", descriptor.uri);
                uploads.push(descriptor);
            } else {
                uploads.push(self.uploader.publish(artifact).await?);
            }
        }
        let rows_written = written.total_rows();
        drop(written);

        if options.dry_run {
            info!("[dry-run] would advance watermark to {}", next);
        } else {
            self.commit(&start, &next)?;
            info!("Advanced watermark to {}", next);
        }

        Ok(RunOutcome::Completed(RunSummary {
            run_id: run_id.to_string(),
            rows_extracted,
            rows_written,
            uploads,
            previous_watermark: start,
            watermark: next,
            dry_run: options.dry_run,
        }))
    }

    fn commit(&self, start: &Watermark, next: &Watermark) -> Result<(), PipelineError> {
        if next.cmp_position(start) == Ordering::Less {
            return Err(StorageError::Regression {
                current: start.clone(),
                proposed: next.clone(),
            }
            .into());
        }

        if !self.store.compare_and_swap(start, next)? {
            let found = self.store.read()?;
            return Err(StorageError::Conflict {
                expected: start.clone(),
                found,
            }
            .into());
        }
        Ok(())
    }
}
