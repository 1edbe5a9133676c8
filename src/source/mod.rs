//! Incremental extraction from the source database.

mod postgres;
mod query;

use async_trait::async_trait;

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::watermark::Watermark;

pub use postgres::PostgresSource;
pub use query::{build_extract_query, quote_table};

/// A table that can be read incrementally by a monotonically increasing column.
#[async_trait]
pub trait Source: Send + Sync {
    /// All rows with `watermark_column > since`, ascending by that column,
    /// with the column's value duplicated into `_wm_col`.
    async fn fetch(
        &self,
        table: &str,
        watermark_column: &str,
        since: &Watermark,
    ) -> Result<Dataset, PipelineError>;
}
