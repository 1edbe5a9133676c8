//! Shared test harness for pipeline integration tests
//!
//! Provides in-memory stand-ins for every collaborator of the pipeline:
//! - `MemorySource`: a table held in memory, queried like the Postgres source
//! - `FailingUploader`: wraps an uploader and fails the Nth publish
//! - memory object storage (OpenDAL `Memory` service) with Parquet readback

#![allow(dead_code)]

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use pg2parquet::config::TransformConfig;
use pg2parquet::dataset::WM_COL;
use pg2parquet::source::Source;
use pg2parquet::watermark::{MemoryWatermarkStore, WatermarkStore};
use pg2parquet::writer::{Artifact, ObjectStoreUploader, UploadDescriptor, UploadError, Uploader};
use pg2parquet::{Dataset, Pipeline, PipelineError, PipelineOptions, Value, Watermark};
use rust_decimal::Decimal;

pub const BUCKET: &str = "lake";
pub const PREFIX: &str = "raw";

/// In-memory table answering `col > since ORDER BY col ASC`.
pub struct MemorySource {
    columns: Vec<String>,
    rows: Mutex<Vec<Vec<Value>>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, row: Vec<Value>) {
        assert_eq!(row.len(), self.columns.len(), "row width");
        self.rows.lock().unwrap().push(row);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn fetch(
        &self,
        _table: &str,
        watermark_column: &str,
        since: &Watermark,
    ) -> Result<Dataset, PipelineError> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);

        let index = self
            .columns
            .iter()
            .position(|c| c == watermark_column)
            .ok_or_else(|| PipelineError::query(format!("column {watermark_column} not found")))?;

        let position = |row: &Vec<Value>| Watermark::from_value(&row[index]);
        let mut selected: Vec<Vec<Value>> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| {
                position(row).is_some_and(|wm| wm.cmp_position(since) == Ordering::Greater)
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| match (position(a), position(b)) {
            (Some(a), Some(b)) => a.cmp_position(&b),
            _ => Ordering::Equal,
        });

        let mut columns = self.columns.clone();
        columns.push(WM_COL.to_string());
        let rows = selected
            .into_iter()
            .map(|mut row| {
                let wm = row[index].clone();
                row.push(wm);
                row
            })
            .collect();
        Ok(Dataset::from_rows(columns, rows))
    }
}

/// Uploader that fails its `fail_on`-th publish (1-based).
pub struct FailingUploader {
    inner: ObjectStoreUploader,
    fail_on: usize,
    calls: AtomicUsize,
    paths: Mutex<Vec<PathBuf>>,
}

impl FailingUploader {
    pub fn new(inner: ObjectStoreUploader, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            calls: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    /// Local artifact paths handed to `publish`, in call order.
    pub fn seen_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for FailingUploader {
    fn locate(&self, artifact: &Artifact) -> UploadDescriptor {
        self.inner.locate(artifact)
    }

    async fn publish(&self, artifact: &Artifact) -> Result<UploadDescriptor, UploadError> {
        let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.paths.lock().unwrap().push(artifact.path.clone());
        if call == self.fail_on {
            let descriptor = self.inner.locate(artifact);
            return Err(UploadError::Put {
                bucket: descriptor.bucket,
                key: descriptor.key,
                source: opendal::Error::new(opendal::ErrorKind::Unexpected, "injected failure"),
            });
        }
        self.inner.publish(artifact).await
    }
}

/// Memory-backed object store and an uploader writing into it.
pub fn memory_storage() -> (opendal::Operator, ObjectStoreUploader) {
    let operator = opendal::Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    let uploader = ObjectStoreUploader::new(operator.clone(), BUCKET, PREFIX, "s3");
    (operator, uploader)
}

/// All object keys, sorted.
pub async fn list_keys(operator: &opendal::Operator) -> Vec<String> {
    let mut keys: Vec<String> = operator
        .list_with("/")
        .recursive(true)
        .await
        .expect("list objects")
        .into_iter()
        .filter(|entry| entry.metadata().is_file())
        .map(|entry| entry.path().trim_start_matches('/').to_string())
        .collect();
    keys.sort();
    keys
}

/// Read a stored Parquet object back into Arrow batches.
pub async fn read_parquet(operator: &opendal::Operator, key: &str) -> Vec<RecordBatch> {
    let bytes = operator
        .read(key)
        .await
        .expect("read object")
        .to_bytes();
    ParquetRecordBatchReaderBuilder::try_new(bytes)
        .expect("parquet reader")
        .build()
        .expect("build reader")
        .collect::<Result<Vec<_>, _>>()
        .expect("read batches")
}

pub fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

pub fn options() -> PipelineOptions {
    PipelineOptions {
        table: "public.orders".to_string(),
        watermark_column: "updated_at".to_string(),
        transform: TransformConfig::default(),
        file_prefix: "orders".to_string(),
        dry_run: false,
    }
}

pub fn pipeline(
    source: Arc<MemorySource>,
    store: Arc<MemoryWatermarkStore>,
    uploader: Arc<dyn Uploader>,
) -> Pipeline {
    Pipeline::new(source, store as Arc<dyn WatermarkStore>, uploader, options())
}

pub const ORDER_COLUMNS: [&str; 4] = ["id", "order_ts", "amount_usd", "updated_at"];

pub fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Value {
    Value::Timestamp(
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, s))
            .expect("valid timestamp"),
    )
}

/// Order row whose `order_ts` and `updated_at` share one timestamp.
pub fn order(id: i64, at: Value, amount_cents: Option<i64>) -> Vec<Value> {
    let amount = amount_cents
        .map(|cents| Value::Decimal(Decimal::new(cents, 2)))
        .unwrap_or(Value::Null);
    vec![Value::Int(id), at.clone(), amount, at]
}

/// Orders table holding the three-row, two-day fixture.
pub fn two_day_orders() -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new(&ORDER_COLUMNS));
    source.insert(order(1, ts(2025, 1, 1, 10, 0, 0), Some(1000)));
    source.insert(order(2, ts(2025, 1, 1, 12, 0, 0), Some(550)));
    source.insert(order(3, ts(2025, 1, 2, 0, 0, 0), Some(100)));
    source
}
