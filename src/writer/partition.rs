//! Day partitioning of a transformed dataset into local Parquet files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use tracing::{debug, info};

use super::encoding::{dataset_to_record_batch, encode_parquet};
use super::scratch::ScratchDir;
use crate::dataset::{Dataset, Value, PARTITION_COLUMNS};
use crate::error::PipelineError;

/// Calendar day a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self::new(dt.year(), dt.month(), dt.day())
    }

    /// `YYYY/MM/DD`, zero padded.
    pub fn path_segment(&self) -> String {
        format!("{:04}/{:02}/{:02}", self.year, self.month, self.day)
    }

    fn from_row(row: &[Value], indices: [usize; 3]) -> Option<Self> {
        let [y, m, d] = indices.map(|i| match row.get(i) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        });
        Some(Self::new(
            i32::try_from(y?).ok()?,
            u32::try_from(m?).ok()?,
            u32::try_from(d?).ok()?,
        ))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Run timestamp shared by every file written in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%dT%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One Parquet file on local disk awaiting upload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub file_name: String,
    pub rows: usize,
    pub bytes: usize,
}

/// Files produced by one run, plus the scratch directory that holds them.
///
/// Dropping this value removes the scratch directory.
#[derive(Debug, Default)]
pub struct WrittenPartitions {
    scratch: Option<ScratchDir>,
    artifacts: Vec<Artifact>,
}

impl WrittenPartitions {
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(ScratchDir::path)
    }

    pub fn total_rows(&self) -> usize {
        self.artifacts.iter().map(|a| a.rows).sum()
    }
}

/// Writes one Parquet file per calendar day.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    file_prefix: String,
}

impl PartitionWriter {
    pub fn new(file_prefix: impl Into<String>) -> Self {
        Self {
            file_prefix: file_prefix.into(),
        }
    }

    pub fn file_name(&self, run_id: &RunId) -> String {
        format!("{}_{}.parquet", self.file_prefix, run_id)
    }

    /// Group `dataset` by its `year`/`month`/`day` columns and write each
    /// group to `{scratch}/YYYY/MM/DD/{prefix}_{run_id}.parquet`.
    ///
    /// Groups come out in ascending date order and keep the dataset's row
    /// order. The partition columns themselves are not written.
    pub fn write(
        &self,
        dataset: &Dataset,
        run_id: &RunId,
    ) -> Result<WrittenPartitions, PipelineError> {
        if dataset.is_empty() {
            info!("No new data to write");
            return Ok(WrittenPartitions::default());
        }

        let groups = group_by_day(dataset)?;
        let scratch = ScratchDir::create()
            .map_err(|e| PipelineError::write(format!("failed to create scratch directory: {e}")))?;
        let file_name = self.file_name(run_id);

        let mut artifacts = Vec::with_capacity(groups.len());
        for (key, rows) in groups {
            let batch = dataset_to_record_batch(dataset, &rows, &PARTITION_COLUMNS)
                .map_err(|e| PipelineError::write(format!("partition {key}: {e}")))?;
            let bytes = encode_parquet(&batch)
                .map_err(|e| PipelineError::write(format!("partition {key}: {e}")))?;

            let dir = scratch.partition_dir(&key).map_err(|e| {
                PipelineError::write(format!("failed to create partition directory {key}: {e}"))
            })?;
            let path = dir.join(&file_name);
            std::fs::write(&path, &bytes).map_err(|e| {
                PipelineError::write(format!("failed to write {}: {e}", path.display()))
            })?;

            debug!(
                partition = %key,
                rows = rows.len(),
                bytes = bytes.len(),
                path = %path.display(),
                "Wrote partition file"
            );

            artifacts.push(Artifact {
                key,
                path,
                file_name: file_name.clone(),
                rows: rows.len(),
                bytes: bytes.len(),
            });
        }

        Ok(WrittenPartitions {
            scratch: Some(scratch),
            artifacts,
        })
    }
}

fn group_by_day(dataset: &Dataset) -> Result<BTreeMap<PartitionKey, Vec<usize>>, PipelineError> {
    let mut indices = [0usize; 3];
    for (slot, name) in indices.iter_mut().zip(PARTITION_COLUMNS) {
        *slot = dataset
            .column_index(name)
            .ok_or_else(|| PipelineError::write(format!("partition column '{name}' is missing")))?;
    }

    let mut groups: BTreeMap<PartitionKey, Vec<usize>> = BTreeMap::new();
    for (row_index, row) in dataset.rows().iter().enumerate() {
        let key = PartitionKey::from_row(row, indices).ok_or_else(|| {
            PipelineError::write(format!("row {row_index} has an invalid partition date"))
        })?;
        groups.entry(key).or_default().push(row_index);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn partitioned(rows: &[(i64, (i64, i64, i64))]) -> Dataset {
        let columns = ["id", "year", "month", "day"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let rows = rows
            .iter()
            .map(|(id, (y, m, d))| {
                vec![Value::Int(*id), Value::Int(*y), Value::Int(*m), Value::Int(*d)]
            })
            .collect();
        Dataset::from_rows(columns, rows)
    }

    #[test]
    fn run_id_format() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(RunId::from_datetime(at).as_str(), "20250102T030405");
    }

    #[test]
    fn path_segment_is_zero_padded() {
        assert_eq!(PartitionKey::new(2025, 1, 2).path_segment(), "2025/01/02");
        assert_eq!(PartitionKey::new(2025, 1, 2).to_string(), "2025-01-02");
    }

    #[test]
    fn empty_dataset_writes_nothing() {
        let writer = PartitionWriter::new("orders");
        let written = writer
            .write(&Dataset::new(vec!["id".into()]), &RunId::now())
            .unwrap();
        assert!(written.is_empty());
        assert!(written.scratch_path().is_none());
    }

    #[test]
    fn groups_rows_by_day_in_order() {
        let ds = partitioned(&[
            (1, (2025, 1, 2)),
            (2, (2025, 1, 1)),
            (3, (2025, 1, 2)),
        ]);
        let run_id = RunId::from_datetime(Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap());
        let written = PartitionWriter::new("orders").write(&ds, &run_id).unwrap();

        let keys: Vec<_> = written.artifacts().iter().map(|a| a.key).collect();
        assert_eq!(
            keys,
            vec![PartitionKey::new(2025, 1, 1), PartitionKey::new(2025, 1, 2)]
        );
        assert_eq!(written.total_rows(), 3);

        let second = &written.artifacts()[1];
        assert_eq!(second.file_name, "orders_20250103T000000.parquet");
        assert!(second.path.ends_with("2025/01/02/orders_20250103T000000.parquet"));

        let file = std::fs::File::open(&second.path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_columns(), 1);
        assert_eq!(batch.schema().field(0).name(), "id");
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<arrow::array::Int64Array>()
            .unwrap();
        assert_eq!(ids.values().to_vec(), vec![1, 3]);
    }

    #[test]
    fn scratch_removed_with_partitions() {
        let ds = partitioned(&[(1, (2025, 1, 1))]);
        let written = PartitionWriter::new("orders")
            .write(&ds, &RunId::now())
            .unwrap();
        let scratch = written.scratch_path().unwrap().to_path_buf();
        assert!(scratch.exists());
        drop(written);
        assert!(!scratch.exists());
    }

    #[test]
    fn missing_partition_columns_fail() {
        let ds = Dataset::from_rows(vec!["id".into()], vec![vec![Value::Int(1)]]);
        let err = PartitionWriter::new("orders")
            .write(&ds, &RunId::now())
            .unwrap_err();
        assert!(err.to_string().contains("partition column 'year'"));
    }
}
