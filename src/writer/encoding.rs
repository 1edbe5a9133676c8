//! Arrow conversion and Parquet encoding for partition groups.

use std::sync::{Arc, OnceLock};

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int64Array,
    RecordBatch, RecordBatchOptions, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{Field, Schema};
use arrow::error::ArrowError;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::format::KeyValue;

use crate::dataset::{Dataset, Value};

const ROW_GROUP_SIZE: usize = 32 * 1024;
const DECIMAL_PRECISION: u8 = 38;
/// Days from 0001-01-01 (CE) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Get shared writer properties (cached)
///
/// Configuration:
/// - Snappy compression
/// - Dictionary encoding enabled
/// - 32k rows per group
/// - writer name and version embedded in file metadata
pub fn writer_properties() -> &'static WriterProperties {
    static PROPERTIES: OnceLock<WriterProperties> = OnceLock::new();
    PROPERTIES.get_or_init(|| {
        let metadata = vec![KeyValue {
            key: "pg2parquet.version".to_string(),
            value: Some(env!("CARGO_PKG_VERSION").to_string()),
        }];

        WriterProperties::builder()
            .set_dictionary_enabled(true)
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_compression(Compression::SNAPPY)
            .set_data_page_size_limit(256 * 1024)
            .set_write_batch_size(32 * 1024)
            .set_max_row_group_size(ROW_GROUP_SIZE)
            .set_dictionary_page_size_limit(128 * 1024)
            .set_key_value_metadata(Some(metadata))
            .build()
    })
}

/// Encode one batch into an in-memory Parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, ParquetError> {
    let mut buffer = Vec::new();
    let props = writer_properties().clone();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Physical type chosen for one column of a partition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    AllNull,
    Bool,
    Int,
    Float,
    Decimal { scale: u32 },
    Date,
    Timestamp,
    TimestampTz,
    Binary,
    Text,
}

impl ColumnKind {
    fn of(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => return None,
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::Decimal(d) => Self::Decimal { scale: d.scale() },
            Value::Date(_) => Self::Date,
            Value::Timestamp(_) => Self::Timestamp,
            Value::TimestampTz(_) => Self::TimestampTz,
            Value::Bytes(_) => Self::Binary,
            Value::Text(_) | Value::Json(_) => Self::Text,
        })
    }

    /// Widen two kinds to one that holds both; mixed shapes fall back to text.
    fn merge(self, other: Self) -> Self {
        use ColumnKind::*;
        match (self, other) {
            (AllNull, k) | (k, AllNull) => k,
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            (Decimal { scale }, Int) | (Int, Decimal { scale }) => Decimal { scale },
            (Decimal { scale: a }, Decimal { scale: b }) => Decimal { scale: a.max(b) },
            (Decimal { .. }, Float) | (Float, Decimal { .. }) => Float,
            _ => Text,
        }
    }

    fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        values
            .into_iter()
            .filter_map(Self::of)
            .fold(Self::AllNull, Self::merge)
    }
}

/// Build a record batch from the selected rows, skipping `exclude` columns.
///
/// Every field is nullable; column types are inferred from the values present
/// in this group only.
pub fn dataset_to_record_batch(
    dataset: &Dataset,
    rows: &[usize],
    exclude: &[&str],
) -> Result<RecordBatch, ArrowError> {
    let mut fields = Vec::new();
    let mut arrays = Vec::new();

    for (index, name) in dataset.columns().iter().enumerate() {
        if exclude.contains(&name.as_str()) {
            continue;
        }

        let values: Vec<&Value> = rows.iter().map(|&row| &dataset.rows()[row][index]).collect();
        let array = build_array(&values)?;
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)
}

fn build_array(values: &[&Value]) -> Result<ArrayRef, ArrowError> {
    let kind = ColumnKind::infer(values.iter().copied());

    let array: ArrayRef = match kind {
        ColumnKind::Bool => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Int => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Float => Arc::new(Float64Array::from(
            values.iter().map(|v| v.as_f64()).collect::<Vec<_>>(),
        )),
        ColumnKind::Decimal { scale } => {
            let mantissas = values
                .iter()
                .map(|v| decimal_mantissa(v, scale))
                .collect::<Vec<_>>();
            let scale = i8::try_from(scale).map_err(|_| {
                ArrowError::InvalidArgumentError(format!("decimal scale {scale} out of range"))
            })?;
            Arc::new(
                Decimal128Array::from(mantissas)
                    .with_precision_and_scale(DECIMAL_PRECISION, scale)?,
            )
        }
        ColumnKind::Date => Arc::new(Date32Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::TimestampTz => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        Value::TimestampTz(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        ColumnKind::Binary => Arc::new(BinaryArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Bytes(b) => Some(b.as_slice()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Text | ColumnKind::AllNull => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| (!v.is_null()).then(|| v.to_string()))
                .collect::<Vec<_>>(),
        )),
    };

    Ok(array)
}

fn decimal_mantissa(value: &Value, scale: u32) -> Option<i128> {
    match value {
        Value::Decimal(d) => {
            let mut d = *d;
            d.rescale(scale);
            Some(d.mantissa())
        }
        Value::Int(i) => Some(i128::from(*i) * 10i128.pow(scale)),
        _ => None,
    }
}
