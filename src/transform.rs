//! Row normalization and enrichment.
//!
//! Steps, applied in order on the whole in-memory dataset:
//! 1. datetime-like columns are re-rendered as `YYYY-MM-DD HH:MM:SS`
//! 2. rows missing the amount are dropped
//! 3. the converted amount is derived
//! 4. `year`/`month`/`day` partition columns are attached

use thiserror::Error;
use tracing::debug;

use crate::config::TransformConfig;
use crate::dataset::{format_datetime, Dataset, Value, PARTITION_COLUMNS, WM_COL};
use crate::writer::PartitionKey;

/// Schema problems that make a dataset unusable.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("required column '{column}' not present in extracted schema")]
    MissingColumn { column: String },

    #[error("column '{column}' row {row}: value '{value}' is not numeric")]
    NonNumeric {
        column: String,
        row: usize,
        value: String,
    },

    #[error("column '{column}' row {row}: cannot derive a partition date from '{value}'")]
    InvalidPartitionDate {
        column: String,
        row: usize,
        value: String,
    },
}

/// Run every transform step. An empty dataset is returned unchanged.
pub fn apply(dataset: Dataset, config: &TransformConfig) -> Result<Dataset, TransformError> {
    if dataset.is_empty() {
        return Ok(dataset);
    }

    let mut dataset = dataset;
    normalize_datetimes(&mut dataset, config.datetime_columns.as_deref());
    drop_missing_amounts(&mut dataset, &config.amount_column)?;
    derive_converted_amount(&mut dataset, config)?;
    attach_partition_keys(&mut dataset, &config.partition_column)?;
    Ok(dataset)
}

/// Name heuristic for datetime columns when none are declared explicitly.
pub fn is_datetime_like(column: &str) -> bool {
    column == WM_COL || column.contains("ts") || column.contains("time") || column.contains("date")
}

/// Re-render candidate columns in canonical datetime form.
///
/// Conversion is all-or-nothing per column: one unparseable value leaves the
/// whole column as extracted.
pub fn normalize_datetimes(dataset: &mut Dataset, declared: Option<&[String]>) {
    let candidates: Vec<usize> = dataset
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, name)| match declared {
            Some(columns) => columns.iter().any(|c| c == *name),
            None => is_datetime_like(name),
        })
        .map(|(index, _)| index)
        .collect();

    for index in candidates {
        let converted: Option<Vec<Value>> = dataset
            .column_values(index)
            .map(|value| match value {
                Value::Null => Some(Value::Null),
                other => other
                    .as_datetime()
                    .map(|dt| Value::Text(format_datetime(&dt))),
            })
            .collect();

        match converted {
            Some(values) => dataset.replace_column(index, values),
            None => debug!(
                column = %dataset.columns()[index],
                "Column is not uniformly datetime; leaving values untouched"
            ),
        }
    }
}

/// Drop rows whose amount is null or NaN. The column itself must exist.
pub fn drop_missing_amounts(dataset: &mut Dataset, amount_column: &str) -> Result<(), TransformError> {
    let index = require_column(dataset, amount_column)?;

    let before = dataset.len();
    dataset.retain_rows(|row| !is_missing(&row[index]));
    let dropped = before - dataset.len();
    if dropped > 0 {
        debug!(
            dropped,
            column = amount_column,
            "Dropped rows without a usable amount"
        );
    }
    Ok(())
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Float(f) => f.is_nan(),
        _ => false,
    }
}

/// Add `converted_column = round(amount * rate, 2)`.
pub fn derive_converted_amount(
    dataset: &mut Dataset,
    config: &TransformConfig,
) -> Result<(), TransformError> {
    let index = require_column(dataset, &config.amount_column)?;

    let converted = dataset
        .column_values(index)
        .enumerate()
        .map(|(row, value)| {
            value
                .as_f64()
                .map(|amount| Value::Float(round_cents(amount * config.usd_to_inr)))
                .ok_or_else(|| TransformError::NonNumeric {
                    column: config.amount_column.clone(),
                    row,
                    value: value.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    dataset.set_column(&config.converted_column, converted);
    Ok(())
}

/// Column the partition date is read from: the business column when the
/// schema has it, the watermark copy otherwise.
pub fn partition_source_column<'a>(dataset: &Dataset, partition_column: &'a str) -> &'a str {
    if dataset.has_column(partition_column) {
        partition_column
    } else {
        WM_COL
    }
}

/// Append `year`, `month` and `day` columns derived from the partition date.
pub fn attach_partition_keys(
    dataset: &mut Dataset,
    partition_column: &str,
) -> Result<(), TransformError> {
    let column = partition_source_column(dataset, partition_column);
    let index = require_column(dataset, column)?;

    let keys = dataset
        .column_values(index)
        .enumerate()
        .map(|(row, value)| {
            value
                .as_datetime()
                .map(|dt| PartitionKey::from_datetime(&dt))
                .ok_or_else(|| TransformError::InvalidPartitionDate {
                    column: column.to_string(),
                    row,
                    value: value.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let [year, month, day] = PARTITION_COLUMNS;
    dataset.set_column(
        year,
        keys.iter().map(|k| Value::Int(i64::from(k.year))).collect(),
    );
    dataset.set_column(
        month,
        keys.iter().map(|k| Value::Int(i64::from(k.month))).collect(),
    );
    dataset.set_column(
        day,
        keys.iter().map(|k| Value::Int(i64::from(k.day))).collect(),
    );
    Ok(())
}

fn require_column(dataset: &Dataset, column: &str) -> Result<usize, TransformError> {
    dataset
        .column_index(column)
        .ok_or_else(|| TransformError::MissingColumn {
            column: column.to_string(),
        })
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
