// PostgreSQL source backed by tokio-postgres.

use std::error::Error as StdError;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, error, info};

use super::query::{bind_watermark, build_extract_query, build_projected_query, projection_cast};
use super::Source;
use crate::config::SourceConfig;
use crate::dataset::{Dataset, Value};
use crate::error::PipelineError;
use crate::watermark::Watermark;

pub struct PostgresSource {
    client: Client,
    target: String,
}

impl PostgresSource {
    /// Open a connection and drive it on a background task.
    pub async fn connect(config: &SourceConfig) -> Result<Self, PipelineError> {
        let target = config.display_target();

        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .application_name(env!("CARGO_PKG_NAME"));
        if !config.password.is_empty() {
            pg.password(&config.password);
        }

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| PipelineError::connection(&target, e.to_string()))?;

        let task_target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(db = %task_target, error = %e, "Postgres connection error");
            }
        });

        debug!(db = %target, "Connected to Postgres");
        Ok(Self { client, target })
    }

    async fn prepare(&self, table: &str, sql: &str) -> Result<Statement, PipelineError> {
        debug!(sql = %sql, "Preparing extract query");
        self.client
            .prepare(sql)
            .await
            .map_err(|e| PipelineError::query(format!("{table}: {e}")))
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn fetch(
        &self,
        table: &str,
        watermark_column: &str,
        since: &Watermark,
    ) -> Result<Dataset, PipelineError> {
        let statement = self
            .prepare(table, &build_extract_query(table, watermark_column))
            .await?;
        let statement = match cast_projection(table, watermark_column, &statement) {
            Some(sql) => self.prepare(table, &sql).await?,
            None => statement,
        };

        let param_type = statement.params().first().cloned().unwrap_or(Type::TEXT);
        let param = bind_watermark(since, &param_type)?;
        let params: [&(dyn ToSql + Sync); 1] = [&*param];

        let rows = self
            .client
            .query(&statement, &params)
            .await
            .map_err(|e| PipelineError::query(format!("{table}: {e}")))?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|c| c.type_().clone())
            .collect();

        let mut dataset = Dataset::new(columns.clone());
        for row in &rows {
            dataset.push_row(decode_row(row, &columns, &types)?);
        }

        info!(
            table = %table,
            db = %self.target,
            rows = dataset.len(),
            "Extracted {} rows",
            dataset.len()
        );
        Ok(dataset)
    }
}

/// Rebuilt extract query when `SELECT *` yields column types the decoder
/// cannot read; `None` when every column decodes natively.
fn cast_projection(table: &str, watermark_column: &str, statement: &Statement) -> Option<String> {
    let columns = statement.columns();
    if columns.iter().all(|c| projection_cast(c.type_()).is_none()) {
        return None;
    }

    let (table_columns, watermark) = columns.split_at(columns.len().saturating_sub(1));
    let projected: Vec<(&str, Option<&str>)> = table_columns
        .iter()
        .map(|c| (c.name(), projection_cast(c.type_())))
        .collect();
    for column in table_columns.iter().chain(watermark) {
        if let Some(cast) = projection_cast(column.type_()) {
            debug!(
                column = column.name(),
                pg_type = %column.type_(),
                cast,
                "Casting column without a native decoder"
            );
        }
    }

    let watermark_cast = watermark.first().and_then(|c| projection_cast(c.type_()));
    Some(build_projected_query(
        table,
        watermark_column,
        &projected,
        watermark_cast,
    ))
}

fn decode_row(row: &Row, columns: &[String], types: &[Type]) -> Result<Vec<Value>, PipelineError> {
    types
        .iter()
        .enumerate()
        .map(|(idx, ty)| {
            pg_value_to_value(row, idx, ty).map_err(|e| {
                let name = columns.get(idx).map(String::as_str).unwrap_or("?");
                PipelineError::query(format!("column '{name}' ({ty}): {e}"))
            })
        })
        .collect()
}

/// Decode one cell. SQL NULL becomes `Value::Null`; a cell that fails to
/// decode is an error.
fn pg_value_to_value(row: &Row, idx: usize, pg_type: &Type) -> Result<Value, tokio_postgres::Error> {
    fn get<'a, T>(row: &'a Row, idx: usize) -> Result<Option<T>, tokio_postgres::Error>
    where
        T: FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx)
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::Int),
        Type::OID => get::<u32>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| Value::Float(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(Value::Float),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(Value::from),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx)?.map(Value::Text)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(Value::Bytes),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?.map(Value::Date),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?.map(|t| Value::Text(t.to_string())),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?.map(Value::Timestamp),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(Value::TimestampTz)
        }
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|u| Value::Text(u.to_string())),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        // Text-like extension types (citext and friends)
        _ => get::<String>(row, idx)?.map(Value::Text),
    };

    Ok(value.unwrap_or(Value::Null))
}

// Sign words of the binary `numeric` format
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_POS_INF: u16 = 0xD000;
const NUMERIC_NEG_INF: u16 = 0xF000;

/// `numeric` cell, including the special values `Decimal` cannot hold.
#[derive(Debug, PartialEq)]
enum PgNumeric {
    Finite(Decimal),
    Special(f64),
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let sign = raw.get(4..6).map(|b| u16::from_be_bytes([b[0], b[1]]));
        match sign {
            Some(NUMERIC_NAN) => Ok(Self::Special(f64::NAN)),
            Some(NUMERIC_POS_INF) => Ok(Self::Special(f64::INFINITY)),
            Some(NUMERIC_NEG_INF) => Ok(Self::Special(f64::NEG_INFINITY)),
            _ => Decimal::from_sql(ty, raw).map(Self::Finite),
        }
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

impl From<PgNumeric> for Value {
    fn from(value: PgNumeric) -> Self {
        match value {
            PgNumeric::Finite(d) => Value::Decimal(d),
            PgNumeric::Special(f) => Value::Float(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    #[test]
    fn numeric_finite_values_decode_as_decimal() {
        // 1.5 = 1 + 5000 / 10^4
        let raw = numeric(2, 0, 0, 1, &[1, 5000]);
        let value = Value::from(PgNumeric::from_sql(&Type::NUMERIC, &raw).unwrap());
        assert_eq!(value, Value::Decimal(Decimal::new(15, 1)));
    }

    #[test]
    fn numeric_special_values_decode_as_float() {
        let nan = PgNumeric::from_sql(&Type::NUMERIC, &numeric(0, 0, NUMERIC_NAN, 0, &[])).unwrap();
        assert!(matches!(Value::from(nan), Value::Float(f) if f.is_nan()));

        let inf =
            PgNumeric::from_sql(&Type::NUMERIC, &numeric(0, 0, NUMERIC_NEG_INF, 0, &[])).unwrap();
        assert_eq!(Value::from(inf), Value::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn numeric_only_accepts_numeric() {
        assert!(<PgNumeric as FromSql>::accepts(&Type::NUMERIC));
        assert!(!<PgNumeric as FromSql>::accepts(&Type::MONEY));
    }
}
