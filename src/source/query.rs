// Extract query construction and watermark parameter binding.

use std::borrow::Cow;
use std::str::FromStr;

use pg_escape::quote_identifier;
use rust_decimal::Decimal;
use tokio_postgres::types::{ToSql, Type};

use crate::dataset::{parse_datetime, WM_COL};
use crate::error::PipelineError;
use crate::watermark::{Watermark, MIN_WATERMARK};

pub(crate) type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Quote each dot-separated part of a (possibly schema-qualified) table name.
pub fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_identifier)
        .collect::<Vec<Cow<'_, str>>>()
        .join(".")
}

/// `SELECT *, col AS _wm_col FROM table WHERE col > $1 ORDER BY col ASC`
pub fn build_extract_query(table: &str, watermark_column: &str) -> String {
    let column = quote_identifier(watermark_column);
    format!(
        "SELECT *, {column} AS {WM_COL} FROM {} WHERE {column} > $1 ORDER BY {column} ASC",
        quote_table(table)
    )
}

/// Cast applied when projecting a column whose type the row decoder does not
/// read natively. `None` means the column is selected as is.
pub(crate) fn projection_cast(ty: &Type) -> Option<&'static str> {
    match *ty {
        Type::BOOL
        | Type::INT2
        | Type::INT4
        | Type::INT8
        | Type::OID
        | Type::FLOAT4
        | Type::FLOAT8
        | Type::NUMERIC
        | Type::VARCHAR
        | Type::TEXT
        | Type::BPCHAR
        | Type::NAME
        | Type::BYTEA
        | Type::DATE
        | Type::TIME
        | Type::TIMESTAMP
        | Type::TIMESTAMPTZ
        | Type::UUID
        | Type::JSON
        | Type::JSONB => None,
        Type::MONEY => Some("numeric"),
        _ => Some("text"),
    }
}

/// [`build_extract_query`] with an explicit column list, casting the columns
/// that carry a cast. `watermark_cast` applies to the `_wm_col` copy only; the
/// filter and ordering still use the column's own type.
pub fn build_projected_query(
    table: &str,
    watermark_column: &str,
    columns: &[(&str, Option<&str>)],
    watermark_cast: Option<&str>,
) -> String {
    let column = quote_identifier(watermark_column);
    let mut projection: Vec<String> = columns
        .iter()
        .map(|(name, cast)| {
            let name = quote_identifier(name);
            match cast {
                Some(cast) => format!("{name}::{cast} AS {name}"),
                None => name.into_owned(),
            }
        })
        .collect();
    projection.push(match watermark_cast {
        Some(cast) => format!("{column}::{cast} AS {WM_COL}"),
        None => format!("{column} AS {WM_COL}"),
    });

    format!(
        "SELECT {} FROM {} WHERE {column} > $1 ORDER BY {column} ASC",
        projection.join(", "),
        quote_table(table)
    )
}

/// Convert the stored watermark into a parameter of the type Postgres
/// inferred for `$1`.
///
/// The initial watermark is a datetime; against numeric columns it binds the
/// type's smallest value so the first run still reads everything.
pub(crate) fn bind_watermark(since: &Watermark, ty: &Type) -> Result<SqlParam, PipelineError> {
    let raw = since.as_str();
    let initial = raw == MIN_WATERMARK;
    let invalid = || {
        PipelineError::query(format!(
            "watermark '{raw}' is not a valid {} value",
            ty.name()
        ))
    };

    let param: SqlParam = match *ty {
        Type::TIMESTAMP => Box::new(parse_datetime(raw).ok_or_else(invalid)?),
        Type::TIMESTAMPTZ => Box::new(parse_datetime(raw).ok_or_else(invalid)?.and_utc()),
        Type::DATE => Box::new(parse_datetime(raw).ok_or_else(invalid)?.date()),
        Type::INT2 if initial => Box::new(i16::MIN),
        Type::INT4 if initial => Box::new(i32::MIN),
        Type::INT8 if initial => Box::new(i64::MIN),
        Type::NUMERIC if initial => Box::new(Decimal::MIN),
        Type::FLOAT4 if initial => Box::new(f32::NEG_INFINITY),
        Type::FLOAT8 if initial => Box::new(f64::NEG_INFINITY),
        Type::INT2 => Box::new(raw.parse::<i16>().map_err(|_| invalid())?),
        Type::INT4 => Box::new(raw.parse::<i32>().map_err(|_| invalid())?),
        Type::INT8 => Box::new(raw.parse::<i64>().map_err(|_| invalid())?),
        Type::NUMERIC => Box::new(Decimal::from_str(raw).map_err(|_| invalid())?),
        Type::FLOAT4 => Box::new(raw.parse::<f32>().map_err(|_| invalid())?),
        Type::FLOAT8 => Box::new(raw.parse::<f64>().map_err(|_| invalid())?),
        _ => Box::new(raw.to_string()),
    };
    Ok(param)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(raw: &str, ty: Type) -> String {
        format!("{:?}", bind_watermark(&Watermark::new(raw), &ty).unwrap())
    }

    #[test]
    fn test_extract_query() {
        assert_eq!(
            build_extract_query("public.orders", "updated_at"),
            "SELECT *, updated_at AS _wm_col FROM public.orders \
             WHERE updated_at > $1 ORDER BY updated_at ASC"
        );
    }

    #[test]
    fn identifiers_are_quoted_when_needed() {
        assert_eq!(quote_table("orders"), "orders");
        assert_eq!(quote_table("Sales.Orders"), "\"Sales\".\"Orders\"");
        assert_eq!(
            build_extract_query("orders", "Updated At"),
            "SELECT *, \"Updated At\" AS _wm_col FROM orders \
             WHERE \"Updated At\" > $1 ORDER BY \"Updated At\" ASC"
        );
    }

    #[test]
    fn unsupported_types_are_cast() {
        assert_eq!(projection_cast(&Type::INT8), None);
        assert_eq!(projection_cast(&Type::TIMESTAMPTZ), None);
        assert_eq!(projection_cast(&Type::JSONB), None);
        assert_eq!(projection_cast(&Type::MONEY), Some("numeric"));
        assert_eq!(projection_cast(&Type::INTERVAL), Some("text"));
        assert_eq!(projection_cast(&Type::INET), Some("text"));
        assert_eq!(projection_cast(&Type::TEXT_ARRAY), Some("text"));
    }

    #[test]
    fn projected_query_casts_listed_columns() {
        let columns = [
            ("id", None),
            ("Status", Some("text")),
            ("fee", Some("numeric")),
            ("updated_at", None),
        ];
        assert_eq!(
            build_projected_query("public.orders", "updated_at", &columns, None),
            "SELECT id, \"Status\"::text AS \"Status\", fee::numeric AS fee, updated_at, \
             updated_at AS _wm_col FROM public.orders \
             WHERE updated_at > $1 ORDER BY updated_at ASC"
        );
        assert_eq!(
            build_projected_query("orders", "lifecycle", &[("lifecycle", Some("text"))], Some("text")),
            "SELECT lifecycle::text AS lifecycle, lifecycle::text AS _wm_col FROM orders \
             WHERE lifecycle > $1 ORDER BY lifecycle ASC"
        );
    }

    #[test]
    fn binds_by_parameter_type() {
        assert_eq!(
            bound("2025-01-02 00:00:00", Type::TIMESTAMP),
            "2025-01-02T00:00:00"
        );
        assert_eq!(
            bound("2025-01-02 00:00:00", Type::TIMESTAMPTZ),
            "2025-01-02T00:00:00Z"
        );
        assert_eq!(bound("2025-01-02 00:00:00", Type::DATE), "2025-01-02");
        assert_eq!(bound("42", Type::INT8), "42");
        assert_eq!(bound("1.50", Type::NUMERIC), "1.50");
        assert_eq!(bound("abc", Type::TEXT), "\"abc\"");
    }

    #[test]
    fn initial_watermark_reads_all_numeric_rows() {
        assert_eq!(bound(MIN_WATERMARK, Type::INT4), i32::MIN.to_string());
        assert_eq!(bound(MIN_WATERMARK, Type::INT8), i64::MIN.to_string());
    }

    #[test]
    fn unparseable_watermark_is_query_error() {
        let err = bind_watermark(&Watermark::new("not-a-number"), &Type::INT8).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::E003Query);
        assert!(err.to_string().contains("not a valid int8"));

        assert!(bind_watermark(&Watermark::new("yesterday"), &Type::TIMESTAMP).is_err());
    }
}
