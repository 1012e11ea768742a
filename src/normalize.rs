//! Column transforms applied to staged rows before they are upserted.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::rowset::{RowSet, TIMESTAMP_FORMAT, Value};
use crate::{EtlError, Result};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTransform {
    Identity,
    /// Wraps the raw value as a JSON literal, for JSON/text target columns.
    JsonEncode,
    /// Parses a timestamp; anything unparseable becomes NULL.
    ParseTimestampOrNull,
}

impl ColumnTransform {
    pub fn apply(&self, value: Value) -> std::result::Result<Value, String> {
        match self {
            Self::Identity => Ok(value),
            Self::JsonEncode => json_encode(value),
            Self::ParseTimestampOrNull => Ok(parse_timestamp(&value).map_or(Value::Null, Value::Timestamp)),
        }
    }
}

/// Applies `transforms` in place. A transform naming a column the rowset
/// does not have is an error, as is any non-recoverable value failure.
pub fn apply_transforms(
    table: &str,
    rowset: &mut RowSet,
    transforms: &[(&str, ColumnTransform)],
) -> Result<()> {
    for (column, transform) in transforms {
        if *transform == ColumnTransform::Identity {
            continue;
        }
        let idx = rowset
            .column_index(column)
            .ok_or_else(|| EtlError::TransformField {
                table: table.to_string(),
                column: column.to_string(),
                message: "column missing from staged rows".to_string(),
            })?;

        for (row_number, row) in rowset.rows_mut().iter_mut().enumerate() {
            let value = std::mem::replace(&mut row[idx], Value::Null);
            row[idx] = transform
                .apply(value)
                .map_err(|message| EtlError::TransformField {
                    table: table.to_string(),
                    column: column.to_string(),
                    message: format!("row {}: {message}", row_number + 1),
                })?;
        }
    }
    Ok(())
}

fn json_encode(value: Value) -> std::result::Result<Value, String> {
    let json = match value {
        Value::Null => return Ok(Value::Null),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Int(i) => serde_json::Value::from(i),
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Float(x) => serde_json::Number::from_f64(x)
            .map(serde_json::Value::Number)
            .ok_or_else(|| format!("{x} has no JSON representation"))?,
        Value::Timestamp(ts) => serde_json::Value::String(ts.format(TIMESTAMP_FORMAT).to_string()),
    };
    serde_json::to_string(&json)
        .map(Value::Text)
        .map_err(|e| e.to_string())
}

/// Offset-qualified inputs are normalised to UTC.
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    let text = match value {
        Value::Timestamp(ts) => return Some(*ts),
        Value::Text(s) => s.trim(),
        _ => return None,
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.naive_utc());
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
