//! Staged artifact format: UTF-8 CSV, header row of column names, RFC 4180
//! quoting for fields containing delimiters, quotes or line breaks.
//!
//! NULL is an empty unquoted field. Text that is empty, or that reads as an
//! integer, float, boolean or timestamp, is always quoted, and a quoted field
//! always decodes as text. Unquoted cells get one type per column, inferred
//! from the non-empty ones: a column becomes integer, float, boolean or
//! timestamp only when every such cell is the canonical text of that type, so
//! zero-padded codes like `0005432000987` stay text.
//!
//! A rowset with a single column cannot carry NULL rows, since the record
//! would be a blank line.

use std::borrow::Cow;

use chrono::NaiveDateTime;

use crate::rowset::{RowSet, TIMESTAMP_FORMAT, Value};
use crate::{EtlError, Result};

pub const CONTENT_TYPE: &str = "application/csv";

pub fn encode(rowset: &RowSet) -> Result<Vec<u8>> {
    if rowset.columns().is_empty() {
        return Ok(Vec::new());
    }

    // Fields are quoted here; the writer only lays out records.
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    let encode_err = |e: csv::Error| EtlError::Deserialization {
        table: String::new(),
        message: format!("csv encode failed: {e}"),
    };

    writer
        .write_record(rowset.columns().iter().map(|c| quote_field(c, false)))
        .map_err(encode_err)?;
    for row in rowset.rows() {
        let fields: Vec<String> = row.iter().map(Value::to_string).collect();
        writer
            .write_record(
                row.iter()
                    .zip(&fields)
                    .map(|(value, text)| quote_field(text, must_quote(value))),
            )
            .map_err(encode_err)?;
    }

    writer.into_inner().map_err(|e| EtlError::Deserialization {
        table: String::new(),
        message: format!("csv flush failed: {}", e.error()),
    })
}

/// Text that an unquoted cell would not read back as.
fn must_quote(value: &Value) -> bool {
    match value {
        Value::Text(s) => s.is_empty() || Kind::TYPED.iter().any(|kind| kind.accepts(s)),
        _ => false,
    }
}

fn quote_field(text: &str, force: bool) -> Cow<'_, [u8]> {
    if force || text.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", text.replace('"', "\"\"")).into_bytes())
    } else {
        Cow::Borrowed(text.as_bytes())
    }
}

pub fn decode(table: &str, bytes: &[u8]) -> Result<RowSet> {
    if bytes.is_empty() {
        return Ok(RowSet::default());
    }

    let malformed = |message: String| EtlError::Deserialization {
        table: table.to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(format!("bad header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut cells: Vec<Vec<String>> = Vec::new();
    let mut starts: Vec<usize> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(e.to_string()))?;
        starts.push(record.position().map_or(0, |p| p.byte() as usize));
        cells.push(record.iter().map(str::to_string).collect());
    }

    let quoted: Vec<Vec<bool>> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(bytes.len());
            quoted_fields(&bytes[start.min(end)..end])
        })
        .collect();
    let is_quoted = |row: usize, col: usize| quoted[row].get(col).copied().unwrap_or(false);

    let kinds: Vec<Kind> = (0..columns.len())
        .map(|col| {
            Kind::infer(
                cells
                    .iter()
                    .enumerate()
                    .filter(|(row, _)| !is_quoted(*row, col))
                    .map(|(_, record)| record[col].as_str()),
            )
        })
        .collect();

    let mut rowset = RowSet::new(columns);
    for (row, record) in cells.into_iter().enumerate() {
        let values = record
            .into_iter()
            .zip(&kinds)
            .enumerate()
            .map(|(col, (cell, kind))| {
                if is_quoted(row, col) {
                    Value::Text(cell)
                } else {
                    kind.parse(cell)
                }
            })
            .collect();
        rowset
            .push(values)
            .map_err(|e| malformed(e.to_string()))?;
    }
    Ok(rowset)
}

/// Which fields of one raw record open with a quote.
fn quoted_fields(raw: &[u8]) -> Vec<bool> {
    let start = raw
        .iter()
        .position(|b| *b != b'\n' && *b != b'\r')
        .unwrap_or(raw.len());
    let raw = &raw[start..];

    let mut flags = Vec::new();
    let mut i = 0;
    loop {
        let quoted = raw.get(i) == Some(&b'"');
        flags.push(quoted);
        if quoted {
            i += 1;
            while i < raw.len() {
                if raw[i] == b'"' {
                    if raw.get(i + 1) == Some(&b'"') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
        }
        while i < raw.len() && !matches!(raw[i], b',' | b'\n' | b'\r') {
            i += 1;
        }
        if raw.get(i) != Some(&b',') {
            return flags;
        }
        i += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Int,
    Float,
    Bool,
    Timestamp,
    Text,
}

impl Kind {
    const TYPED: [Kind; 4] = [Kind::Int, Kind::Float, Kind::Bool, Kind::Timestamp];

    fn infer<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> Kind {
        let mut present = cells.filter(|c| !c.is_empty()).peekable();
        if present.peek().is_none() {
            return Kind::Text;
        }

        Kind::TYPED
            .into_iter()
            .find(|kind| present.clone().all(|cell| kind.accepts(cell)))
            .unwrap_or(Kind::Text)
    }

    fn accepts(&self, cell: &str) -> bool {
        match self {
            Kind::Int => cell.parse::<i64>().is_ok_and(|i| i.to_string() == cell),
            Kind::Float => cell
                .parse::<f64>()
                .is_ok_and(|x| x.is_finite() && format!("{x:?}") == cell),
            Kind::Bool => cell == "true" || cell == "false",
            Kind::Timestamp => NaiveDateTime::parse_from_str(cell, TIMESTAMP_FORMAT)
                .is_ok_and(|ts| ts.format(TIMESTAMP_FORMAT).to_string() == cell),
            Kind::Text => true,
        }
    }

    fn parse(&self, cell: String) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match self {
            Kind::Int => cell.parse().map_or(Value::Text(cell.clone()), Value::Int),
            Kind::Float => cell.parse().map_or(Value::Text(cell.clone()), Value::Float),
            Kind::Bool => Value::Bool(cell == "true"),
            Kind::Timestamp => NaiveDateTime::parse_from_str(&cell, TIMESTAMP_FORMAT)
                .map_or(Value::Text(cell.clone()), Value::Timestamp),
            Kind::Text => Value::Text(cell),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowset;
    use chrono::NaiveDate;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn round_trip_preserves_values() {
        let original = rowset!(
            ["ticket_no", "passenger_name", "amount", "seats", "paid", "booked_at", "note"],
            ["0005432000987", "IVAN, \"the\" GREAT", 1500.0, 3i64, true, ts(10), "line\nbreak"],
            ["0005432000988", "Мария Иванова", 0.25, -1i64, false, ts(23), None::<&str>],
        );

        let bytes = encode(&original).unwrap();
        let decoded = decode("tickets", &bytes).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn header_and_escaping_are_byte_exact() {
        let set = rowset!(["code", "name"], ["SVO", "Moscow, Sheremetyevo"], ["LED", "say \"hi\""]);
        let text = String::from_utf8(encode(&set).unwrap()).unwrap();
        assert_eq!(
            text,
            "code,name\nSVO,\"Moscow, Sheremetyevo\"\nLED,\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn empty_text_and_numeric_looking_text_stay_text() {
        let original = rowset!(
            ["flight_no", "status", "note"],
            ["42", "", None::<&str>],
            ["7", "x", "true"],
        );

        let bytes = encode(&original).unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "flight_no,status,note\n\"42\",\"\",\n\"7\",x,\"true\"\n"
        );
        assert_eq!(decode("flights", &bytes).unwrap(), original);
    }

    #[test]
    fn quoted_cells_do_not_drive_column_types() {
        let set = decode("bookings", b"book_ref,total_amount\n\"100\",1500\n00000F,\n").unwrap();
        assert_eq!(set.rows()[0], [Value::text("100"), Value::Int(1500)]);
        assert_eq!(set.rows()[1], [Value::text("00000F"), Value::Null]);
    }

    #[test]
    fn header_only_decodes_to_empty_rowset() {
        let set = decode("seats", b"aircraft_code,seat_no\n").unwrap();
        assert_eq!(set.columns(), ["aircraft_code", "seat_no"]);
        assert!(set.is_empty());
        assert_eq!(decode("seats", b"").unwrap(), RowSet::default());
    }

    #[test]
    fn mixed_column_falls_back_to_text() {
        let set = decode("flights", b"flight_no,status\n42,On Time\nPG0402,Delayed\n").unwrap();
        assert_eq!(set.rows()[0][0], Value::text("42"));
        assert_eq!(set.rows()[1][0], Value::text("PG0402"));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = decode("bookings", b"book_ref,total_amount\n00000F,265700.00,extra\n").unwrap_err();
        assert!(matches!(err, EtlError::Deserialization { ref table, .. } if table == "bookings"));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = decode("bookings", b"book_ref\n\xff\xfe\n").unwrap_err();
        assert!(matches!(err, EtlError::Deserialization { .. }));
    }
}
