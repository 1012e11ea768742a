//! Batched `INSERT ... ON CONFLICT ... DO UPDATE` into a warehouse table.
//!
//! Key columns decide conflicts and are never updated; every other column is
//! overwritten with the incoming value. A batch commits as a whole or not at
//! all.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::client::RelationalExecutor;
use crate::rowset::RowSet;
use crate::{EtlError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSpec {
    /// Schema-qualified, e.g. `stg.tickets`.
    pub target: String,
    pub conflict_key: Vec<String>,
}

impl UpsertSpec {
    pub fn new(target: impl Into<String>, conflict_key: &[&str]) -> Self {
        Self {
            target: target.into(),
            conflict_key: conflict_key.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn error(&self, message: impl Into<String>) -> EtlError {
        EtlError::Upsert {
            target: self.target.clone(),
            message: message.into(),
        }
    }

    /// Builds the statement for rows with `columns`, placeholders `$1..$n` in
    /// column order.
    pub fn statement(&self, columns: &[String]) -> Result<String> {
        if self.conflict_key.is_empty() {
            return Err(self.error("conflict key is empty"));
        }
        if columns.is_empty() {
            return Err(self.error("no columns to insert"));
        }
        for key in &self.conflict_key {
            if !columns.contains(key) {
                return Err(self.error(format!("conflict key column {key} is not in the rowset")));
            }
        }

        let column_list = columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=columns.len()).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
        let key_list = self
            .conflict_key
            .iter()
            .map(|k| quote_identifier(k))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !self.conflict_key.contains(*c))
            .map(|c| {
                let c = quote_identifier(c);
                format!("{c} = EXCLUDED.{c}")
            })
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT ({key_list})",
            quote_qualified(&self.target)
        );
        if updates.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            let _ = write!(sql, " DO UPDATE SET {}", updates.join(", "));
        }
        Ok(sql)
    }
}

/// Upserts `rows` through one transaction on `connection_id`. Returns the
/// number of rows sent; an empty rowset touches nothing and returns 0.
#[instrument(skip(executor, rows), fields(target = %spec.target, rows = rows.len()))]
pub async fn upsert(
    executor: &dyn RelationalExecutor,
    connection_id: &str,
    rows: &RowSet,
    spec: &UpsertSpec,
) -> Result<u64> {
    if rows.is_empty() {
        info!("no data to upsert");
        return Ok(0);
    }

    let sql = spec.statement(rows.columns())?;
    debug!(sql = %sql, "prepared upsert");

    let mut tx = executor
        .begin(connection_id)
        .await
        .map_err(|e| spec.error(format!("begin failed: {e}")))?;

    match tx.execute_batch(&sql, rows.rows()).await {
        Ok(_) => {
            tx.commit()
                .await
                .map_err(|e| spec.error(format!("commit failed: {e}")))?;
            info!("upsert committed");
            Ok(rows.len() as u64)
        }
        Err(e) => {
            error!(error = %e, "upsert failed, rolling back batch");
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(spec.error(e.to_string()))
        }
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes each dot-separated part of `schema.table`.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_identifier).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn builds_composite_key_statement() {
        let spec = UpsertSpec::new("stg.seats", &["aircraft_code", "seat_no"]);
        let sql = spec.statement(&cols(&["aircraft_code", "seat_no", "fare_conditions"])).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"stg\".\"seats\" (\"aircraft_code\", \"seat_no\", \"fare_conditions\") \
             VALUES ($1, $2, $3) ON CONFLICT (\"aircraft_code\", \"seat_no\") \
             DO UPDATE SET \"fare_conditions\" = EXCLUDED.\"fare_conditions\""
        );
    }

    #[test]
    fn all_key_columns_do_nothing() {
        let spec = UpsertSpec::new("stg.bookings", &["book_ref"]);
        let sql = spec.statement(&cols(&["book_ref"])).unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"book_ref\") DO NOTHING"));
    }

    #[test]
    fn key_must_be_subset_of_columns() {
        let spec = UpsertSpec::new("stg.tickets", &["ticket_no"]);
        let err = spec.statement(&cols(&["book_ref"])).unwrap_err();
        assert!(matches!(err, EtlError::Upsert { .. }));
        assert!(UpsertSpec::new("stg.tickets", &[]).statement(&cols(&["a"])).is_err());
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_qualified("stg.tickets"), "\"stg\".\"tickets\"");
    }
}
