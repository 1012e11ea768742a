//! PostgreSQL executor backed by sqlx pools, one pool per connection id.
//!
//! Parameters are sent as text and cast to the type the server infers for
//! each placeholder, so staged values need no client-side typing.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Column, Either, Executor, Postgres, Statement, TypeInfo};
use tracing::debug;

use crate::client::{ClientError, RelationalExecutor, Transaction};
use crate::rowset::{RowSet, Value};

fn db_error(context: &str, e: sqlx::Error) -> ClientError {
    ClientError::with_source(format!("{context}: {e}"), e)
}

#[derive(Default, Clone)]
pub struct PgExecutor {
    pools: HashMap<String, PgPool>,
}

impl PgExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, connection_id: impl Into<String>, pool: PgPool) -> Self {
        self.pools.insert(connection_id.into(), pool);
        self
    }

    pub async fn connect(
        self,
        connection_id: impl Into<String>,
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, ClientError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| db_error("connect failed", e))?;
        Ok(self.with_pool(connection_id, pool))
    }
}

#[async_trait]
impl RelationalExecutor for PgExecutor {
    async fn begin(&self, connection_id: &str) -> Result<Box<dyn Transaction>, ClientError> {
        let pool = self
            .pools
            .get(connection_id)
            .ok_or_else(|| ClientError::new(format!("unknown connection {connection_id}")))?;
        let tx = pool.begin().await.map_err(|e| db_error("begin failed", e))?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// Rewrites `$n` to `$n::text::<type>` using the parameter types the
    /// server reports for `sql`.
    async fn typed_sql(&mut self, sql: &str) -> Result<String, ClientError> {
        let statement = (&mut *self.tx)
            .prepare(sql)
            .await
            .map_err(|e| db_error("prepare failed", e))?;
        let types: Vec<String> = match statement.parameters() {
            Some(Either::Left(types)) => types.iter().map(|t| t.name().to_string()).collect(),
            _ => return Ok(sql.to_string()),
        };
        Ok(rewrite_placeholders(sql, &types))
    }

    /// One round trip per row, for statements without a single VALUES tuple.
    async fn execute_each(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, ClientError> {
        let mut affected = 0;
        for (idx, row) in rows.iter().enumerate() {
            let mut query = sqlx::query(sql);
            for value in row {
                query = query.bind(text_param(value));
            }
            let result = query
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error(&format!("row {} failed", idx + 1), e))?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }
}

fn text_param(value: &Value) -> Option<String> {
    (!value.is_null()).then(|| value.to_string())
}

fn rewrite_placeholders(sql: &str, types: &[String]) -> String {
    let mut out = String::with_capacity(sql.len() + types.len() * 16);
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || !chars.peek().is_some_and(char::is_ascii_digit) {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.next_if(char::is_ascii_digit) {
            digits.push(d);
        }
        match digits.parse::<usize>().ok().and_then(|n| types.get(n.wrapping_sub(1))) {
            Some(ty) => {
                let _ = write!(out, "${digits}::text::{ty}");
            }
            None => {
                let _ = write!(out, "${digits}");
            }
        }
    }
    out
}

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_PAGE_ROWS: usize = 1_000;

/// An `INSERT .. VALUES (..) ON CONFLICT (..)` statement split around its
/// value tuple, so pages of rows can go out as one multi-row statement.
#[derive(Debug, PartialEq)]
struct BatchShape<'a> {
    head: &'a str,
    tuple: &'a str,
    tail: &'a str,
    width: usize,
    key_positions: Vec<usize>,
}

impl<'a> BatchShape<'a> {
    fn parse(sql: &'a str) -> Option<Self> {
        let (head, rest) = sql.split_once(" VALUES (")?;
        let tuple_end = rest.find(") ON CONFLICT (")?;
        let tuple = &rest[..tuple_end];
        let tail = &rest[tuple_end + 1..];

        let columns: Vec<&str> = head.rsplit_once('(')?.1.strip_suffix(')')?.split(", ").collect();
        let keys = tail.strip_prefix(" ON CONFLICT (")?.split_once(')')?.0;
        let key_positions = keys
            .split(", ")
            .map(|key| columns.iter().position(|c| *c == key))
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            head,
            tuple,
            tail,
            width: columns.len(),
            key_positions,
        })
    }

    fn page_size(&self) -> usize {
        (MAX_BIND_PARAMS / self.width.max(1)).clamp(1, MAX_PAGE_ROWS)
    }

    /// The statement for `rows` value tuples, placeholders numbered row by row.
    fn statement(&self, rows: usize) -> String {
        let tuples: Vec<String> = (0..rows)
            .map(|r| format!("({})", shift_placeholders(self.tuple, r * self.width)))
            .collect();
        format!("{} VALUES {}{}", self.head, tuples.join(", "), self.tail)
    }
}

fn shift_placeholders(tuple: &str, offset: usize) -> String {
    let mut out = String::with_capacity(tuple.len() + 8);
    let mut chars = tuple.chars().peekable();

    while let Some(c) = chars.next() {
        out.push(c);
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.next_if(char::is_ascii_digit) {
            digits.push(d);
        }
        match digits.parse::<usize>() {
            Ok(n) => {
                let _ = write!(out, "{}", n + offset);
            }
            Err(_) => out.push_str(&digits),
        }
    }
    out
}

/// Keeps the last row for each conflict key. One statement cannot touch the
/// same row twice. Rows with a NULL key never conflict and are all kept.
fn dedupe_last<'r>(rows: &'r [Vec<Value>], key_positions: &[usize]) -> Vec<&'r Vec<Value>> {
    let key_of = |row: &Vec<Value>| -> Option<Vec<String>> {
        key_positions
            .iter()
            .map(|k| row.get(*k).and_then(text_param))
            .collect()
    };

    let mut last: HashMap<Vec<String>, usize> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(key) = key_of(row) {
            last.insert(key, idx);
        }
    }

    rows.iter()
        .enumerate()
        .filter(|(idx, row)| key_of(*row).is_none_or(|key| last.get(&key) == Some(idx)))
        .map(|(_, row)| row)
        .collect()
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&mut self, sql: &str) -> Result<RowSet, ClientError> {
        let sql = sql.trim().trim_end_matches(';');
        let statement = (&mut *self.tx)
            .prepare(sql)
            .await
            .map_err(|e| db_error("prepare failed", e))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let wrapped = format!("SELECT row_to_json(t)::text FROM ({sql}) AS t");
        let lines: Vec<String> = sqlx::query_scalar(&wrapped)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("query failed", e))?;

        let mut rowset = RowSet::new(columns.clone());
        for line in lines {
            let mut object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&line)
                .map_err(|e| ClientError::with_source("row decode failed", e))?;
            let row = columns
                .iter()
                .map(|c| object.remove(c).map_or(Value::Null, Value::from_json))
                .collect();
            rowset
                .push(row)
                .map_err(|e| ClientError::new(e.to_string()))?;
        }
        debug!(rows = rowset.len(), "query fetched");
        Ok(rowset)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, ClientError> {
        let sql = if params.is_empty() {
            sql.to_string()
        } else {
            self.typed_sql(sql).await?
        };
        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(text_param(param));
        }
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("execute failed", e))?;
        Ok(result.rows_affected())
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, ClientError> {
        let sql = self.typed_sql(sql).await?;
        let Some(shape) = BatchShape::parse(&sql) else {
            return self.execute_each(&sql, rows).await;
        };

        let mut affected = 0;
        for (page_no, page) in rows.chunks(shape.page_size()).enumerate() {
            let page = dedupe_last(page, &shape.key_positions);
            let statement = shape.statement(page.len());
            let mut query = sqlx::query(&statement);
            for value in page.iter().flat_map(|row| row.iter()) {
                query = query.bind(text_param(value));
            }
            let result = query
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error(&format!("page {} failed", page_no + 1), e))?;
            affected += result.rows_affected();
        }
        debug!(rows = rows.len(), affected, "batch upserted");
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), ClientError> {
        self.tx.commit().await.map_err(|e| db_error("commit failed", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClientError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("rollback failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_get_server_types() {
        let types = vec!["BPCHAR".to_string(), "TIMESTAMPTZ".to_string()];
        assert_eq!(
            rewrite_placeholders("VALUES ($1, $2, $3)", &types),
            "VALUES ($1::text::BPCHAR, $2::text::TIMESTAMPTZ, $3)"
        );
        assert_eq!(rewrite_placeholders("SELECT '$'", &types), "SELECT '$'");
    }

    #[test]
    fn nulls_bind_as_none() {
        assert_eq!(text_param(&Value::Null), None);
        assert_eq!(text_param(&Value::Float(2.0)), Some("2.0".to_string()));
    }

    const UPSERT: &str = "INSERT INTO \"stg\".\"seats\" (\"aircraft_code\", \"seat_no\", \"fare_conditions\") \
        VALUES ($1::text::BPCHAR, $2::text::VARCHAR, $3::text::VARCHAR) \
        ON CONFLICT (\"aircraft_code\", \"seat_no\") DO UPDATE SET \"fare_conditions\" = EXCLUDED.\"fare_conditions\"";

    #[test]
    fn pages_go_out_as_one_multi_row_statement() {
        let shape = BatchShape::parse(UPSERT).unwrap();
        assert_eq!(shape.width, 3);
        assert_eq!(shape.key_positions, [0, 1]);
        assert_eq!(shape.page_size(), 1_000);

        let sql = shape.statement(2);
        assert!(sql.contains(
            "VALUES ($1::text::BPCHAR, $2::text::VARCHAR, $3::text::VARCHAR), \
             ($4::text::BPCHAR, $5::text::VARCHAR, $6::text::VARCHAR) ON CONFLICT"
        ));
        assert!(sql.ends_with("= EXCLUDED.\"fare_conditions\""));
    }

    #[test]
    fn statements_without_conflict_clause_are_not_paged() {
        assert!(BatchShape::parse("INSERT INTO t (a) VALUES ($1)").is_none());
        assert!(BatchShape::parse("UPDATE t SET a = $1").is_none());
    }

    #[test]
    fn later_rows_win_within_a_page() {
        let rows = vec![
            vec![Value::text("SU9"), Value::text("1A"), Value::text("Economy")],
            vec![Value::text("SU9"), Value::text("2A"), Value::text("Economy")],
            vec![Value::text("SU9"), Value::text("1A"), Value::text("Business")],
            vec![Value::Null, Value::text("1A"), Value::text("Comfort")],
            vec![Value::Null, Value::text("1A"), Value::text("Comfort")],
        ];

        let kept = dedupe_last(&rows, &[0, 1]);
        assert_eq!(kept, [&rows[1], &rows[2], &rows[3], &rows[4]]);
    }
}
