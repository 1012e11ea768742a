//! In-process blob store and warehouse.
//!
//! `MemoryWarehouse` serves seeded result sets for queries, records other
//! statements, and applies the upsert statements built by
//! [`crate::upsert::UpsertSpec::statement`] to in-memory tables. Changes are
//! staged per transaction and only become visible on commit. NOT NULL
//! constraints and statement failures can be injected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::client::{BlobStore, ClientError, RelationalExecutor, Transaction};
use crate::rowset::{RowSet, Value};

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), StoredBlob>>,
    failing_keys: RwLock<HashSet<(String, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredBlob> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Makes every `put` and `get` on this key fail.
    pub async fn fail_key(&self, bucket: &str, key: &str) {
        self.failing_keys
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()));
    }

    async fn check(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        if self
            .failing_keys
            .read()
            .await
            .contains(&(bucket.to_string(), key.to_string()))
        {
            return Err(ClientError::new(format!("blob store unavailable for {bucket}/{key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ClientError> {
        self.check(bucket, key).await?;
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ClientError> {
        self.check(bucket, key).await?;
        self.object(bucket, key)
            .await
            .map(|blob| blob.bytes)
            .ok_or_else(|| ClientError::new(format!("no such key: {bucket}/{key}")))
    }
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl MemTable {
    fn column_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.columns.iter().position(|c| c == name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }
}

#[derive(Default)]
struct WarehouseState {
    tables: HashMap<String, MemTable>,
    queries: HashMap<(String, String), RowSet>,
    query_delays: HashMap<String, Duration>,
    not_null: HashSet<(String, String)>,
    failing_statements: Vec<String>,
    failing_rollbacks: bool,
    committed_statements: Vec<String>,
    commits: usize,
    rollbacks: usize,
}

#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `query(sql)` on `connection_id` returns `rows`.
    pub fn seed_query(&self, connection_id: &str, sql: &str, rows: RowSet) {
        self.lock()
            .queries
            .insert((connection_id.to_string(), sql.trim().to_string()), rows);
    }

    /// Queries whose text equals `sql` sleep for `delay` first.
    pub fn delay_query(&self, sql: &str, delay: Duration) {
        self.lock().query_delays.insert(sql.trim().to_string(), delay);
    }

    pub fn seed_table(&self, table: &str, rows: RowSet) {
        self.lock().tables.insert(
            table.to_string(),
            MemTable {
                columns: rows.columns().to_vec(),
                rows: rows.rows().to_vec(),
            },
        );
    }

    pub fn require_not_null(&self, table: &str, column: &str) {
        self.lock()
            .not_null
            .insert((table.to_string(), column.to_string()));
    }

    /// Any statement containing `fragment` fails.
    pub fn fail_statements_containing(&self, fragment: &str) {
        self.lock().failing_statements.push(fragment.to_string());
    }

    /// Every rollback is counted, then reported as failed.
    pub fn fail_rollbacks(&self) {
        self.lock().failing_rollbacks = true;
    }

    pub fn table(&self, table: &str) -> Option<RowSet> {
        let state = self.lock();
        let t = state.tables.get(table)?;
        RowSet::from_rows(t.columns.clone(), t.rows.clone()).ok()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    pub fn committed_statements(&self) -> Vec<String> {
        self.lock().committed_statements.clone()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }
}

#[async_trait]
impl RelationalExecutor for MemoryWarehouse {
    async fn begin(&self, connection_id: &str) -> Result<Box<dyn Transaction>, ClientError> {
        Ok(Box::new(MemoryTransaction {
            connection_id: connection_id.to_string(),
            warehouse: self.clone(),
            staged: HashMap::new(),
            statements: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    connection_id: String,
    warehouse: MemoryWarehouse,
    staged: HashMap<String, MemTable>,
    statements: Vec<String>,
}

impl MemoryTransaction {
    fn check_failure(&self, sql: &str) -> Result<(), ClientError> {
        let state = self.warehouse.lock();
        match state.failing_statements.iter().find(|f| sql.contains(f.as_str())) {
            Some(fragment) => Err(ClientError::new(format!(
                "statement failed (matched {fragment:?})"
            ))),
            None => Ok(()),
        }
    }

    fn apply_upsert(&mut self, shape: &UpsertShape, row: &[Value]) -> Result<(), ClientError> {
        if row.len() != shape.columns.len() {
            return Err(ClientError::new(format!(
                "bind message supplies {} parameters, statement requires {}",
                row.len(),
                shape.columns.len()
            )));
        }

        let not_null = self.warehouse.lock().not_null.clone();
        for (column, value) in shape.columns.iter().zip(row) {
            if value.is_null() && not_null.contains(&(shape.table.clone(), column.clone())) {
                return Err(ClientError::new(format!(
                    "null value in column \"{column}\" of relation \"{}\" violates not-null constraint",
                    shape.table
                )));
            }
        }

        if !self.staged.contains_key(&shape.table) {
            let committed = self
                .warehouse
                .lock()
                .tables
                .get(&shape.table)
                .cloned()
                .unwrap_or_default();
            self.staged.insert(shape.table.clone(), committed);
        }
        let table = self
            .staged
            .get_mut(&shape.table)
            .ok_or_else(|| ClientError::new(format!("relation \"{}\" vanished", shape.table)))?;

        let positions: Vec<usize> = shape.columns.iter().map(|c| table.column_index(c)).collect();
        let key_positions: Vec<(usize, usize)> = shape
            .conflict_key
            .iter()
            .filter_map(|k| shape.columns.iter().position(|c| c == k))
            .map(|stmt_idx| (stmt_idx, positions[stmt_idx]))
            .collect();

        let existing = table.rows.iter().position(|existing| {
            key_positions
                .iter()
                .all(|&(stmt_idx, table_idx)| existing[table_idx] == row[stmt_idx])
        });

        match existing {
            Some(row_idx) => {
                for (stmt_idx, column) in shape.columns.iter().enumerate() {
                    if shape.update_columns.contains(column) {
                        table.rows[row_idx][positions[stmt_idx]] = row[stmt_idx].clone();
                    }
                }
            }
            None => {
                let mut new_row = vec![Value::Null; table.columns.len()];
                for (stmt_idx, value) in row.iter().enumerate() {
                    new_row[positions[stmt_idx]] = value.clone();
                }
                table.rows.push(new_row);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&mut self, sql: &str) -> Result<RowSet, ClientError> {
        self.check_failure(sql)?;
        let key = sql.trim().to_string();
        let delay = self.warehouse.lock().query_delays.get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.warehouse
            .lock()
            .queries
            .get(&(self.connection_id.clone(), key))
            .cloned()
            .ok_or_else(|| {
                ClientError::new(format!(
                    "no result seeded for query on {}: {}",
                    self.connection_id,
                    sql.trim()
                ))
            })
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64, ClientError> {
        self.check_failure(sql)?;
        self.statements.push(sql.trim().to_string());
        Ok(0)
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, ClientError> {
        self.check_failure(sql)?;
        let shape = UpsertShape::parse(sql)?;
        for row in rows {
            self.apply_upsert(&shape, row)?;
        }
        self.statements.push(sql.to_string());
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), ClientError> {
        let MemoryTransaction {
            warehouse,
            staged,
            statements,
            ..
        } = *self;
        let mut state = warehouse.lock();
        state.tables.extend(staged);
        state.committed_statements.extend(statements);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClientError> {
        let mut state = self.warehouse.lock();
        state.rollbacks += 1;
        if state.failing_rollbacks {
            return Err(ClientError::new("connection lost during rollback"));
        }
        Ok(())
    }
}

/// The parts of a generated upsert statement the warehouse needs.
#[derive(Debug, PartialEq)]
struct UpsertShape {
    table: String,
    columns: Vec<String>,
    conflict_key: Vec<String>,
    update_columns: Vec<String>,
}

impl UpsertShape {
    fn parse(sql: &str) -> Result<Self, ClientError> {
        let unsupported = || ClientError::new(format!("unsupported statement: {sql}"));

        let rest = sql.trim().strip_prefix("INSERT INTO ").ok_or_else(unsupported)?;
        let (table, rest) = rest.split_once(" (").ok_or_else(unsupported)?;
        let (columns, rest) = rest.split_once(") VALUES (").ok_or_else(unsupported)?;
        let (_, rest) = rest.split_once(") ON CONFLICT (").ok_or_else(unsupported)?;
        let (keys, action) = rest.split_once(')').ok_or_else(unsupported)?;

        let update_columns = match action.trim() {
            "DO NOTHING" => Vec::new(),
            other => other
                .strip_prefix("DO UPDATE SET ")
                .ok_or_else(unsupported)?
                .split(", ")
                .filter_map(|assignment| assignment.split_once(" = "))
                .map(|(column, _)| unquote(column))
                .collect(),
        };

        Ok(Self {
            table: table.split('.').map(unquote).collect::<Vec<_>>().join("."),
            columns: columns.split(", ").map(unquote).collect(),
            conflict_key: keys.split(", ").map(unquote).collect(),
            update_columns,
        })
    }
}

fn unquote(ident: &str) -> String {
    let ident = ident.trim();
    ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map_or_else(|| ident.to_string(), |s| s.replace("\"\"", "\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowset;
    use crate::upsert::UpsertSpec;

    #[test]
    fn parses_generated_statement() {
        let sql = UpsertSpec::new("stg.seats", &["aircraft_code", "seat_no"])
            .statement(&["aircraft_code".into(), "seat_no".into(), "fare_conditions".into()])
            .unwrap();
        let shape = UpsertShape::parse(&sql).unwrap();
        assert_eq!(shape.table, "stg.seats");
        assert_eq!(shape.columns, ["aircraft_code", "seat_no", "fare_conditions"]);
        assert_eq!(shape.conflict_key, ["aircraft_code", "seat_no"]);
        assert_eq!(shape.update_columns, ["fare_conditions"]);
    }

    #[tokio::test]
    async fn staged_changes_only_visible_after_commit() {
        let warehouse = MemoryWarehouse::new();
        let sql = UpsertSpec::new("stg.bookings", &["book_ref"])
            .statement(&["book_ref".into(), "total_amount".into()])
            .unwrap();

        let mut tx = warehouse.begin("flight_wrh_db").await.unwrap();
        tx.execute_batch(&sql, &[vec![Value::text("00000F"), Value::Float(265700.0)]])
            .await
            .unwrap();
        assert_eq!(warehouse.row_count("stg.bookings"), 0);
        tx.commit().await.unwrap();
        assert_eq!(warehouse.row_count("stg.bookings"), 1);

        let mut tx = warehouse.begin("flight_wrh_db").await.unwrap();
        tx.execute_batch(&sql, &[vec![Value::text("000012"), Value::Float(37900.0)]])
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(warehouse.row_count("stg.bookings"), 1);
        assert_eq!(warehouse.rollbacks(), 1);
    }

    #[tokio::test]
    async fn seeded_queries_are_per_connection() {
        let warehouse = MemoryWarehouse::new();
        warehouse.seed_query("flight_src_db", "SELECT 1", rowset!(["one"], [1i64]));

        let mut tx = warehouse.begin("flight_src_db").await.unwrap();
        assert_eq!(tx.query("SELECT 1\n").await.unwrap().len(), 1);
        let mut other = warehouse.begin("flight_wrh_db").await.unwrap();
        assert!(other.query("SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn blob_store_round_trip_and_failures() {
        let store = MemoryBlobStore::new();
        store
            .put("extracted-data", "temp/seats.csv", b"a\n1\n".to_vec(), "application/csv")
            .await
            .unwrap();
        assert_eq!(store.get("extracted-data", "temp/seats.csv").await.unwrap(), b"a\n1\n");
        assert!(store.get("extracted-data", "temp/none.csv").await.is_err());

        store.fail_key("extracted-data", "temp/seats.csv").await;
        assert!(store.get("extracted-data", "temp/seats.csv").await.is_err());
    }
}
