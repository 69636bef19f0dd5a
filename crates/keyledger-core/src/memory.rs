use crate::error::{Error, Result};
use crate::store::{Direction, Filter, Query, Row, Store, WriteOp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ---------------------------------------------------------------------------
// MemoryStore — in-memory implementation for testing
// ---------------------------------------------------------------------------

/// Store of record kept in process memory.
///
/// Every operation takes the same lock, so `insert_unique` and `apply_atomic`
/// are trivially atomic. Writes to a table can be made to fail to simulate an
/// outage of the persistence layer.
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every subsequent write touching `table` fail with `Error::Store`.
    pub fn fail_writes_to(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    pub fn restore_writes_to(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
    }

    /// Number of rows currently in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.rows()
            .get(table)
            .map_or(0, |rows| rows.len())
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(table) {
            return Err(Error::Store(format!("{} is unavailable", table)));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_op(tables: &mut HashMap<String, Vec<Row>>, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::Insert { table, row } => tables.entry(table).or_default().push(row),
        WriteOp::InsertUnique {
            table,
            row,
            key_columns,
        } => {
            let rows = tables.entry(table.clone()).or_default();
            let keys: Vec<&str> = key_columns.iter().map(String::as_str).collect();
            ensure_unique(&table, &*rows, &row, &keys)?;
            rows.push(row);
        }
        WriteOp::Update {
            table,
            patch,
            filter,
        } => {
            if let Some(rows) = tables.get_mut(&table) {
                for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                    row.extend(patch.clone());
                }
            }
        }
        WriteOp::Delete { table, filter } => {
            if let Some(rows) = tables.get_mut(&table) {
                rows.retain(|r| !filter.matches(r));
            }
        }
    }
    Ok(())
}

fn ensure_unique(table: &str, rows: &[Row], row: &Row, key_columns: &[&str]) -> Result<()> {
    let key = key_columns.iter().fold(Filter::new(), |f, col| {
        f.eq(col, row.get(*col).cloned().unwrap_or(Value::Null))
    });
    if rows.iter().any(|r| key.matches(r)) {
        return Err(Error::Conflict {
            table: table.to_string(),
            detail: format!("duplicate ({})", key_columns.join(", ")),
        });
    }
    Ok(())
}

fn project(row: &Row, columns: &Option<Vec<String>>) -> Row {
    match columns {
        None => row.clone(),
        Some(cols) => row
            .iter()
            .filter(|(k, _)| cols.iter().any(|c| c == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// Total order over JSON scalars. Timestamps are compared as instants rather
/// than as text, since RFC 3339 strings with differing precision do not sort
/// lexically.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (
                x.parse::<DateTime<Utc>>(),
                y.parse::<DateTime<Utc>>(),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let tables = self.rows();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        let rows = match query.page {
            Some(page) => rows
                .into_iter()
                .skip(page.offset)
                .take(page.limit)
                .collect(),
            None => rows,
        };

        Ok(rows.iter().map(|r| project(r, &query.columns)).collect())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        self.check_writable(table)?;
        let mut tables = self.rows();
        tables.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> Result<Vec<Row>> {
        self.check_writable(table)?;
        let mut tables = self.rows();
        let mut updated = Vec::new();
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                row.extend(patch.clone());
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
        self.check_writable(table)?;
        let mut tables = self.rows();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok(before - rows.len())
    }

    async fn update_max(&self, table: &str, filter: &Filter, column: &str, value: Value) -> Result<usize> {
        self.check_writable(table)?;
        let mut tables = self.rows();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let mut matched = 0;
        for row in rows.iter_mut().filter(|r| filter.matches(r)) {
            matched += 1;
            let current = row.get(column).unwrap_or(&Value::Null);
            if compare_values(current, &value) == Ordering::Less {
                row.insert(column.to_string(), value.clone());
            }
        }
        Ok(matched)
    }

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Row>> {
        let tables = self.rows();
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
        }))
    }

    async fn insert_unique(&self, table: &str, row: Row, key_columns: &[&str]) -> Result<Row> {
        self.check_writable(table)?;
        let mut tables = self.rows();
        let rows = tables.entry(table.to_string()).or_default();
        ensure_unique(table, &*rows, &row, key_columns)?;
        rows.push(row.clone());
        Ok(row)
    }

    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<()> {
        for op in &ops {
            self.check_writable(op.table())?;
        }
        let mut tables = self.rows();
        let mut staged = tables.clone();
        for op in ops {
            apply_op(&mut staged, op)?;
        }
        *tables = staged;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
