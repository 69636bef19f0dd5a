use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A single row as exchanged with the store of record.
pub type Row = Map<String, Value>;

/// Table names in the store of record.
pub mod tables {
    pub const PROVIDERS: &str = "providers";
    pub const CREDENTIALS: &str = "api_keys";
    pub const SESSIONS: &str = "chat_sessions";
    pub const MESSAGES: &str = "messages";
    pub const USAGE: &str = "usage_tracking";
    pub const SUBSCRIPTIONS: &str = "subscriptions";
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Conjunction of exact-match equality conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self::new().eq("id", id)
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((column.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Whether every condition holds for `row`. A missing column matches only `null`.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(col, want)| row.get(col).unwrap_or(&Value::Null) == want)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Single-key ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Offset/limit pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Projection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub filter: Filter,
    pub order: Option<Order>,
    pub page: Option<Page>,
}

impl Query {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn asc(mut self, column: &str) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            direction: Direction::Asc,
        });
        self
    }

    pub fn desc(mut self, column: &str) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            direction: Direction::Desc,
        });
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.page = Some(Page { offset, limit });
        self
    }
}

/// One write inside an all-or-nothing batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert { table: String, row: Row },
    /// Fails the whole batch with `Error::Conflict` on a duplicate key.
    InsertUnique {
        table: String,
        row: Row,
        key_columns: Vec<String>,
    },
    Update { table: String, patch: Row, filter: Filter },
    Delete { table: String, filter: Filter },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::InsertUnique { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Abstraction over the remote relational store.
/// Enables MemoryStore for testing; production wires in a real backend.
///
/// Mutual exclusion lives here: `insert_unique` is the conditional insert and
/// `apply_atomic` the transaction the services rely on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>>;

    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Applies `patch` to every row matching `filter`, returning the updated rows.
    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> Result<Vec<Row>>;

    /// Returns the number of removed rows.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize>;

    /// Raises `column` to `value` on every row matching `filter` whose stored
    /// value is lower. Never lowers a value. Returns the number of rows that
    /// matched `filter`, whether or not they were raised.
    async fn update_max(&self, table: &str, filter: &Filter, column: &str, value: Value) -> Result<usize>;

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Row>>;

    /// Inserts `row` unless a row with equal values in all `key_columns` exists,
    /// in which case `Error::Conflict` is returned and nothing is written.
    async fn insert_unique(&self, table: &str, row: Row, key_columns: &[&str]) -> Result<Row>;

    /// Applies every op or none of them.
    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Serialize a typed model into a row.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Store(format!(
            "Expected an object row, got {}",
            other
        ))),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

pub fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(from_row).collect()
}

/// Build a patch row from `(column, value)` pairs.
pub fn patch<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matches_all_conditions() {
        let r = row(json!({"owner_id": "u1", "is_active": true}));
        assert!(Filter::new().eq("owner_id", "u1").matches(&r));
        assert!(Filter::new().eq("owner_id", "u1").eq("is_active", true).matches(&r));
        assert!(!Filter::new().eq("owner_id", "u1").eq("is_active", false).matches(&r));
    }

    #[test]
    fn test_filter_missing_column_matches_null_only() {
        let r = row(json!({"id": "a"}));
        assert!(Filter::new().eq("end_date", Value::Null).matches(&r));
        assert!(!Filter::new().eq("end_date", "2026-01-01").matches(&r));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&row(json!({"x": 1}))));
    }

    #[test]
    fn test_query_builder() {
        let q = Query::filtered(Filter::by_id("a"))
            .columns(&["id"])
            .desc("created_at")
            .page(20, 10);
        assert_eq!(q.columns, Some(vec!["id".to_string()]));
        assert_eq!(q.order.as_ref().unwrap().direction, Direction::Desc);
        assert_eq!(q.page, Some(Page { offset: 20, limit: 10 }));
    }

    #[test]
    fn test_to_row_rejects_non_objects() {
        let err = to_row(&42).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
