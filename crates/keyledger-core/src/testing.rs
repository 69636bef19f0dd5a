use crate::error::Result;
use crate::memory::MemoryStore;
use crate::store::{Filter, Query, Row, Store, WriteOp};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Store wrapper that pauses selected writes once, to interleave another
/// writer sharing the same `MemoryStore`.
pub(crate) struct StallingStore {
    inner: Arc<MemoryStore>,
    inserts: Mutex<HashMap<String, Duration>>,
    updates: Mutex<HashMap<String, Duration>>,
}

impl StallingStore {
    pub(crate) fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            inserts: Mutex::new(HashMap::new()),
            updates: Mutex::new(HashMap::new()),
        }
    }

    /// Delay the next insert into `table` by `pause`.
    pub(crate) fn stall_next_insert(&self, table: &str, pause: Duration) {
        self.inserts.lock().unwrap().insert(table.to_string(), pause);
    }

    /// Delay the next update of `table` by `pause`.
    pub(crate) fn stall_next_update(&self, table: &str, pause: Duration) {
        self.updates.lock().unwrap().insert(table.to_string(), pause);
    }

    async fn pause(slots: &Mutex<HashMap<String, Duration>>, table: &str) {
        let pause = slots.lock().unwrap().remove(table);
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }
}

#[async_trait]
impl Store for StallingStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        self.inner.select(table, query).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        Self::pause(&self.inserts, table).await;
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> Result<Vec<Row>> {
        Self::pause(&self.updates, table).await;
        self.inner.update(table, patch, filter).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
        self.inner.delete(table, filter).await
    }

    async fn update_max(&self, table: &str, filter: &Filter, column: &str, value: Value) -> Result<usize> {
        Self::pause(&self.updates, table).await;
        self.inner.update_max(table, filter, column, value).await
    }

    async fn get_by_id(&self, table: &str, id: &str) -> Result<Option<Row>> {
        self.inner.get_by_id(table, id).await
    }

    async fn insert_unique(&self, table: &str, row: Row, key_columns: &[&str]) -> Result<Row> {
        Self::pause(&self.inserts, table).await;
        self.inner.insert_unique(table, row, key_columns).await
    }

    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<()> {
        if let Some(op) = ops.first() {
            let table = op.table().to_string();
            Self::pause(&self.inserts, &table).await;
        }
        self.inner.apply_atomic(ops).await
    }
}
