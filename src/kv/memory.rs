//! In-memory store (for tests and single-process deployments)
//!
//! Honours the same conditional and transactional semantics as the database
//! backend. Optional per-call latency and failure injection make interleavings
//! and error paths reproducible in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{validate_batch, Condition, KvStore, Record, RecordKey, StoreError, WriteOp};
use crate::context::CallContext;

type Table = BTreeMap<RecordKey, Record>;

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Get,
    Query,
    Put,
    Delete,
    Transact,
}

/// In-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    latency: Option<Duration>,
    failures: Mutex<HashSet<FailPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every subsequent call of the given kind fail with a backend error.
    pub fn fail_on(&self, point: FailPoint) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(point);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Snapshot of every record in a table, in key order.
    pub async fn dump(&self, table: &str) -> Vec<Record> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `op` after injected latency, unless the context finishes first.
    async fn call<T, F>(&self, ctx: &CallContext, point: FailPoint, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let injected = self
            .failures
            .lock()
            .map(|f| f.contains(&point))
            .unwrap_or(false);
        if injected {
            return Err(StoreError::Backend(format!("injected failure: {:?}", point)));
        }
        let latency = self.latency;
        ctx.run(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            op.await
        })
        .await
        .ok_or(StoreError::Cancelled)?
    }
}

fn check(
    table: &str,
    key: &RecordKey,
    current: Option<&Record>,
    condition: Option<&Condition>,
) -> Result<(), StoreError> {
    match condition {
        Some(c) if !c.holds(current) => Err(StoreError::ConditionFailed {
            table: table.to_string(),
            key: key.clone(),
        }),
        _ => Ok(()),
    }
}

fn apply(tables: &mut HashMap<String, Table>, op: WriteOp) {
    match op {
        WriteOp::Put { table, record, .. } => {
            tables
                .entry(table)
                .or_default()
                .insert(record.key.clone(), record);
        }
        WriteOp::Delete { table, key, .. } => {
            if let Some(t) = tables.get_mut(&table) {
                t.remove(&key);
            }
        }
        WriteOp::Increment {
            table,
            key,
            field,
            amount,
        } => {
            let record = tables
                .entry(table)
                .or_default()
                .entry(key.clone())
                .or_insert_with(|| Record::new(key));
            let current = record.i64_field(&field).unwrap_or(0);
            record.body.insert(field, Value::from(current + amount));
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>, StoreError> {
        self.call(ctx, FailPoint::Get, async {
            let tables = self.tables.read().await;
            Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
        })
        .await
    }

    async fn query_partition(
        &self,
        ctx: &CallContext,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.call(ctx, FailPoint::Query, async {
            let tables = self.tables.read().await;
            Ok(tables
                .get(table)
                .map(|t| {
                    t.values()
                        .filter(|r| r.key.partition_key == partition_key)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
        .await
    }

    async fn query_connection(
        &self,
        ctx: &CallContext,
        table: &str,
        connection_id: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.call(ctx, FailPoint::Query, async {
            let tables = self.tables.read().await;
            Ok(tables
                .get(table)
                .map(|t| {
                    t.values()
                        .filter(|r| r.connection_id.as_deref() == Some(connection_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
        .await
    }

    async fn put(
        &self,
        ctx: &CallContext,
        table: &str,
        record: Record,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.call(ctx, FailPoint::Put, async {
            let mut tables = self.tables.write().await;
            let current = tables.get(table).and_then(|t| t.get(&record.key));
            check(table, &record.key, current, condition.as_ref())?;
            apply(&mut tables, WriteOp::put(table, record));
            Ok(())
        })
        .await
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.call(ctx, FailPoint::Delete, async {
            let mut tables = self.tables.write().await;
            let current = tables.get(table).and_then(|t| t.get(key));
            check(table, key, current, condition.as_ref())?;
            apply(&mut tables, WriteOp::delete(table, key.clone()));
            Ok(())
        })
        .await
    }

    async fn transact_write(&self, ctx: &CallContext, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        validate_batch(&ops)?;
        self.call(ctx, FailPoint::Transact, async {
            let mut tables = self.tables.write().await;
            // All conditions are checked before anything is applied.
            for op in &ops {
                let condition = match op {
                    WriteOp::Put { condition, .. } | WriteOp::Delete { condition, .. } => {
                        condition.as_ref()
                    }
                    WriteOp::Increment { .. } => None,
                };
                let current = tables.get(op.table()).and_then(|t| t.get(op.key()));
                check(op.table(), op.key(), current, condition)?;
            }
            for op in ops {
                apply(&mut tables, op);
            }
            Ok(())
        })
        .await
    }

    async fn purge_expired(
        &self,
        ctx: &CallContext,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.call(ctx, FailPoint::Delete, async {
            let mut tables = self.tables.write().await;
            let Some(t) = tables.get_mut(table) else {
                return Ok(0);
            };
            let before = t.len();
            t.retain(|_, r| !r.is_expired_at(now));
            Ok((before - t.len()) as u64)
        })
        .await
    }
}
