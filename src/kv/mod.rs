//! Key-Value Store Abstraction
//!
//! The single shared store every process coordinates through. The model is a
//! set of named tables holding [`Record`]s addressed by a partition key and an
//! optional sort key, with one secondary index on `connection_id` and a TTL
//! column (`expires_at`).
//!
//! Backends must provide conditional single-item writes and all-or-nothing
//! multi-item transactions; everything above this module (locks, the session
//! aggregate, fan-out) is built from those two primitives.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::{Map, Value};

use crate::context::CallContext;

pub use memory::{FailPoint, MemoryStore};
#[cfg(feature = "database")]
pub use postgres::PgKvStore;

// ============================================================================
// Errors
// ============================================================================

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Condition failed for {key} in {table}")]
    ConditionFailed { table: String, key: RecordKey },

    #[error("Transaction rejected: {0}")]
    TransactionConflict(String),

    #[error("Store call cancelled")]
    Cancelled,

    #[error("Malformed record {key} in {table}: {reason}")]
    Malformed {
        table: String,
        key: RecordKey,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }
}

// ============================================================================
// Records
// ============================================================================

/// Primary key of a record within a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl RecordKey {
    pub fn new(partition_key: impl Into<String>, sort_key: Option<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key,
        }
    }

    /// Key for single-key tables (locks, profiles).
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self::new(partition_key, None)
    }

    pub fn sorted(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self::new(partition_key, Some(sort_key.into()))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort_key {
            Some(sort) => write!(f, "{}/{}", self.partition_key, sort),
            None => write!(f, "{}", self.partition_key),
        }
    }
}

/// One stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    /// Secondary-index attribute: the live push connection referenced by this row.
    pub connection_id: Option<String>,
    /// TTL; rows past it are garbage and may be swept.
    pub expires_at: Option<DateTime<Utc>>,
    /// Remaining attributes.
    pub body: Map<String, Value>,
}

impl Record {
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            connection_id: None,
            expires_at: None,
            body: Map::new(),
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.body.insert(name.to_string(), value.into());
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.body.get(name).and_then(Value::as_bool)
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.body.get(name).and_then(Value::as_i64)
    }

    /// Required string attribute, or a `Malformed` error naming the table.
    pub fn require_str(&self, table: &str, name: &str) -> Result<&str, StoreError> {
        self.str_field(name).ok_or_else(|| StoreError::Malformed {
            table: table.to_string(),
            key: self.key.clone(),
            reason: format!("missing string attribute '{}'", name),
        })
    }
}

// ============================================================================
// Conditions and write operations
// ============================================================================

/// Precondition evaluated atomically against the current item.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// No item with this key exists.
    NotExists,
    /// An item with this key exists.
    Exists,
    /// An item exists and its TTL equals the given value.
    ExpiresAt(DateTime<Utc>),
}

impl Condition {
    /// Evaluate against the item currently stored under the key.
    pub fn holds(&self, current: Option<&Record>) -> bool {
        match self {
            Self::NotExists => current.is_none(),
            Self::Exists => current.is_some(),
            Self::ExpiresAt(expected) => {
                current.is_some_and(|r| r.expires_at.as_ref() == Some(expected))
            }
        }
    }
}

/// One element of an atomic multi-item write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        table: String,
        record: Record,
        condition: Option<Condition>,
    },
    Delete {
        table: String,
        key: RecordKey,
        condition: Option<Condition>,
    },
    /// Add `amount` to a numeric attribute, creating the item if missing.
    Increment {
        table: String,
        key: RecordKey,
        field: String,
        amount: i64,
    },
}

impl WriteOp {
    pub fn put(table: &str, record: Record) -> Self {
        Self::Put {
            table: table.to_string(),
            record,
            condition: None,
        }
    }

    pub fn delete(table: &str, key: RecordKey) -> Self {
        Self::Delete {
            table: table.to_string(),
            key,
            condition: None,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Put { table, .. } | Self::Delete { table, .. } | Self::Increment { table, .. } => {
                table
            }
        }
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            Self::Put { record, .. } => &record.key,
            Self::Delete { key, .. } | Self::Increment { key, .. } => key,
        }
    }
}

/// Reject batches that touch the same item twice; backends call this before
/// applying anything.
pub fn validate_batch(ops: &[WriteOp]) -> Result<(), StoreError> {
    if ops.is_empty() {
        return Err(StoreError::TransactionConflict("empty transaction".to_string()));
    }
    let mut seen = HashSet::with_capacity(ops.len());
    for op in ops {
        if !seen.insert((op.table(), op.key())) {
            return Err(StoreError::TransactionConflict(format!(
                "item {} in {} appears more than once",
                op.key(),
                op.table()
            )));
        }
    }
    Ok(())
}

/// `now + ttl`, truncated to milliseconds so TTL values compare equal after a
/// round trip through any backend.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .trunc_subsecs(3)
}

// ============================================================================
// Store trait
// ============================================================================

/// Shared store used by every process; all coordination goes through it.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch one item.
    async fn get(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>, StoreError>;

    /// All items sharing a partition key, ordered by sort key.
    async fn query_partition(
        &self,
        ctx: &CallContext,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<Record>, StoreError>;

    /// All items referencing a connection, across partitions.
    async fn query_connection(
        &self,
        ctx: &CallContext,
        table: &str,
        connection_id: &str,
    ) -> Result<Vec<Record>, StoreError>;

    /// Insert or replace one item, optionally guarded by a condition.
    async fn put(
        &self,
        ctx: &CallContext,
        table: &str,
        record: Record,
        condition: Option<Condition>,
    ) -> Result<(), StoreError>;

    /// Delete one item. Deleting an absent item without a condition succeeds.
    async fn delete(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError>;

    /// Apply every operation or none of them.
    async fn transact_write(&self, ctx: &CallContext, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Physically remove rows whose TTL is at or before `now`. Returns rows removed.
    async fn purge_expired(
        &self,
        ctx: &CallContext,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_holds() {
        let exp = expiry_after(Utc::now(), Duration::from_secs(5));
        let rec = Record::new(RecordKey::partition("lock")).with_expiry(exp);

        assert!(Condition::NotExists.holds(None));
        assert!(!Condition::NotExists.holds(Some(&rec)));
        assert!(Condition::Exists.holds(Some(&rec)));
        assert!(Condition::ExpiresAt(exp).holds(Some(&rec)));
        assert!(!Condition::ExpiresAt(exp + chrono::Duration::milliseconds(1)).holds(Some(&rec)));
        assert!(!Condition::ExpiresAt(exp).holds(None));
    }

    #[test]
    fn test_validate_batch_rejects_duplicate_items() {
        let key = RecordKey::sorted("s1", "session");
        let ops = vec![
            WriteOp::put("sessions", Record::new(key.clone())),
            WriteOp::delete("sessions", key),
        ];
        assert!(matches!(
            validate_batch(&ops),
            Err(StoreError::TransactionConflict(_))
        ));
    }

    #[test]
    fn test_validate_batch_allows_same_key_in_other_table() {
        let key = RecordKey::partition("u1");
        let ops = vec![
            WriteOp::put("a", Record::new(key.clone())),
            WriteOp::put("b", Record::new(key)),
        ];
        assert!(validate_batch(&ops).is_ok());
        assert!(validate_batch(&[]).is_err());
    }

    #[test]
    fn test_expiry_is_millisecond_precision() {
        let exp = expiry_after(Utc::now(), Duration::from_millis(1500));
        assert_eq!(exp.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::sorted("s1", "user:c1").to_string(), "s1/user:c1");
        assert_eq!(RecordKey::partition("session:s1").to_string(), "session:s1");
    }
}
