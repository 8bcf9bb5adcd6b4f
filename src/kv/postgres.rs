//! PostgreSQL-backed store
//!
//! All tables share one physical relation, `kv_records`, keyed by
//! `(table_name, partition_key, sort_key)`. Absent sort keys are stored as the
//! empty string. Conditional writes are single statements whose `WHERE` clause
//! carries the condition; `rows_affected() == 0` means the condition failed.
//!
//! NOTE: All queries use runtime-checked sqlx::query() instead of compile-time
//! sqlx::query!() macros because the relation is created by [`PgKvStore::migrate`]
//! and may not exist at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;

use super::{validate_batch, Condition, KvStore, Record, RecordKey, StoreError, WriteOp};
use crate::context::CallContext;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS kv_records (
        table_name    TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        sort_key      TEXT NOT NULL DEFAULT '',
        connection_id TEXT,
        expires_at    TIMESTAMPTZ,
        body          JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (table_name, partition_key, sort_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS kv_records_connection_idx
        ON kv_records (table_name, connection_id)
        WHERE connection_id IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS kv_records_expiry_idx
        ON kv_records (table_name, expires_at)
        WHERE expires_at IS NOT NULL
    "#,
];

/// Row shape shared by every select.
#[derive(Debug, FromRow)]
struct KvRow {
    partition_key: String,
    sort_key: String,
    connection_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    body: Value,
}

impl KvRow {
    fn into_record(self, table: &str) -> Result<Record, StoreError> {
        let key = RecordKey::new(
            self.partition_key,
            (!self.sort_key.is_empty()).then_some(self.sort_key),
        );
        let Value::Object(body) = self.body else {
            return Err(StoreError::Malformed {
                table: table.to_string(),
                key,
                reason: "body is not a JSON object".to_string(),
            });
        };
        Ok(Record {
            key,
            connection_id: self.connection_id,
            expires_at: self.expires_at,
            body,
        })
    }
}

fn sort_key(key: &RecordKey) -> &str {
    key.sort_key.as_deref().unwrap_or("")
}

fn condition_failed(table: &str, key: &RecordKey) -> StoreError {
    StoreError::ConditionFailed {
        table: table.to_string(),
        key: key.clone(),
    }
}

/// Postgres implementation of [`KvStore`].
#[derive(Clone)]
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    /// Create the backing relation and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn select(
        &self,
        ctx: &CallContext,
        table: &str,
        sql: &str,
        arg: &str,
    ) -> Result<Vec<Record>, StoreError> {
        let rows: Vec<KvRow> = ctx
            .run(
                sqlx::query_as::<_, KvRow>(sql)
                    .bind(table)
                    .bind(arg)
                    .fetch_all(&self.pool),
            )
            .await
            .ok_or(StoreError::Cancelled)??;
        rows.into_iter().map(|r| r.into_record(table)).collect()
    }
}

/// Apply one write on an open connection or transaction.
async fn apply(conn: &mut PgConnection, op: &WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Put {
            table,
            record,
            condition,
        } => {
            let body = Value::Object(record.body.clone());
            let result = match condition {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_records
                            (table_name, partition_key, sort_key, connection_id, expires_at, body)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (table_name, partition_key, sort_key) DO UPDATE
                        SET connection_id = EXCLUDED.connection_id,
                            expires_at = EXCLUDED.expires_at,
                            body = EXCLUDED.body
                        "#,
                    )
                    .bind(table)
                    .bind(&record.key.partition_key)
                    .bind(sort_key(&record.key))
                    .bind(&record.connection_id)
                    .bind(record.expires_at)
                    .bind(&body)
                    .execute(&mut *conn)
                    .await?
                }
                Some(Condition::NotExists) => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_records
                            (table_name, partition_key, sort_key, connection_id, expires_at, body)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (table_name, partition_key, sort_key) DO NOTHING
                        "#,
                    )
                    .bind(table)
                    .bind(&record.key.partition_key)
                    .bind(sort_key(&record.key))
                    .bind(&record.connection_id)
                    .bind(record.expires_at)
                    .bind(&body)
                    .execute(&mut *conn)
                    .await?
                }
                Some(Condition::Exists) | Some(Condition::ExpiresAt(_)) => {
                    let expected = match condition {
                        Some(Condition::ExpiresAt(at)) => Some(*at),
                        _ => None,
                    };
                    sqlx::query(
                        r#"
                        UPDATE kv_records
                        SET connection_id = $4, expires_at = $5, body = $6
                        WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                          AND ($7::timestamptz IS NULL OR expires_at = $7)
                        "#,
                    )
                    .bind(table)
                    .bind(&record.key.partition_key)
                    .bind(sort_key(&record.key))
                    .bind(&record.connection_id)
                    .bind(record.expires_at)
                    .bind(&body)
                    .bind(expected)
                    .execute(&mut *conn)
                    .await?
                }
            };
            if condition.is_some() && result.rows_affected() == 0 {
                return Err(condition_failed(table, &record.key));
            }
        }
        WriteOp::Delete {
            table,
            key,
            condition,
        } => {
            let expected = match condition {
                Some(Condition::ExpiresAt(at)) => Some(*at),
                _ => None,
            };
            if matches!(condition, Some(Condition::NotExists)) {
                // Deleting "only if absent" is a pure existence check.
                let exists: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM kv_records
                        WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                    )
                    "#,
                )
                .bind(table)
                .bind(&key.partition_key)
                .bind(sort_key(key))
                .fetch_one(&mut *conn)
                .await?;
                if exists {
                    return Err(condition_failed(table, key));
                }
                return Ok(());
            }
            let result = sqlx::query(
                r#"
                DELETE FROM kv_records
                WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                  AND ($4::timestamptz IS NULL OR expires_at = $4)
                "#,
            )
            .bind(table)
            .bind(&key.partition_key)
            .bind(sort_key(key))
            .bind(expected)
            .execute(&mut *conn)
            .await?;
            if condition.is_some() && result.rows_affected() == 0 {
                return Err(condition_failed(table, key));
            }
        }
        WriteOp::Increment {
            table,
            key,
            field,
            amount,
        } => {
            sqlx::query(
                r#"
                INSERT INTO kv_records (table_name, partition_key, sort_key, body)
                VALUES ($1, $2, $3, jsonb_build_object($4::text, $5::bigint))
                ON CONFLICT (table_name, partition_key, sort_key) DO UPDATE
                SET body = kv_records.body || jsonb_build_object(
                    $4::text,
                    COALESCE((kv_records.body ->> $4)::bigint, 0) + $5::bigint
                )
                "#,
            )
            .bind(table)
            .bind(&key.partition_key)
            .bind(sort_key(key))
            .bind(field)
            .bind(amount)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>, StoreError> {
        let row: Option<KvRow> = ctx
            .run(
                sqlx::query_as::<_, KvRow>(
                    r#"
                    SELECT partition_key, sort_key, connection_id, expires_at, body
                    FROM kv_records
                    WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                    "#,
                )
                .bind(table)
                .bind(&key.partition_key)
                .bind(sort_key(key))
                .fetch_optional(&self.pool),
            )
            .await
            .ok_or(StoreError::Cancelled)??;
        row.map(|r| r.into_record(table)).transpose()
    }

    async fn query_partition(
        &self,
        ctx: &CallContext,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.select(
            ctx,
            table,
            r#"
            SELECT partition_key, sort_key, connection_id, expires_at, body
            FROM kv_records
            WHERE table_name = $1 AND partition_key = $2
            ORDER BY sort_key
            "#,
            partition_key,
        )
        .await
    }

    async fn query_connection(
        &self,
        ctx: &CallContext,
        table: &str,
        connection_id: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.select(
            ctx,
            table,
            r#"
            SELECT partition_key, sort_key, connection_id, expires_at, body
            FROM kv_records
            WHERE table_name = $1 AND connection_id = $2
            ORDER BY partition_key, sort_key
            "#,
            connection_id,
        )
        .await
    }

    async fn put(
        &self,
        ctx: &CallContext,
        table: &str,
        record: Record,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let op = WriteOp::Put {
            table: table.to_string(),
            record,
            condition,
        };
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            apply(&mut *conn, &op).await
        })
        .await
        .ok_or(StoreError::Cancelled)?
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        table: &str,
        key: &RecordKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let op = WriteOp::Delete {
            table: table.to_string(),
            key: key.clone(),
            condition,
        };
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            apply(&mut *conn, &op).await
        })
        .await
        .ok_or(StoreError::Cancelled)?
    }

    async fn transact_write(&self, ctx: &CallContext, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        validate_batch(&ops)?;
        ctx.run(async {
            let mut tx = self.pool.begin().await?;
            for op in &ops {
                // Dropping `tx` on error rolls back everything applied so far.
                apply(&mut *tx, op).await?;
            }
            tx.commit().await?;
            debug!(items = ops.len(), "transaction committed");
            Ok(())
        })
        .await
        .ok_or(StoreError::Cancelled)?
    }

    async fn purge_expired(
        &self,
        ctx: &CallContext,
        table: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = ctx
            .run(
                sqlx::query(
                    r#"
                    DELETE FROM kv_records
                    WHERE table_name = $1 AND expires_at IS NOT NULL AND expires_at <= $2
                    "#,
                )
                .bind(table)
                .bind(now)
                .execute(&self.pool),
            )
            .await
            .ok_or(StoreError::Cancelled)??;
        Ok(result.rows_affected())
    }
}
