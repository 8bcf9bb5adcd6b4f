//! Lease-based distributed lock
//!
//! A lock is a record in the lock table whose existence means "held". Holders
//! write it with a conditional insert and delete it on exit; the TTL
//! (`expires_at`) is the lease. A crashed holder's record is purged by the next
//! contender once the lease has passed, so the lock heals itself without any
//! heartbeat.
//!
//! The lease must exceed the longest critical section. If a holder overruns
//! it, another contender may purge the record and enter concurrently.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::config::CoreConfig;
use crate::context::CallContext;
use crate::kv::{expiry_after, Condition, KvStore, Record, RecordKey, StoreError};

/// Default wait between attempts on a held lock.
pub const DEFAULT_RETRY: Duration = Duration::from_millis(5);

/// Default lease length.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(1);

/// Lock id guarding every multi-row transition of one session.
pub fn session_lock_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The caller's context finished while waiting. Expected under contention.
    #[error("Acquisition of lock {lock_id} cancelled")]
    Cancelled { lock_id: String },

    #[error("Lock {lock_id} store failure: {source}")]
    Store {
        lock_id: String,
        #[source]
        source: StoreError,
    },
}

impl LockError {
    fn store(lock_id: &str, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => Self::Cancelled {
                lock_id: lock_id.to_string(),
            },
            source => Self::Store {
                lock_id: lock_id.to_string(),
                source,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// What a contender found when it looked at a held lock.
enum Contention {
    /// The record disappeared between the insert and the read.
    Vanished,
    /// The record was past its lease and has been removed.
    Purged,
    /// A live holder, or a purge race lost to another contender.
    Held,
}

/// Acquires and releases leases in one lock table.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    table: String,
    retry: Duration,
    lease: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            retry: DEFAULT_RETRY,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn from_config(store: Arc<dyn KvStore>, config: &CoreConfig) -> Self {
        Self::new(store, config.lock_table.clone())
            .with_retry(config.lock_retry)
            .with_lease(config.lock_lease)
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Block until `lock_id` is held or `ctx` finishes.
    ///
    /// There is no attempt cap. Waiting is bounded only by the context's
    /// deadline or cancellation.
    pub async fn acquire(&self, ctx: &CallContext, lock_id: &str) -> Result<LockGuard, LockError> {
        let key = RecordKey::partition(lock_id);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let now = Utc::now();
            let expires_at = expiry_after(now, self.lease);
            let record = Record::new(key.clone())
                .with_expiry(expires_at)
                .with_field("acquiredAt", now.to_rfc3339());

            match self
                .store
                .put(ctx, &self.table, record, Some(Condition::NotExists))
                .await
            {
                Ok(()) => {
                    debug!(lock_id, attempts, "lock acquired");
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        table: self.table.clone(),
                        lock_id: lock_id.to_string(),
                        expires_at,
                        released: false,
                    });
                }
                Err(e) if e.is_condition_failed() => {}
                Err(e) => return Err(LockError::store(lock_id, e)),
            }

            if ctx.is_done() {
                debug!(lock_id, attempts, "lock acquisition cancelled");
                return Err(LockError::Cancelled {
                    lock_id: lock_id.to_string(),
                });
            }

            match self.inspect(ctx, lock_id, &key).await? {
                Contention::Vanished | Contention::Purged => continue,
                Contention::Held => {
                    if ctx.run(tokio::time::sleep(self.retry)).await.is_none() {
                        return Err(LockError::Cancelled {
                            lock_id: lock_id.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn inspect(
        &self,
        ctx: &CallContext,
        lock_id: &str,
        key: &RecordKey,
    ) -> Result<Contention, LockError> {
        let existing = self
            .store
            .get(ctx, &self.table, key)
            .await
            .map_err(|e| LockError::store(lock_id, e))?;
        let Some(existing) = existing else {
            return Ok(Contention::Vanished);
        };
        let Some(observed) = existing.expires_at else {
            warn!(lock_id, "lock record has no lease; treating as held");
            return Ok(Contention::Held);
        };
        if observed > Utc::now() {
            return Ok(Contention::Held);
        }

        match self
            .store
            .delete(ctx, &self.table, key, Some(Condition::ExpiresAt(observed)))
            .await
        {
            Ok(()) => {
                warn!(lock_id, expired_at = %observed, "purged abandoned lock");
                Ok(Contention::Purged)
            }
            // Another contender purged or re-acquired first.
            Err(e) if e.is_condition_failed() => Ok(Contention::Held),
            Err(e) => Err(LockError::store(lock_id, e)),
        }
    }

    /// Run `action` while holding `lock_id`.
    ///
    /// The lock is released on every exit path, including a panic inside
    /// `action`, which is resumed after the release. Release failures are
    /// logged; the lease expires the record regardless.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        lock_id: &str,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.acquire(ctx, lock_id).await?;
        let outcome = AssertUnwindSafe(action()).catch_unwind().await;

        // The caller's context may already be done; release under its own budget.
        let release_ctx = CallContext::with_timeout(self.lease);
        if let Err(e) = guard.release(&release_ctx).await {
            error!(lock_id, error = %e, "unable to release lock");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Proof of holding a lock. Release explicitly with [`LockGuard::release`];
/// dropping an unreleased guard schedules a background release.
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    table: String,
    lock_id: String,
    expires_at: DateTime<Utc>,
    released: bool,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once the lease has passed and another contender may purge it.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Delete the lock record. Releasing an absent record succeeds.
    pub async fn release(mut self, ctx: &CallContext) -> Result<(), LockError> {
        let key = RecordKey::partition(self.lock_id.as_str());
        self.store
            .delete(ctx, &self.table, &key, None)
            .await
            .map_err(|e| LockError::store(&self.lock_id, e))?;
        self.released = true;
        debug!(lock_id = %self.lock_id, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock_id = %self.lock_id, "lock guard dropped outside a runtime; lease will expire it");
            return;
        };
        let store = Arc::clone(&self.store);
        let table = std::mem::take(&mut self.table);
        let lock_id = std::mem::take(&mut self.lock_id);
        let timeout = (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(DEFAULT_LEASE);
        handle.spawn(async move {
            let ctx = CallContext::with_timeout(timeout.max(DEFAULT_LEASE));
            let key = RecordKey::partition(lock_id.as_str());
            if let Err(e) = store.delete(&ctx, &table, &key, None).await {
                warn!(lock_id = %lock_id, error = %e, "background lock release failed");
            }
        });
    }
}
