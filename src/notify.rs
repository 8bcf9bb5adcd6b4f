//! Interest tracking and change fan-out.
//!
//! Every row in a session partition that carries a `connection_id` marks a
//! connection interested in that session: watchers, participants and the
//! facilitator. [`Notifier::notify`] pushes each of them the view it is
//! entitled to; [`Notifier::disconnect`] removes a connection from every
//! session it touched and tells whoever is left.
//!
//! Disconnect reshuffles membership, so each session's cleanup runs under
//! that session's lock. A full-aggregate save loaded before the cleanup
//! would otherwise write the removed rows back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::context::CallContext;
use crate::dispatch::{DeliveryError, Message, MessageDispatcher, MessageType};
use crate::kv::{expiry_after, KvStore, RecordKey, StoreError, WriteOp};
use crate::lock::{session_lock_key, LockError, LockManager};
use crate::session::model::SessionAggregate;
use crate::session::rows::{encode_watcher, load_aggregate};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Unable to enumerate watchers of session {session_id}: {source}")]
    Query {
        session_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Unable to look up rows for connection {connection_id}: {source}")]
    ConnectionLookup {
        connection_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Unable to clean up connection {connection_id}: {source}")]
    Cleanup {
        connection_id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub connection_id: String,
    pub result: Result<(), DeliveryError>,
}

/// Per-connection results of a fan-out.
#[derive(Debug, Default)]
pub struct NotifyReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl NotifyReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

#[derive(Debug, Default)]
pub struct DisconnectReport {
    pub rows_removed: usize,
    /// Sessions whose remaining watchers were notified.
    pub sessions: Vec<String>,
}

pub struct Notifier {
    kv: Arc<dyn KvStore>,
    table: String,
    dispatcher: Arc<dyn MessageDispatcher>,
    locks: LockManager,
    watcher_ttl: Duration,
    delivery_timeout: Duration,
}

impl Notifier {
    pub fn new(
        kv: Arc<dyn KvStore>,
        table: impl Into<String>,
        dispatcher: Arc<dyn MessageDispatcher>,
        locks: LockManager,
    ) -> Self {
        Self {
            kv,
            table: table.into(),
            dispatcher,
            locks,
            watcher_ttl: crate::config::DEFAULT_SESSION_TIMEOUT,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub fn from_config(
        kv: Arc<dyn KvStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: &CoreConfig,
    ) -> Self {
        let locks = LockManager::from_config(kv.clone(), config);
        Self::new(kv, config.session_table.clone(), dispatcher, locks)
            .with_watcher_ttl(config.session_timeout)
            .with_delivery_timeout(config.delivery_timeout)
    }

    pub fn with_watcher_ttl(mut self, ttl: Duration) -> Self {
        self.watcher_ttl = ttl;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Register interest of `connection_id` in a session.
    pub async fn record_watcher(
        &self,
        ctx: &CallContext,
        session_id: &str,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        self.record_watcher_with(ctx, session_id, connection_id, None)
            .await
    }

    /// Like [`Notifier::record_watcher`], committing `extra` in the same
    /// transaction.
    pub async fn record_watcher_with(
        &self,
        ctx: &CallContext,
        session_id: &str,
        connection_id: &str,
        extra: Option<WriteOp>,
    ) -> Result<(), StoreError> {
        let expires_at = expiry_after(Utc::now(), self.watcher_ttl);
        let mut ops = vec![WriteOp::put(
            &self.table,
            encode_watcher(session_id, connection_id, expires_at),
        )];
        ops.extend(extra);
        self.kv.transact_write(ctx, ops).await?;
        debug!(session_id, connection_id, "watcher recorded");
        Ok(())
    }

    /// Push the current state of `aggregate` to every interested connection.
    ///
    /// Delivery failures are logged and reported, never returned.
    pub async fn notify(
        &self,
        ctx: &CallContext,
        aggregate: &SessionAggregate,
    ) -> Result<NotifyReport, NotifyError> {
        let session_id = aggregate.session_id.as_str();
        let records = self
            .kv
            .query_partition(ctx, &self.table, session_id)
            .await
            .map_err(|source| NotifyError::Query {
                session_id: session_id.to_string(),
                source,
            })?;

        let connections: BTreeSet<String> = records
            .into_iter()
            .filter_map(|r| r.connection_id)
            .filter(|c| !c.is_empty())
            .collect();

        let deliveries = connections.into_iter().map(move |connection_id| async move {
            let result = self.deliver_view(ctx, aggregate, &connection_id).await;
            if let Err(e) = &result {
                warn!(session_id, connection_id = %connection_id, error = %e, "error notifying observer");
            }
            DeliveryOutcome {
                connection_id,
                result,
            }
        });
        let report = NotifyReport {
            outcomes: join_all(deliveries).await,
        };
        debug!(
            session_id,
            attempted = report.outcomes.len(),
            delivered = report.delivered(),
            "fan-out complete"
        );
        Ok(report)
    }

    async fn deliver_view(
        &self,
        ctx: &CallContext,
        aggregate: &SessionAggregate,
        connection_id: &str,
    ) -> Result<(), DeliveryError> {
        let message = Message::new(MessageType::SessionUpdated, &aggregate.view_for(connection_id))?;
        let bounded = ctx.child(Some(self.delivery_timeout));
        bounded
            .run(self.dispatcher.deliver(&bounded, connection_id, &message))
            .await
            .ok_or(DeliveryError::Timeout)?
    }

    /// Forget `connection_id` everywhere and notify the sessions it left.
    ///
    /// Rows are grouped by session; each group is deleted and the session
    /// re-notified while holding that session's lock. A connection with no
    /// rows is a no-op.
    pub async fn disconnect(
        &self,
        ctx: &CallContext,
        connection_id: &str,
    ) -> Result<DisconnectReport, NotifyError> {
        let records = self
            .kv
            .query_connection(ctx, &self.table, connection_id)
            .await
            .map_err(|source| NotifyError::ConnectionLookup {
                connection_id: connection_id.to_string(),
                source,
            })?;

        let mut report = DisconnectReport::default();
        if records.is_empty() {
            debug!(connection_id, "disconnect with no rows");
            return Ok(report);
        }

        let mut by_session: BTreeMap<String, Vec<RecordKey>> = BTreeMap::new();
        for record in records {
            by_session
                .entry(record.key.partition_key.clone())
                .or_default()
                .push(record.key);
        }

        for (session_id, keys) in by_session {
            let removed = self
                .locks
                .with_lock(ctx, &session_lock_key(&session_id), || {
                    self.remove_from_session(ctx, connection_id, &session_id, keys)
                })
                .await?;
            report.rows_removed += removed;
            report.sessions.push(session_id);
        }

        info!(
            connection_id,
            rows = report.rows_removed,
            sessions = report.sessions.len(),
            "connection disconnected"
        );
        Ok(report)
    }

    /// Delete `keys` from one session and notify whoever remains. Caller
    /// holds the session lock.
    async fn remove_from_session(
        &self,
        ctx: &CallContext,
        connection_id: &str,
        session_id: &str,
        keys: Vec<RecordKey>,
    ) -> Result<usize, NotifyError> {
        let mut removed = 0;
        for key in keys {
            self.kv
                .delete(ctx, &self.table, &key, None)
                .await
                .map_err(|source| NotifyError::Cleanup {
                    connection_id: connection_id.to_string(),
                    source,
                })?;
            removed += 1;
        }

        let aggregate = load_aggregate(self.kv.as_ref(), ctx, &self.table, session_id)
            .await
            .map_err(|source| NotifyError::Query {
                session_id: session_id.to_string(),
                source,
            })?;
        match aggregate {
            Some(aggregate) => {
                self.notify(ctx, &aggregate).await?;
            }
            None => debug!(session_id, "session gone; nobody to notify"),
        }
        Ok(removed)
    }
}
