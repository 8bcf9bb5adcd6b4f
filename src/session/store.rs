//! Transactional reads and writes of the session aggregate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{SessionAggregate, StartRequest, User, UserRole};
use super::rows::{encode_aggregate, encode_user, load_aggregate, watcher_key};
use crate::config::CoreConfig;
use crate::context::CallContext;
use crate::kv::{expiry_after, Condition, KvStore, RecordKey, StoreError, WriteOp};
use crate::notify::{NotifyError, NotifyReport, Notifier};
use crate::stats::{Principal, StatsUpdateFactory};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("Session call cancelled")]
    Cancelled,

    /// The write committed but watchers could not be enumerated.
    #[error("Session {session_id} saved but not broadcast: {source}")]
    NotifyFailed {
        session_id: String,
        #[source]
        source: NotifyError,
    },
}

impl SessionError {
    fn store(context: impl Into<String>, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => Self::Cancelled,
            source => Self::Store {
                context: context.into(),
                source,
            },
        }
    }
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    table: String,
    session_ttl: Duration,
    notifier: Arc<Notifier>,
    stats: Option<StatsUpdateFactory>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, table: impl Into<String>, notifier: Arc<Notifier>) -> Self {
        Self {
            kv,
            table: table.into(),
            session_ttl: crate::config::DEFAULT_SESSION_TIMEOUT,
            notifier,
            stats: None,
        }
    }

    pub fn from_config(kv: Arc<dyn KvStore>, notifier: Arc<Notifier>, config: &CoreConfig) -> Self {
        let store = Self::new(kv, config.session_table.clone(), notifier)
            .with_session_ttl(config.session_timeout);
        match &config.profile_table {
            Some(profiles) => store.with_stats(StatsUpdateFactory::new(profiles.clone())),
            None => store,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_stats(mut self, stats: StatsUpdateFactory) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn stats(&self) -> Option<&StatsUpdateFactory> {
        self.stats.as_ref()
    }

    /// Create a session owned by the request's facilitator.
    pub async fn start(
        &self,
        ctx: &CallContext,
        principal: &Principal,
        request: StartRequest,
    ) -> Result<SessionAggregate, SessionError> {
        let mut facilitator = request.facilitator;
        if !request.connection_id.is_empty() {
            facilitator.connection_id = request.connection_id;
        }
        let aggregate = SessionAggregate {
            session_id: Uuid::new_v4().to_string(),
            votes_shown: false,
            facilitator_session_key: Uuid::new_v4().to_string(),
            facilitator,
            facilitator_points: request.facilitator_points,
            participants: Vec::new(),
        };

        let expires_at = expiry_after(Utc::now(), self.session_ttl);
        let mut ops: Vec<WriteOp> = encode_aggregate(&aggregate, expires_at)
            .into_iter()
            .map(|record| WriteOp::Put {
                table: self.table.clone(),
                record,
                condition: Some(Condition::NotExists),
            })
            .collect();
        ops.extend(self.stats.as_ref().and_then(|s| s.session_start(principal)));

        self.kv
            .transact_write(ctx, ops)
            .await
            .map_err(|e| SessionError::store("error starting session", e))?;
        info!(session_id = %aggregate.session_id, "session started");
        Ok(aggregate)
    }

    /// `None` when the session does not exist.
    pub async fn load(
        &self,
        ctx: &CallContext,
        session_id: &str,
    ) -> Result<Option<SessionAggregate>, SessionError> {
        load_aggregate(self.kv.as_ref(), ctx, &self.table, session_id)
            .await
            .map_err(|e| SessionError::store(format!("error loading session {}", session_id), e))
    }

    /// Persist the whole aggregate, then broadcast it.
    ///
    /// Callers hold the session lock. The write is committed before any
    /// delivery; a broadcast failure does not undo it.
    pub async fn save(
        &self,
        ctx: &CallContext,
        aggregate: &SessionAggregate,
    ) -> Result<NotifyReport, SessionError> {
        let expires_at = expiry_after(Utc::now(), self.session_ttl);
        let ops = encode_aggregate(aggregate, expires_at)
            .into_iter()
            .map(|record| WriteOp::put(&self.table, record))
            .collect();
        self.kv
            .transact_write(ctx, ops)
            .await
            .map_err(|e| {
                SessionError::store(format!("error saving session {}", aggregate.session_id), e)
            })?;
        debug!(session_id = %aggregate.session_id, participants = aggregate.participants.len(), "session saved");

        self.notifier
            .notify(ctx, aggregate)
            .await
            .map_err(|source| SessionError::NotifyFailed {
                session_id: aggregate.session_id.clone(),
                source,
            })
    }

    /// Upsert one user row and drop that connection's watcher placeholder in
    /// the same transaction. `extra` rides along (usually a stats increment).
    ///
    /// Does not broadcast.
    pub async fn save_user(
        &self,
        ctx: &CallContext,
        session_id: &str,
        user: &User,
        role: UserRole,
        extra: Option<WriteOp>,
    ) -> Result<(), SessionError> {
        let expires_at = expiry_after(Utc::now(), self.session_ttl);
        let mut ops = vec![WriteOp::put(
            &self.table,
            encode_user(session_id, user, role, expires_at),
        )];
        if !user.connection_id.is_empty() {
            ops.push(WriteOp::delete(
                &self.table,
                RecordKey::sorted(session_id, watcher_key(&user.connection_id)),
            ));
        }
        ops.extend(extra);

        self.kv
            .transact_write(ctx, ops)
            .await
            .map_err(|e| SessionError::store(format!("error saving user in session {}", session_id), e))?;
        debug!(session_id, user_id = %user.user_id, ?role, "user saved");
        Ok(())
    }
}
