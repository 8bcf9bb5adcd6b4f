//! Session operations built on the lock, the aggregate store and the
//! notifier.
//!
//! Multi-field transitions run under the session lock as load, mutate, save.
//! This layer owns the facilitator capability check and input validation;
//! the layers below never inspect the key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::CallContext;
use crate::dispatch::{Message, MessageDispatcher, MessageType};
use crate::kv::StoreError;
use crate::lock::{session_lock_key, LockError, LockManager};
use crate::notify::{DisconnectReport, NotifyError};
use crate::session::{
    ParticipantView, SessionAggregate, SessionError, SessionStore, SessionView, StartRequest, User,
    UserRole,
};
use crate::stats::Principal;

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    /// The session lock could not be taken before the caller's deadline.
    #[error("Session {0} is busy")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LockError> for OpsError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Cancelled { lock_id } => Self::Busy(lock_id),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for OpsError {
    fn from(e: SessionError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<StoreError> for OpsError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<NotifyError> for OpsError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::Lock(e) => e.into(),
            e => Self::Internal(e.to_string()),
        }
    }
}

/// Facilitator change to session-level flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub votes_shown: bool,
    pub facilitator_points: bool,
}

pub struct SessionOps {
    locks: LockManager,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl SessionOps {
    pub fn new(
        locks: LockManager,
        sessions: Arc<SessionStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Self {
        Self {
            locks,
            sessions,
            dispatcher,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub async fn start(
        &self,
        ctx: &CallContext,
        principal: &Principal,
        request: StartRequest,
    ) -> Result<SessionAggregate, OpsError> {
        validate_user(&request.facilitator)?;
        let connection_id = request.connection_id.clone();
        let session = self.sessions.start(ctx, principal, request).await?;
        if !connection_id.is_empty() {
            self.push(ctx, &connection_id, MessageType::SessionCreated, &session)
                .await;
        }
        Ok(session)
    }

    /// Current view for `connection_id`, also pushed to it as `SESSION_LOADED`.
    /// A non-empty connection is registered as a watcher first, so it keeps
    /// receiving updates.
    pub async fn load(
        &self,
        ctx: &CallContext,
        session_id: &str,
        connection_id: &str,
    ) -> Result<SessionView, OpsError> {
        let session = self.require(ctx, session_id).await?;
        let view = session.view_for(connection_id);
        if !connection_id.is_empty() {
            self.sessions
                .notifier()
                .record_watcher(ctx, session_id, connection_id)
                .await?;
            self.push(ctx, connection_id, MessageType::SessionLoaded, &view)
                .await;
        }
        Ok(view)
    }

    /// Start receiving updates for a session without joining it.
    pub async fn watch(
        &self,
        ctx: &CallContext,
        principal: &Principal,
        session_id: &str,
        connection_id: &str,
    ) -> Result<ParticipantView, OpsError> {
        require_connection(connection_id)?;
        let session = self.require(ctx, session_id).await?;
        let extra = self
            .sessions
            .stats()
            .and_then(|s| s.session_watch(principal));
        self.sessions
            .notifier()
            .record_watcher_with(ctx, session_id, connection_id, extra)
            .await?;

        let view = session.participant_view(connection_id);
        self.push(ctx, connection_id, MessageType::SessionUpdated, &view)
            .await;
        Ok(view)
    }

    /// Add `user` as a participant on `connection_id`. Rejoining on the same
    /// connection replaces the earlier entry.
    pub async fn join(
        &self,
        ctx: &CallContext,
        principal: &Principal,
        session_id: &str,
        connection_id: &str,
        user: User,
    ) -> Result<ParticipantView, OpsError> {
        validate_user(&user)?;
        require_connection(connection_id)?;
        let user = user.with_connection(connection_id);

        self.locks
            .with_lock(ctx, &session_lock_key(session_id), move || async move {
                let mut session = self.require(ctx, session_id).await?;
                let extra = self
                    .sessions
                    .stats()
                    .and_then(|s| s.session_join(principal));
                self.sessions
                    .save_user(ctx, session_id, &user, UserRole::Participant, extra)
                    .await?;

                match session
                    .participants
                    .iter_mut()
                    .find(|p| p.is_connection(connection_id))
                {
                    Some(existing) => *existing = user.clone(),
                    None => session.participants.push(user.clone()),
                }
                self.broadcast(ctx, &session).await;
                info!(session_id, user_id = %user.user_id, "participant joined");
                Ok(session.participant_view(connection_id))
            })
            .await
    }

    /// Record the vote of whoever owns `connection_id`. The facilitator may
    /// vote only when facilitator points are enabled.
    pub async fn vote(
        &self,
        ctx: &CallContext,
        principal: &Principal,
        session_id: &str,
        connection_id: &str,
        vote: &str,
    ) -> Result<SessionView, OpsError> {
        if vote.trim().is_empty() {
            return Err(OpsError::Validation(vec!["vote is required".to_string()]));
        }
        require_connection(connection_id)?;

        self.locks
            .with_lock(ctx, &session_lock_key(session_id), move || async move {
                let mut session = self.require(ctx, session_id).await?;
                let facilitator_points = session.facilitator_points;
                let (role, user) = match session.user_for_connection_mut(connection_id) {
                    Some((UserRole::Facilitator, _)) if !facilitator_points => {
                        return Err(OpsError::PermissionDenied(
                            "facilitator points are disabled".to_string(),
                        ));
                    }
                    Some((role, user)) => {
                        user.current_vote = Some(vote.to_string());
                        (role, user.clone())
                    }
                    None => {
                        return Err(OpsError::PermissionDenied(format!(
                            "connection is not part of session {}",
                            session_id
                        )));
                    }
                };

                let extra = self.sessions.stats().and_then(|s| s.vote(principal));
                self.sessions
                    .save_user(ctx, session_id, &user, role, extra)
                    .await?;
                self.broadcast(ctx, &session).await;
                Ok(session.view_for(connection_id))
            })
            .await
    }

    /// Reveal or hide votes and toggle facilitator points.
    pub async fn update(
        &self,
        ctx: &CallContext,
        session_id: &str,
        facilitator_key: &str,
        request: UpdateRequest,
    ) -> Result<SessionAggregate, OpsError> {
        self.mutate_as_facilitator(ctx, session_id, facilitator_key, |session| {
            session.votes_shown = request.votes_shown;
            session.facilitator_points = request.facilitator_points;
        })
        .await
    }

    /// Hide votes and clear every vote for the next round.
    pub async fn clear_votes(
        &self,
        ctx: &CallContext,
        session_id: &str,
        facilitator_key: &str,
    ) -> Result<SessionAggregate, OpsError> {
        self.mutate_as_facilitator(ctx, session_id, facilitator_key, |session| {
            session.votes_shown = false;
            session.clear_votes();
        })
        .await
    }

    /// Point the facilitator row at a new connection, e.g. after a reload.
    pub async fn reclaim_facilitator(
        &self,
        ctx: &CallContext,
        session_id: &str,
        facilitator_key: &str,
        connection_id: &str,
    ) -> Result<SessionAggregate, OpsError> {
        require_connection(connection_id)?;
        let session = self
            .mutate_as_facilitator(ctx, session_id, facilitator_key, |session| {
                session.facilitator.connection_id = connection_id.to_string();
            })
            .await?;
        self.push(
            ctx,
            connection_id,
            MessageType::FacilitatorSessionLoaded,
            &session,
        )
        .await;
        Ok(session)
    }

    pub async fn disconnect(
        &self,
        ctx: &CallContext,
        connection_id: &str,
    ) -> Result<DisconnectReport, OpsError> {
        Ok(self
            .sessions
            .notifier()
            .disconnect(ctx, connection_id)
            .await?)
    }

    async fn mutate_as_facilitator<F>(
        &self,
        ctx: &CallContext,
        session_id: &str,
        facilitator_key: &str,
        mutate: F,
    ) -> Result<SessionAggregate, OpsError>
    where
        F: FnOnce(&mut SessionAggregate),
    {
        self.locks
            .with_lock(ctx, &session_lock_key(session_id), move || async move {
                let mut session = self.require(ctx, session_id).await?;
                if session.facilitator_session_key != facilitator_key {
                    warn!(session_id, "facilitator key mismatch");
                    return Err(OpsError::PermissionDenied(
                        "invalid facilitator key".to_string(),
                    ));
                }
                mutate(&mut session);
                match self.sessions.save(ctx, &session).await {
                    Ok(_) => {}
                    Err(SessionError::NotifyFailed { source, .. }) => {
                        warn!(session_id, error = %source, "session saved without broadcast");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(session)
            })
            .await
    }

    async fn require(
        &self,
        ctx: &CallContext,
        session_id: &str,
    ) -> Result<SessionAggregate, OpsError> {
        self.sessions
            .load(ctx, session_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(session_id.to_string()))
    }

    /// Fan out after a single-row write; the write has already committed.
    async fn broadcast(&self, ctx: &CallContext, session: &SessionAggregate) {
        if let Err(e) = self.sessions.notifier().notify(ctx, session).await {
            warn!(session_id = %session.session_id, error = %e, "session broadcast failed");
        }
    }

    async fn push<T: Serialize>(
        &self,
        ctx: &CallContext,
        connection_id: &str,
        kind: MessageType,
        body: &T,
    ) {
        let result = match Message::new(kind, body) {
            Ok(message) => self.dispatcher.deliver(ctx, connection_id, &message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(connection_id, ?kind, error = %e, "error dispatching message");
        }
    }
}

fn require_connection(connection_id: &str) -> Result<(), OpsError> {
    if connection_id.is_empty() {
        return Err(OpsError::Validation(vec![
            "connection id is required".to_string(),
        ]));
    }
    Ok(())
}

fn validate_user(user: &User) -> Result<(), OpsError> {
    let mut errors = Vec::new();
    if user.name.trim().is_empty() {
        errors.push("user name is required".to_string());
    }
    if user.user_id.trim().is_empty() {
        errors.push("user id is required".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OpsError::Validation(errors))
    }
}
