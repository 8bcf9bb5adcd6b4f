//! Shared wiring for integration tests: an in-memory store, a recording
//! dispatcher and the components built on them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pointy_core::dispatch::{Message, RecordingDispatcher};
use pointy_core::kv::MemoryStore;
use pointy_core::session::{StartRequest, User};
use pointy_core::{
    CallContext, LockManager, Notifier, SessionAggregate, SessionOps, SessionStore,
    StatsUpdateFactory,
};

pub const SESSIONS: &str = "sessions";
pub const LOCKS: &str = "locks";
pub const PROFILES: &str = "profiles";

pub struct Fixture {
    pub kv: Arc<MemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub notifier: Arc<Notifier>,
    pub sessions: Arc<SessionStore>,
    pub locks: LockManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_dispatcher(RecordingDispatcher::new())
    }

    pub fn with_dispatcher(dispatcher: RecordingDispatcher) -> Self {
        Self::build(MemoryStore::new(), dispatcher)
    }

    pub fn build(kv: MemoryStore, dispatcher: RecordingDispatcher) -> Self {
        let kv = Arc::new(kv);
        let dispatcher = Arc::new(dispatcher);
        let locks = LockManager::new(kv.clone(), LOCKS).with_retry(Duration::from_millis(1));
        let notifier = Arc::new(
            Notifier::new(kv.clone(), SESSIONS, dispatcher.clone(), locks.clone())
                .with_delivery_timeout(Duration::from_millis(200)),
        );
        let sessions = Arc::new(
            SessionStore::new(kv.clone(), SESSIONS, notifier.clone())
                .with_stats(StatsUpdateFactory::new(PROFILES)),
        );
        Self {
            kv,
            dispatcher,
            notifier,
            sessions,
            locks,
        }
    }

    pub fn ops(&self) -> SessionOps {
        SessionOps::new(self.locks.clone(), self.sessions.clone(), self.dispatcher.clone())
    }

    /// Start a session whose facilitator is connected on `conn`.
    pub async fn start(&self, conn: &str, facilitator_points: bool) -> SessionAggregate {
        self.sessions
            .start(
                &CallContext::new(),
                &pointy_core::Principal::new("facilitator-user"),
                StartRequest {
                    facilitator: User::new("f", "Fran"),
                    facilitator_points,
                    connection_id: conn.to_string(),
                },
            )
            .await
            .unwrap()
    }

    /// Bodies delivered to `conn`, in order.
    pub fn bodies_for(&self, conn: &str) -> Vec<serde_json::Value> {
        self.dispatcher
            .delivered_to(conn)
            .into_iter()
            .map(|m: Message| m.body)
            .collect()
    }
}
