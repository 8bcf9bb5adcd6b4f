//! PostgreSQL store integration tests
//!
//! Skipped unless DATABASE_URL points at a reachable database.
//!
//! Run with: cargo test --test postgres_store_tests --features database

#![cfg(feature = "database")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use pointy_core::dispatch::RecordingDispatcher;
use pointy_core::kv::{expiry_after, Condition, KvStore, PgKvStore, Record, RecordKey, WriteOp};
use pointy_core::session::User;
use pointy_core::{CallContext, LockManager, Notifier, SessionStore};

/// Test fixture with per-run table names so runs never collide.
struct TestFixture {
    store: Arc<PgKvStore>,
    test_id: String,
}

impl TestFixture {
    async fn new() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgKvStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        let test_id = Uuid::new_v4().to_string()[..8].to_string();
        Some(Self {
            store: Arc::new(store),
            test_id,
        })
    }

    fn table(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.test_id)
    }
}

#[tokio::test]
async fn test_conditional_writes() {
    let Some(fx) = TestFixture::new().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let ctx = CallContext::new();
    let table = fx.table("locks");
    let exp = expiry_after(Utc::now(), Duration::from_secs(5));
    let record = || Record::new(RecordKey::partition("k")).with_expiry(exp);

    fx.store
        .put(&ctx, &table, record(), Some(Condition::NotExists))
        .await
        .unwrap();
    assert!(fx
        .store
        .put(&ctx, &table, record(), Some(Condition::NotExists))
        .await
        .unwrap_err()
        .is_condition_failed());

    let stored = fx
        .store
        .get(&ctx, &table, &RecordKey::partition("k"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.expires_at, Some(exp));

    fx.store
        .delete(&ctx, &table, &RecordKey::partition("k"), Some(Condition::ExpiresAt(exp)))
        .await
        .unwrap();
    assert!(fx
        .store
        .get(&ctx, &table, &RecordKey::partition("k"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_transaction_rolls_back() {
    let Some(fx) = TestFixture::new().await else {
        return;
    };
    let ctx = CallContext::new();
    let table = fx.table("sessions");
    fx.store
        .put(&ctx, &table, Record::new(RecordKey::sorted("s", "taken")), None)
        .await
        .unwrap();

    let result = fx
        .store
        .transact_write(
            &ctx,
            vec![
                WriteOp::put(&table, Record::new(RecordKey::sorted("s", "fresh"))),
                WriteOp::Put {
                    table: table.clone(),
                    record: Record::new(RecordKey::sorted("s", "taken")),
                    condition: Some(Condition::NotExists),
                },
            ],
        )
        .await;
    assert!(result.is_err());
    assert_eq!(fx.store.query_partition(&ctx, &table, "s").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_round_trip_and_lock() {
    let Some(fx) = TestFixture::new().await else {
        return;
    };
    let ctx = CallContext::with_timeout(Duration::from_secs(10));
    let sessions_table = fx.table("sessions");
    let kv: Arc<dyn KvStore> = fx.store.clone();
    let locks = LockManager::new(kv.clone(), fx.table("locks"));
    let notifier = Arc::new(Notifier::new(
        kv.clone(),
        sessions_table.clone(),
        Arc::new(RecordingDispatcher::new()),
        locks.clone(),
    ));
    let sessions = SessionStore::new(kv, sessions_table, notifier);

    let mut session = sessions
        .start(
            &ctx,
            &pointy_core::Principal::anonymous(),
            pointy_core::session::StartRequest {
                facilitator: User::new("f", "Fran"),
                facilitator_points: false,
                connection_id: "conn-f".to_string(),
            },
        )
        .await
        .unwrap();

    let guard = locks
        .acquire(&ctx, &pointy_core::session_lock_key(&session.session_id))
        .await
        .unwrap();
    session
        .participants
        .push(User::new("a", "Al").with_vote("5").with_connection("conn-a"));
    sessions.save(&ctx, &session).await.unwrap();
    guard.release(&ctx).await.unwrap();

    let loaded = sessions.load(&ctx, &session.session_id).await.unwrap();
    assert_eq!(loaded, Some(session));
}
