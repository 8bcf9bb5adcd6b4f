//! Fan-out and disconnect behaviour.
//!
//! Run with: cargo test --test notify_tests

mod common;

use std::time::Duration;

use common::{Fixture, SESSIONS};
use pointy_core::dispatch::{MessageType, RecordingDispatcher};
use pointy_core::kv::{FailPoint, KvStore};
use pointy_core::session::{User, UserRole};
use pointy_core::{session_lock_key, CallContext, DeliveryError, NotifyError};

async fn join(fx: &Fixture, session_id: &str, user: User) {
    fx.sessions
        .save_user(&CallContext::new(), session_id, &user, UserRole::Participant, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_one_dead_connection_does_not_stop_fan_out() {
    let fx = Fixture::with_dispatcher(RecordingDispatcher::new().with_gone("conn-dead"));
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    let sid = session.session_id.as_str();
    for conn in ["conn-a", "conn-dead", "conn-w"] {
        fx.notifier.record_watcher(&ctx, sid, conn).await.unwrap();
    }

    let report = fx.notifier.notify(&ctx, &session).await.unwrap();

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.delivered(), 3);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].connection_id, "conn-dead");
    assert!(matches!(failed[0].result, Err(DeliveryError::Gone(_))));

    let mut attempted = fx.dispatcher.attempts();
    attempted.sort();
    assert_eq!(attempted, vec!["conn-a", "conn-dead", "conn-f", "conn-w"]);
}

#[tokio::test]
async fn test_slow_connection_is_bounded_by_delivery_timeout() {
    let fx = Fixture::with_dispatcher(
        RecordingDispatcher::new().with_delay("conn-slow", Duration::from_secs(30)),
    );
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    fx.notifier
        .record_watcher(&ctx, &session.session_id, "conn-slow")
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = fx.notifier.notify(&ctx, &session).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.delivered(), 1);
    assert!(report
        .failed()
        .all(|o| matches!(o.result, Err(DeliveryError::Timeout))));
}

#[tokio::test]
async fn test_connection_sees_its_entitled_view() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    fx.notifier
        .record_watcher(&ctx, &session.session_id, "conn-w")
        .await
        .unwrap();

    fx.notifier.notify(&ctx, &session).await.unwrap();

    let facilitator = fx.dispatcher.delivered_to("conn-f");
    assert_eq!(facilitator.len(), 1);
    assert_eq!(facilitator[0].kind, MessageType::SessionUpdated);
    assert_eq!(
        facilitator[0].body["facilitatorSessionKey"],
        session.facilitator_session_key.as_str()
    );

    let watcher = fx.bodies_for("conn-w");
    assert_eq!(watcher.len(), 1);
    assert!(watcher[0].get("facilitatorSessionKey").is_none());
    assert_eq!(watcher[0]["sessionId"], session.session_id.as_str());
}

#[tokio::test]
async fn test_query_failure_fails_notify() {
    let fx = Fixture::new();
    let session = fx.start("conn-f", false).await;
    fx.kv.fail_on(FailPoint::Query);

    let err = fx
        .notifier
        .notify(&CallContext::new(), &session)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Query { .. }));
    assert!(fx.dispatcher.attempts().is_empty());
}

#[tokio::test]
async fn test_disconnect_removes_rows_and_notifies_remaining() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    let sid = session.session_id.as_str();
    join(&fx, sid, User::new("a", "Al").with_connection("conn-a")).await;
    fx.notifier.record_watcher(&ctx, sid, "conn-w").await.unwrap();

    let report = fx.notifier.disconnect(&ctx, "conn-a").await.unwrap();
    assert_eq!(report.rows_removed, 1);
    assert_eq!(report.sessions, vec![session.session_id.clone()]);

    let loaded = fx.sessions.load(&ctx, sid).await.unwrap().unwrap();
    assert!(loaded.participants.is_empty());

    let watcher = fx.bodies_for("conn-w");
    assert_eq!(watcher.len(), 1);
    assert_eq!(watcher[0]["participants"].as_array().map(Vec::len), Some(0));
    assert!(fx.dispatcher.delivered_to("conn-a").is_empty());
}

#[tokio::test]
async fn test_disconnect_twice_is_a_noop() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    fx.notifier
        .record_watcher(&ctx, &session.session_id, "conn-w")
        .await
        .unwrap();

    fx.notifier.disconnect(&ctx, "conn-w").await.unwrap();
    let deliveries = fx.dispatcher.delivered().len();

    let again = fx.notifier.disconnect(&ctx, "conn-w").await.unwrap();
    assert_eq!(again.rows_removed, 0);
    assert!(again.sessions.is_empty());
    assert_eq!(fx.dispatcher.delivered().len(), deliveries);
}

#[tokio::test]
async fn test_disconnect_spans_sessions() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let first = fx.start("conn-f1", false).await;
    let second = fx.start("conn-f2", false).await;
    for sid in [&first.session_id, &second.session_id] {
        fx.notifier.record_watcher(&ctx, sid, "conn-w").await.unwrap();
    }

    let report = fx.notifier.disconnect(&ctx, "conn-w").await.unwrap();
    assert_eq!(report.rows_removed, 2);
    assert_eq!(report.sessions.len(), 2);
    assert_eq!(fx.dispatcher.delivered_to("conn-f1").len(), 1);
    assert_eq!(fx.dispatcher.delivered_to("conn-f2").len(), 1);
    assert!(fx.kv.query_connection(&ctx, SESSIONS, "conn-w").await.unwrap().is_empty());
}

/// A save that loaded the aggregate before the disconnect must not write the
/// departed participant back.
#[tokio::test]
async fn test_disconnect_waits_for_session_lock() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    let sid = session.session_id.clone();
    join(&fx, &sid, User::new("a", "Al").with_connection("conn-a")).await;

    let guard = fx.locks.acquire(&ctx, &session_lock_key(&sid)).await.unwrap();
    let mut loaded = fx.sessions.load(&ctx, &sid).await.unwrap().unwrap();

    let notifier = fx.notifier.clone();
    let disconnect =
        tokio::spawn(async move { notifier.disconnect(&CallContext::new(), "conn-a").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!disconnect.is_finished());

    loaded.votes_shown = true;
    fx.sessions.save(&ctx, &loaded).await.unwrap();
    guard.release(&ctx).await.unwrap();

    let report = disconnect.await.unwrap().unwrap();
    assert_eq!(report.rows_removed, 1);

    let after = fx.sessions.load(&ctx, &sid).await.unwrap().unwrap();
    assert!(after.votes_shown);
    assert!(after.participants.is_empty());
    assert!(fx.kv.query_connection(&ctx, SESSIONS, "conn-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_gives_up_on_held_lock_without_deleting() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    let sid = session.session_id.as_str();
    fx.notifier.record_watcher(&ctx, sid, "conn-w").await.unwrap();
    let _held = fx.locks.acquire(&ctx, &session_lock_key(sid)).await.unwrap();

    let err = fx
        .notifier
        .disconnect(&CallContext::with_timeout(Duration::from_millis(30)), "conn-w")
        .await
        .unwrap_err();

    assert!(matches!(err, NotifyError::Lock(ref e) if e.is_cancelled()));
    assert_eq!(fx.kv.query_connection(&ctx, SESSIONS, "conn-w").await.unwrap().len(), 1);
}

/// Facilitator F starts without facilitator points, A joins and votes "5",
/// then votes are revealed.
#[tokio::test]
async fn test_reveal_scenario() {
    let fx = Fixture::new();
    let ctx = CallContext::new();
    let session = fx.start("conn-f", false).await;
    let sid = session.session_id.as_str();
    join(&fx, sid, User::new("a", "Al").with_vote("5").with_connection("conn-a")).await;

    let mut loaded = fx.sessions.load(&ctx, sid).await.unwrap().unwrap();
    loaded.votes_shown = true;
    fx.dispatcher.clear();
    fx.sessions.save(&ctx, &loaded).await.unwrap();

    let to_f = fx.bodies_for("conn-f");
    assert_eq!(to_f.len(), 1);
    assert_eq!(to_f[0]["participants"][0]["currentVote"], "5");
    assert!(to_f[0].get("facilitatorSessionKey").is_some());

    let to_a = fx.bodies_for("conn-a");
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_a[0]["participants"][0]["currentVote"], "5");
    assert!(to_a[0].get("facilitatorSessionKey").is_none());
}
