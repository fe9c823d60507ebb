//! Integration tests for the session cache lifecycle.
//!
//! These drive the cache against the in-memory store and check loading,
//! sharing, teardown and failure handling end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use serde::Deserialize;
use serde_json::json;
use sharestate_client::{
    Access, ClientError, Config, ConnectionIdentityMismatch, DocumentCreator, MemoryBackend,
    RemoteConnection, RemoteError, SessionCache, SessionStatus, SharedStateProvider,
};
use sharestate_engine::{path, projector, Action, DocKey, Op, OpComponent};

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn loads_existing_document_then_follows_remote_ops() {
    let h = Harness::new();
    h.seed("counters", "a", json!({"count": 0}));

    let access = h.cache.access("counters", "a");
    tokio::pin!(access);
    assert!(futures::poll!(access.as_mut()).is_pending());

    h.backend.flush();
    let mut sub = access.await.unwrap();
    assert_eq!(sub.state(), json!({"count": 0}));

    let remote = h.backend.connect();
    let doc = remote.get(&DocKey::new("counters", "a"));
    doc.subscribe();
    h.backend.flush();

    let ack = doc.submit_op(Op::from(OpComponent::number_add(path!["count"], 1)));
    h.backend.flush();
    ack.await.unwrap();

    assert_eq!(sub.try_changed(), Some(json!({"count": 1})));
    assert_eq!(sub.state(), json!({"count": 1}));
}

#[tokio::test]
async fn document_stays_subscribed_until_last_consumer_leaves() {
    let h = Harness::new();
    h.seed("counters", "b", json!({"count": 0}));
    let key = DocKey::new("counters", "b");

    let first = h.load("counters", "b").await;
    let second = h.load("counters", "b").await;
    let calls = h.conn.calls("counters", "b");

    drop(first);
    assert_eq!(h.cache.status("counters", "b"), Some(SessionStatus::Resolved));
    assert_eq!(calls.unsubscribes(), 0);
    h.backend.flush();
    assert_eq!(h.backend.subscriber_count(&key), 1);

    drop(second);
    assert_eq!(calls.unsubscribes(), 1);
    assert_eq!(calls.destroys(), 1);
    assert!(h.cache.is_empty());

    h.backend.flush();
    assert_eq!(h.backend.subscriber_count(&key), 0);
    assert!(h.conn.inner().doc(&key).is_none());
}

#[tokio::test]
async fn waits_for_a_document_created_later() {
    let h = Harness::new();

    let access = h.cache.access("notes", "c");
    tokio::pin!(access);
    assert!(futures::poll!(access.as_mut()).is_pending());

    // subscribed, but nothing to load yet
    h.backend.flush();
    assert!(futures::poll!(access.as_mut()).is_pending());
    assert_eq!(h.cache.status("notes", "c"), Some(SessionStatus::Pending));

    let other = h.backend.connect();
    other
        .get(&DocKey::new("notes", "c"))
        .create(json!({"doc_id": "c"}));
    h.backend.flush();

    let sub = access.await.unwrap();
    assert_eq!(sub.state(), json!({"doc_id": "c"}));
}

#[tokio::test]
async fn creator_in_scope_resolves_waiting_consumer() {
    let backend = MemoryBackend::new();
    let provider = SharedStateProvider::managed(Arc::new(backend.clone()), Config::default());

    let state = provider
        .scope(async {
            let cache = SessionCache::current().unwrap();
            let access = cache.access("notes", "d");
            tokio::pin!(access);
            assert!(futures::poll!(access.as_mut()).is_pending());

            DocumentCreator::current()
                .unwrap()
                .create("notes", "d", json!({"doc_id": "d"}));
            backend.flush();

            access.await.unwrap().state()
        })
        .await;

    assert_eq!(state, json!({"doc_id": "d"}));
}

// ============================================================================
// Load sharing and teardown
// ============================================================================

#[tokio::test]
async fn concurrent_accesses_subscribe_once() {
    let h = Harness::new();
    h.seed("counters", "p1", json!({"count": 0}));
    let calls = h.conn.calls("counters", "p1");

    let mut waiting = Vec::new();
    for _ in 0..5 {
        match h.cache.try_access("counters", "p1", None).unwrap() {
            Access::Pending(suspension) => waiting.push(suspension),
            Access::Ready(_) => panic!("nothing is loaded yet"),
        }
    }
    assert_eq!(calls.subscribes(), 1);
    assert_eq!(h.cache.session("counters", "p1").unwrap().waiters(), 5);

    h.backend.flush();
    for suspension in &mut waiting {
        suspension.await.unwrap();
    }
    let subs: Vec<_> = (0..5)
        .map(|_| match h.cache.try_access("counters", "p1", None).unwrap() {
            Access::Ready(sub) => sub,
            Access::Pending(_) => panic!("document is loaded"),
        })
        .collect();
    drop(waiting);

    assert_eq!(calls.subscribes(), 1);
    assert_eq!(h.cache.session("counters", "p1").unwrap().ref_count(), 5);
    drop(subs);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn concurrent_async_accesses_share_the_load() {
    let h = Harness::new();
    h.seed("counters", "p1b", json!({"count": 0}));

    let accesses = futures::future::join_all((0..3).map(|_| h.cache.access("counters", "p1b")));
    tokio::pin!(accesses);
    assert!(futures::poll!(accesses.as_mut()).is_pending());
    assert_eq!(h.conn.calls("counters", "p1b").subscribes(), 1);

    h.backend.flush();
    let subs = accesses.await;
    assert!(subs.iter().all(|sub| sub.is_ok()));
    assert_eq!(h.cache.session("counters", "p1b").unwrap().ref_count(), 3);
}

#[tokio::test]
async fn last_release_unsubscribes_then_destroys() {
    let h = Harness::new();
    h.seed("counters", "p2", json!({"count": 0}));

    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(h.load("counters", "p2").await);
    }
    let calls = h.conn.calls("counters", "p2");

    subs.truncate(1);
    assert_eq!(h.cache.status("counters", "p2"), Some(SessionStatus::Resolved));
    assert_eq!(calls.unsubscribes(), 0);
    assert_eq!(calls.destroys(), 0);

    subs.clear();
    assert_eq!(calls.log(), vec!["subscribe", "unsubscribe", "destroy"]);
}

#[tokio::test]
async fn remount_after_teardown_loads_again() {
    let h = Harness::new();
    h.seed("counters", "again", json!({"count": 3}));

    drop(h.load("counters", "again").await);
    assert!(h.cache.is_empty());

    let sub = h.load("counters", "again").await;
    assert_eq!(sub.state(), json!({"count": 3}));
    assert_eq!(h.conn.calls("counters", "again").subscribes(), 2);
}

#[tokio::test]
async fn abandoned_load_is_evicted_when_it_settles() {
    let h = Harness::new();
    h.seed("counters", "p6", json!({"count": 0}));
    let calls = h.conn.calls("counters", "p6");

    let suspension = match h.cache.try_access("counters", "p6", None).unwrap() {
        Access::Pending(suspension) => suspension,
        Access::Ready(_) => panic!("nothing is loaded yet"),
    };
    drop(suspension);
    assert_eq!(h.cache.status("counters", "p6"), Some(SessionStatus::Pending));

    h.backend.flush();
    assert!(h.cache.is_empty());
    assert_eq!(calls.log(), vec!["subscribe", "unsubscribe", "destroy"]);

    h.backend.flush();
    assert_eq!(h.backend.subscriber_count(&DocKey::new("counters", "p6")), 0);
}

#[tokio::test]
async fn abandoned_failed_load_stays_rejected() {
    let h = Harness::new();
    let key = DocKey::new("counters", "p6-fail");
    h.backend
        .fail_next_load(key.clone(), RemoteError::Transport("refused".into()));
    let calls = h.conn.calls("counters", "p6-fail");

    let suspension = match h.cache.try_access("counters", "p6-fail", None).unwrap() {
        Access::Pending(suspension) => suspension,
        Access::Ready(_) => panic!("nothing is loaded yet"),
    };
    drop(suspension);

    h.backend.flush();
    assert_eq!(
        h.cache.status("counters", "p6-fail"),
        Some(SessionStatus::Rejected)
    );
    assert!(matches!(
        h.cache.try_access("counters", "p6-fail", None),
        Err(ClientError::LoadFailure { .. })
    ));
    assert_eq!(calls.log(), vec!["subscribe"]);

    assert!(h.cache.retry("counters", "p6-fail"));
    assert_eq!(calls.log(), vec!["subscribe", "unsubscribe", "destroy"]);
}

#[tokio::test]
async fn release_delay_keeps_session_for_quick_remount() {
    let delay = Duration::from_millis(40);
    let h = Harness::with_config(Config::default().with_release_delay(delay));
    h.seed("counters", "p9", json!({"count": 0}));
    let calls = h.conn.calls("counters", "p9");

    drop(h.load("counters", "p9").await);
    assert_eq!(h.cache.status("counters", "p9"), Some(SessionStatus::Resolved));

    let sub = h.load("counters", "p9").await;
    assert_eq!(calls.subscribes(), 1);

    // the first release must not fire while the session is in use again
    tokio::time::sleep(delay * 3).await;
    assert_eq!(calls.unsubscribes(), 0);

    drop(sub);
    tokio::time::sleep(delay * 3).await;
    assert_eq!(calls.log(), vec!["subscribe", "unsubscribe", "destroy"]);
    assert!(h.cache.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn load_failure_reaches_every_waiter() {
    let h = Harness::new();
    let key = DocKey::new("counters", "p7");
    h.backend
        .fail_next_load(key.clone(), RemoteError::Transport("refused".into()));

    let first = h.cache.access("counters", "p7");
    let second = h.cache.access("counters", "p7");
    tokio::pin!(first);
    tokio::pin!(second);
    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    h.backend.flush();
    let expected = ClientError::LoadFailure {
        key: key.clone(),
        source: RemoteError::Transport("refused".into()),
    };
    assert_eq!(first.await.unwrap_err(), expected);
    assert_eq!(second.await.unwrap_err(), expected);

    // stays rejected until retried
    assert_eq!(h.cache.status("counters", "p7"), Some(SessionStatus::Rejected));
    assert_eq!(
        h.cache.try_access("counters", "p7", None).unwrap_err(),
        expected
    );
}

#[tokio::test]
async fn retry_loads_a_rejected_document_again() {
    let h = Harness::new();
    h.seed("counters", "retry", json!({"count": 7}));
    h.backend.fail_next_load(
        DocKey::new("counters", "retry"),
        RemoteError::Transport("flaky".into()),
    );

    let access = h.cache.access("counters", "retry");
    tokio::pin!(access);
    assert!(futures::poll!(access.as_mut()).is_pending());
    h.backend.flush();
    assert!(matches!(
        access.await,
        Err(ClientError::LoadFailure { .. })
    ));

    assert!(h.cache.retry("counters", "retry"));
    assert!(h.cache.is_empty());

    let sub = h.load("counters", "retry").await;
    assert_eq!(sub.state(), json!({"count": 7}));
    assert_eq!(h.conn.calls("counters", "retry").subscribes(), 2);
}

#[tokio::test]
async fn access_outside_provider_fails() {
    assert_eq!(
        SessionCache::current().unwrap_err(),
        ClientError::MissingProvider
    );
    assert_eq!(
        DocumentCreator::current().unwrap_err(),
        ClientError::MissingProvider
    );
}

#[tokio::test]
async fn dispatch_after_teardown_fails() {
    let h = Harness::new();
    h.seed("counters", "gone", json!({"count": 0}));
    let calls = h.conn.calls("counters", "gone");

    let sub = h.load("counters", "gone").await;
    let dispatcher = sub.dispatcher();
    drop(sub);

    let result = dispatcher
        .dispatch(OpComponent::number_add(path!["count"], 1))
        .await;
    assert_eq!(
        result,
        Err(ClientError::DispatchFailure {
            key: DocKey::new("counters", "gone"),
            source: RemoteError::Destroyed,
        })
    );
    assert_eq!(calls.submits(), 0);
}

#[tokio::test]
async fn rejected_dispatch_rolls_back_through_the_projection() {
    let h = Harness::new();
    h.seed("lists", "p8", json!({"list": [1]}));
    let key = DocKey::new("lists", "p8");

    let mut sub = h
        .load_with("lists", "p8", Some(projector(|doc| doc["list"].clone())))
        .await;

    let remote = h.backend.connect();
    let remote_doc = remote.get(&key);
    remote_doc.subscribe();
    h.backend.flush();

    // the remote delete reaches the store first and invalidates our insert
    let remote_ack =
        remote_doc.submit_op(Op::from(OpComponent::list_delete(path!["list", 0], json!(1))));
    let ours = sub
        .dispatcher()
        .dispatch(OpComponent::list_insert(path!["list", 1], json!("mine")));
    assert_eq!(sub.try_changed(), Some(json!([1, "mine"])));

    h.backend.flush();
    remote_ack.await.unwrap();
    assert!(matches!(
        ours.await,
        Err(ClientError::DispatchFailure {
            source: RemoteError::Rejected(_),
            ..
        })
    ));

    // the remote delete is not replayed on top of our insert; the refetch
    // moves straight to the store's copy
    assert_eq!(sub.try_changed(), Some(json!([])));
    assert_eq!(sub.try_changed(), None);
    assert_eq!(sub.state(), json!([]));
}

#[tokio::test]
async fn reload_with_same_data_is_silent() {
    let h = Harness::new();
    h.seed("counters", "reload", json!({"count1": 1, "count2": 2}));

    let mut sub = h
        .load_with("counters", "reload", Some(projector(|doc| doc["count1"].clone())))
        .await;

    h.conn.inner().reconnect();
    h.backend.flush();
    assert_eq!(sub.try_changed(), None);
    assert_eq!(sub.state(), json!(1));
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug, Deserialize, PartialEq)]
struct Counter {
    count: i64,
}

#[tokio::test]
async fn dispatch_applies_locally_and_resolves_on_ack() {
    let h = Harness::new();
    h.seed("counters", "local", json!({"count": 0}));
    let mut sub = h.load("counters", "local").await;

    let ack = sub
        .dispatcher()
        .dispatch(OpComponent::number_add(path!["count"], 2));
    assert_eq!(sub.state_as::<Counter>().unwrap(), Counter { count: 2 });
    assert_eq!(sub.try_changed(), Some(json!({"count": 2})));

    h.backend.flush();
    ack.await.unwrap();
    assert_eq!(
        h.backend
            .snapshot(&DocKey::new("counters", "local"))
            .unwrap()
            .data,
        json!({"count": 2})
    );
}

#[tokio::test]
async fn derived_action_sees_current_document() {
    let h = Harness::new();
    h.seed("lists", "derive", json!({"list": ["a"]}));
    let sub = h.load("lists", "derive").await;

    let append = |value: &'static str| {
        Action::derive(move |doc| {
            let len = doc["list"].as_array().map_or(0, |list| list.len());
            Op::from(OpComponent::list_insert(path!["list", len], json!(value)))
        })
    };

    let dispatcher = sub.dispatcher();
    let first = dispatcher.dispatch(append("b"));
    let second = dispatcher.dispatch(append("c"));
    h.backend.flush();
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(sub.state(), json!({"list": ["a", "b", "c"]}));
}

#[tokio::test]
async fn render_hands_out_state_and_dispatcher() {
    let h = Harness::new();
    h.seed("counters", "render", json!({"count": 4}));
    let sub = h.load("counters", "render").await;

    let ack = sub.render(|state, dispatch| {
        assert_eq!(state["count"], json!(4));
        dispatch.dispatch(OpComponent::number_add(path!["count"], 1))
    });
    h.backend.flush();
    ack.await.unwrap();
    assert_eq!(sub.state(), json!({"count": 5}));
}

// ============================================================================
// Provider
// ============================================================================

#[test]
fn provider_reports_replaced_connection() {
    let backend = MemoryBackend::new();
    let conn: Arc<dyn RemoteConnection> = Arc::new(backend.connect());
    let provider = SharedStateProvider::new(conn.clone(), Config::default());

    assert_eq!(provider.observe_connection(Some(&conn)), None);

    let other: Arc<dyn RemoteConnection> = Arc::new(backend.connect());
    assert_eq!(
        provider.observe_connection(Some(&other)),
        Some(ConnectionIdentityMismatch::Replaced)
    );
    assert!(Arc::ptr_eq(&provider.cache().connection(), &conn));
}

#[test]
fn external_connection_outlives_provider() {
    let backend = MemoryBackend::new();
    let conn = backend.connect();
    drop(SharedStateProvider::new(Arc::new(conn.clone()), Config::default()));
    assert!(!conn.is_closed());
}
