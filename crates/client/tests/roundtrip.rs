//! End-to-end: a real server on an ephemeral port driven through `Mirror`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use mirrorline_client::{connect, disconnect, Member, Mirror, MirrorConfig, MirrorError};
use mirrorline_server::managers::standard_session;
use mirrorline_server::{router, MemoryStore, SessionOptions, SessionRegistry, StateStore};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    url: String,
    registry: Arc<SessionRegistry>,
    store: Arc<MemoryStore>,
}

async fn boot_server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let factory_store: Arc<dyn StateStore> = store.clone();
    let registry = Arc::new(SessionRegistry::new(move |user_id: &str| {
        standard_session(user_id, factory_store.clone(), SessionOptions::default())
    }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(registry.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("ws://{addr}"),
        registry,
        store,
    }
}

fn fast_config() -> MirrorConfig {
    MirrorConfig {
        reconnect_backoff: Duration::from_millis(50),
        rpc_timeout: Some(TIMEOUT),
    }
}

async fn wait_until(mirror: &Arc<Mirror>, check: impl Fn(&Arc<Mirror>) -> bool) {
    let mut versions = mirror.subscribe();
    let mut connection = mirror.watch_connection();
    timeout(TIMEOUT, async {
        while !check(mirror) {
            tokio::select! {
                _ = versions.changed() => {}
                _ = connection.changed() => {}
            }
        }
    })
    .await
    .expect("mirror never reached expected state");
}

async fn synced(mirror: &Arc<Mirror>) {
    wait_until(mirror, |m| m.is_connected() && m.state().contains_key("userId")).await;
}

#[tokio::test]
async fn rpc_result_and_diff_reach_every_device() {
    let server = boot_server().await;
    let laptop = Mirror::spawn(&server.url, "alice", fast_config());
    let phone = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&laptop).await;
    synced(&phone).await;

    assert_eq!(laptop.state()["userId"], json!("alice"));
    assert_eq!(laptop.manager("counter").get("value"), Some(json!(0)));

    let result = laptop
        .manager("counter")
        .method("increment")
        .call(vec![json!(5)])
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    wait_until(&phone, |m| m.manager("counter").get("value") == Some(json!(5))).await;
    wait_until(&laptop, |m| m.manager("counter").get("value") == Some(json!(5))).await;
    assert_eq!(server.registry.list_active_ids(), vec!["alice".to_string()]);

    laptop.shutdown();
    phone.shutdown();
}

#[tokio::test]
async fn member_lookup_distinguishes_fields_from_methods() {
    let server = boot_server().await;
    let mirror = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&mirror).await;

    let notes = mirror.manager("notes");
    assert!(matches!(notes.member("notes"), Member::Field(_)));
    let Member::Method(create) = notes.member("create") else {
        panic!("create should resolve to a method");
    };
    let note = create.call(vec![json!("Agenda")]).await.unwrap();
    assert_eq!(note["title"], json!("Agenda"));

    wait_until(&mirror, |m| {
        m.manager("notes")
            .get("notes")
            .and_then(|notes| notes.as_array().map(|n| n.len()))
            == Some(1)
    })
    .await;
    assert!(server.store.peek("alice", "notes").is_some());

    mirror.shutdown();
}

#[tokio::test]
async fn server_errors_come_back_as_rpc_failures() {
    let server = boot_server().await;
    let mirror = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&mirror).await;

    match mirror.manager("ghost").method("run").call(vec![]).await {
        Err(MirrorError::Rpc(failure)) => assert_eq!(failure.message, "Unknown manager: ghost"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    match mirror.manager("counter").method("value").call(vec![]).await {
        Err(MirrorError::Rpc(failure)) => {
            assert_eq!(failure.message, "Method not exposed: counter.value")
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(mirror.pending_calls(), 0);

    mirror.shutdown();
}

#[tokio::test]
async fn late_device_converges_from_snapshot() {
    let server = boot_server().await;
    let first = Mirror::spawn(&server.url, "alice", fast_config());
    let second = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&first).await;
    synced(&second).await;

    first
        .manager("counter")
        .method("increment")
        .call(vec![json!(5)])
        .await
        .unwrap();
    first.shutdown();
    wait_until(&first, |m| !m.is_connected()).await;

    second
        .manager("counter")
        .method("increment")
        .call(vec![json!(3)])
        .await
        .unwrap();

    let returning = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&returning).await;
    assert_eq!(returning.manager("counter").get("value"), Some(json!(8)));
    // The shut-down mirror keeps whatever it last saw.
    assert_eq!(first.manager("counter").get("value"), Some(json!(5)));

    second.shutdown();
    returning.shutdown();
}

#[tokio::test]
async fn forced_reconnect_resyncs_state() {
    let server = boot_server().await;
    let mirror = Mirror::spawn(&server.url, "alice", fast_config());
    synced(&mirror).await;

    let before = mirror.version();
    mirror.reconnect();
    // connected + snapshot from the new transport
    wait_until(&mirror, |m| m.is_connected() && m.version() >= before + 2).await;
    assert_eq!(mirror.manager("counter").get("value"), Some(json!(0)));

    mirror.shutdown();
}

#[tokio::test]
async fn calls_fail_fast_without_a_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mirror = Mirror::spawn(&format!("ws://{addr}"), "alice", fast_config());
    let err = mirror
        .manager("counter")
        .method("increment")
        .call(vec![])
        .await
        .expect_err("nothing is listening");
    assert_eq!(err, MirrorError::NotConnected);
    mirror.shutdown();
}

#[tokio::test]
async fn cache_reuses_mirrors_until_disconnect() {
    let server = boot_server().await;

    let first = connect(&server.url, "bob");
    let again = connect(&server.url, "bob");
    assert!(Arc::ptr_eq(&first, &again));
    synced(&first).await;

    assert!(disconnect(&server.url, "bob"));
    assert!(!disconnect(&server.url, "bob"));
    wait_until(&first, |m| !m.is_connected()).await;

    let fresh = connect(&server.url, "bob");
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert!(disconnect(&server.url, "bob"));
}

#[tokio::test]
async fn removed_session_state_survives_in_the_store() {
    let server = boot_server().await;
    let mirror = Mirror::spawn(&server.url, "carol", fast_config());
    synced(&mirror).await;

    mirror
        .manager("counter")
        .method("increment")
        .call(vec![json!(2)])
        .await
        .unwrap();
    assert!(server.registry.remove("carol").await);
    assert_eq!(server.store.peek("carol", "counter"), Some(json!({"value": 2})));

    // A reconnect lands on a fresh session hydrated from the store.
    let before = mirror.version();
    mirror.reconnect();
    wait_until(&mirror, |m| m.is_connected() && m.version() >= before + 2).await;
    assert_eq!(mirror.manager("counter").get("value"), Some(json!(2)));
    let value = mirror
        .manager("counter")
        .method("increment")
        .call(vec![])
        .await
        .unwrap();
    assert_eq!(value, json!(3));

    mirror.shutdown();
}
