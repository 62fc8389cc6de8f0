//! Integration tests for the replication engine.

use curio_sync_engine::{
    HttpResponse, MockHttpClient, MockTransport, ReplicationEngine, ResourceRegistry, SyncConfig,
    TabBus, TrackerState, CHANNEL, CONTENTNODE,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const BASE: &str = "http://studio.test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Arc<ResourceRegistry> {
    Arc::new(ResourceRegistry::standard())
}

fn posts(http: &MockHttpClient) -> Vec<Value> {
    http.calls()
        .into_iter()
        .filter(|(method, _, _)| method == "POST")
        .map(|(_, _, body)| body)
        .collect()
}

#[tokio::test]
async fn server_verdicts_reconcile_the_log() {
    init_tracing();
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let http = Arc::new(MockHttpClient::new());
    let engine = ReplicationEngine::builder(db.clone(), registry)
        .with_config(SyncConfig::new(BASE))
        .with_http_client(http.clone())
        .build()
        .unwrap();
    engine.session().set_channel(Some("ch1".into()));

    let nodes = engine.resource(CONTENTNODE).unwrap();
    nodes.add(json!({"id": "n1", "title": "one", "parent": "root", "lft": 1})).unwrap();
    nodes.add(json!({"id": "n2", "title": "two", "parent": "root", "lft": 2})).unwrap();
    nodes.update(&json!("n1"), json!({"title": "uno"})).unwrap();

    // n1 was created then edited: one merged change carrying rev 3.
    http.respond(
        "POST",
        &format!("{BASE}/api/sync/"),
        HttpResponse::ok(json!({
            "successes": [{"rev": 3, "server_rev": 10}],
            "allowed": [{"rev": 2, "server_rev": 11}],
            "maxRevs": [{"channel_id": "ch1", "rev": 11}],
            "returned": [{
                "type": 1, "table": CONTENTNODE, "key": "srv",
                "obj": {"id": "srv", "title": "from server"}, "server_rev": 12
            }]
        })),
    );

    let result = engine.sync_client().sync().await.unwrap();
    assert_eq!(result.sent, 2);
    assert_eq!(result.acknowledged, 2);
    assert_eq!(result.applied, 1);

    let batch = &posts(&http)[0];
    assert_eq!(batch[0]["key"], json!("n2"));
    assert_eq!(batch[1]["key"], json!("n1"));
    assert_eq!(batch[1]["type"], json!(1));
    assert_eq!(batch[1]["obj"]["title"], json!("uno"));

    let log = engine.log();
    assert!(log.get(1).unwrap().is_none());
    assert!(log.get(3).unwrap().is_none());
    assert_eq!(log.get(2).unwrap().unwrap().server_rev, Some(11));
    assert!(!engine.has_unsynced().unwrap());
    assert_eq!(engine.session().max_rev("ch1"), Some(11));
    assert_eq!(
        nodes.get_local(&json!("srv")).unwrap().unwrap()["title"],
        json!("from server")
    );
    assert_eq!(engine.sync_client().stats().cycles_completed, 1);
}

#[tokio::test]
async fn failed_post_keeps_changes_for_the_next_cycle() {
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let http = Arc::new(MockHttpClient::new());
    let engine = ReplicationEngine::builder(db, registry)
        .with_config(SyncConfig::new(BASE))
        .with_http_client(http.clone())
        .build()
        .unwrap();
    let nodes = engine.resource(CONTENTNODE).unwrap();
    nodes.add(json!({"id": "n1", "parent": "root", "lft": 1})).unwrap();

    http.respond("POST", &format!("{BASE}/api/sync/"), HttpResponse { status: 503, data: Value::Null });
    let err = engine.sync_client().sync().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(engine.has_unsynced().unwrap());

    http.respond(
        "POST",
        &format!("{BASE}/api/sync/"),
        HttpResponse::ok(json!({"successes": [{"rev": 1}]})),
    );
    engine.sync_client().sync().await.unwrap();
    assert!(!engine.has_unsynced().unwrap());
    assert_eq!(posts(&http).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn a_burst_of_edits_goes_out_in_one_request() {
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let transport = Arc::new(MockTransport::new());
    let config = SyncConfig::default()
        .with_debounce(Duration::from_secs(2))
        .with_max_wait(Duration::from_secs(10));
    let engine = ReplicationEngine::builder(db, registry)
        .with_config(config)
        .with_transport(transport.clone())
        .build()
        .unwrap();

    let client = engine.sync_client().clone();
    let running = tokio::spawn(async move { client.run().await });

    let nodes = engine.resource(CONTENTNODE).unwrap();
    nodes.add(json!({"id": "a", "parent": "root", "lft": 1})).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    nodes.add(json!({"id": "b", "parent": "root", "lft": 2})).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.request_count(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.requests()[0].len(), 2);

    engine.sync_client().shutdown();
    running.await.unwrap();
}

#[test]
fn tracked_edits_can_be_reverted() {
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let engine = ReplicationEngine::builder(db, registry)
        .with_transport(Arc::new(MockTransport::new()))
        .build()
        .unwrap();
    let nodes = engine.resource(CONTENTNODE).unwrap();
    nodes.add(json!({"id": "keep", "title": "before", "parent": "root", "lft": 1})).unwrap();

    let mut tracker = engine.tracker();
    tracker.start().unwrap();
    nodes.update(&json!("keep"), json!({"title": "after"})).unwrap();
    nodes.add(json!({"id": "extra", "parent": "root", "lft": 2})).unwrap();
    assert_eq!(tracker.stop().unwrap().len(), 2);

    assert_eq!(tracker.revert().unwrap(), 2);
    assert_eq!(tracker.state(), TrackerState::Reverted);
    assert_eq!(
        nodes.get_local(&json!("keep")).unwrap().unwrap()["title"],
        json!("before")
    );
    assert!(nodes.get_local(&json!("extra")).unwrap().is_none());
    // Only the original create is left to sync.
    assert_eq!(engine.log().since(0).unwrap().len(), 1);
}

#[tokio::test]
async fn tabs_share_one_fetcher() {
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let bus = TabBus::new();
    let leader_http = Arc::new(MockHttpClient::new());
    let follower_http = Arc::new(MockHttpClient::new());
    leader_http.respond(
        "GET",
        &format!("{BASE}/api/channel/ch1/"),
        HttpResponse::ok(json!({"id": "ch1", "name": "Physics"})),
    );

    let leader = ReplicationEngine::builder(db.clone(), registry.clone())
        .with_config(SyncConfig::new(BASE))
        .with_http_client(leader_http.clone())
        .with_tab_bus(bus.clone())
        .with_client_id("leader")
        .build()
        .unwrap();
    let follower = ReplicationEngine::builder(db, registry)
        .with_config(SyncConfig::new(BASE))
        .with_http_client(follower_http.clone())
        .with_tab_bus(bus.clone())
        .with_client_id("follower")
        .build()
        .unwrap();
    assert!(leader.tabs().unwrap().try_claim());

    let channels = follower.resource(CHANNEL).unwrap();
    let row = channels.get(&json!("ch1")).await.unwrap().unwrap();
    assert_eq!(row["name"], json!("Physics"));
    assert_eq!(leader_http.calls().len(), 1);
    assert!(follower_http.calls().is_empty());
    assert_eq!(bus.leader().as_deref(), Some("leader"));

    drop(leader);
    assert_eq!(bus.leader(), None);
    assert!(follower.tabs().unwrap().try_claim());
}

#[tokio::test]
async fn returned_batches_apply_in_server_order() {
    let registry = registry();
    let db = Arc::new(registry.open_in_memory().unwrap());
    let engine = ReplicationEngine::builder(db, registry)
        .with_transport(Arc::new(MockTransport::new()))
        .build()
        .unwrap();

    let entries = vec![
        json!({"type": 2, "table": CONTENTNODE, "key": "x", "mods": {"title": "second"}, "server_rev": 3}),
        json!({"type": 99, "table": CONTENTNODE, "key": "x"}),
        json!({"type": 1, "table": CONTENTNODE, "key": "x", "obj": {"title": "first"}, "server_rev": 2}),
    ];
    let applied = engine.apply().apply_entries(&entries).await.unwrap();
    assert_eq!(applied.len(), 2);

    let nodes = engine.resource(CONTENTNODE).unwrap();
    let row = nodes.get_local(&json!("x")).unwrap().unwrap();
    assert_eq!(row["title"], json!("second"));
    assert_eq!(row["id"], json!("x"));
    assert!(!engine.has_unsynced().unwrap());
}
