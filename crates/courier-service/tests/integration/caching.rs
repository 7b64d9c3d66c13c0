use std::collections::HashMap;
use std::time::Duration;

use courier_service::error::RequestError;
use futures::future::join_all;

use crate::{CallCounter, ScriptedRemote, setup_layer};

#[tokio::test(start_paused = true)]
async fn test_value_expires_after_ttl() {
    let layer = setup_layer(|config| config.cache.ttl = Duration::from_secs(10));
    let remote = ScriptedRemote::default();

    let first = layer.get("a".into(), remote.producer("a")).await;
    assert_eq!(first.as_deref(), Ok("a@1"));

    tokio::time::advance(Duration::from_secs(5)).await;
    let cached = layer.get("a".into(), remote.producer("a")).await;
    assert_eq!(cached.as_deref(), Ok("a@1"));

    tokio::time::advance(Duration::from_secs(6)).await;
    let refreshed = layer.get("a".into(), remote.producer("a")).await;
    assert_eq!(refreshed.as_deref(), Ok("a@2"));
    assert_eq!(remote.calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_store_never_exceeds_max_size() {
    let layer = setup_layer(|config| config.cache.max_size = 7);
    let remote = ScriptedRemote::default();

    for i in 0..50 {
        let key = format!("key-{i}");
        layer.get(key.clone(), remote.producer(&key)).await.unwrap();
        assert!(layer.store().len() <= 7);
    }
    assert_eq!(remote.calls.get(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_scenario() {
    let layer = setup_layer(|config| config.cache.max_size = 3);
    let store = layer.store();

    for key in ["A", "B", "C"] {
        store.set(key.into(), key.to_lowercase());
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    store.set("D".into(), "d".into());

    let remaining: Vec<_> = ["A", "B", "C", "D"]
        .into_iter()
        .filter(|key| store.contains_key(&key.to_string()))
        .collect();
    assert_eq!(remaining, ["B", "C", "D"]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_run_once() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::default();

    let requests = (0..25).map(|_| layer.get("shared".into(), remote.producer("shared")));
    let results = join_all(requests).await;

    assert_eq!(remote.calls.get(), 1);
    for result in results {
        assert_eq!(result.as_deref(), Ok("shared@1"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_rejection() {
    // a client error is not retried, so every waiter sees the one failure
    let layer = setup_layer(|_| {});
    let remote =
        ScriptedRemote::failing_with([RequestError::from_status(404, "unknown instance")]);

    let requests = (0..5).map(|_| layer.get("gone".into(), remote.producer("gone")));
    let results = join_all(requests).await;

    assert_eq!(remote.calls.get(), 1);
    for result in results {
        assert_eq!(result, Err(RequestError::from_status(404, "unknown instance")));
    }
    assert!(layer.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bulk_loader_shares_store_with_dedup() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::default();

    layer.get("a".into(), remote.producer("a")).await.unwrap();

    let loaded = layer
        .bulk()
        .load_many(["a".to_owned(), "b".to_owned()], |ids| async move {
            assert_eq!(ids, ["b"]);
            let values: HashMap<_, _> =
                ids.into_iter().map(|id| (id, "bulk".to_owned())).collect();
            Ok::<_, RequestError>(values)
        })
        .await
        .unwrap();
    assert_eq!(loaded["a"], "a@1");
    assert_eq!(loaded["b"], "bulk");

    // the bulk result is served to single lookups
    let b = layer.get("b".into(), remote.producer("b")).await;
    assert_eq!(b.as_deref(), Ok("bulk"));
    assert_eq!(remote.calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_loader_joins_running_request() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::default();

    let single = layer.get("x".into(), remote.producer("x"));

    let bulk_calls = CallCounter::new();
    let loaded = layer
        .bulk()
        .load_many(["x".to_owned(), "y".to_owned()], |ids| {
            bulk_calls.increment();
            async move {
                assert_eq!(ids, ["y"]);
                let values: HashMap<_, _> =
                    ids.into_iter().map(|id| (id, "bulk".to_owned())).collect();
                Ok::<_, RequestError>(values)
            }
        })
        .await
        .unwrap();

    assert_eq!(remote.calls.get(), 1);
    assert_eq!(bulk_calls.get(), 1);
    assert_eq!(loaded["x"], "x@1");
    assert_eq!(loaded["y"], "bulk");
    assert_eq!(single.await.as_deref(), Ok("x@1"));
    assert_eq!(layer.store().get(&"x".to_owned()).as_deref(), Some("x@1"));
}
