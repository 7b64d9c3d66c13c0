use std::time::Duration;

use courier_service::error::RequestError;
use futures::future::join_all;
use tokio::time::Instant;

use crate::{ScriptedRemote, setup_layer};

#[tokio::test(start_paused = true)]
async fn test_full_batch_runs_immediately() {
    let layer = setup_layer(|config| config.batch.max_batch_size = 4);
    let remote = ScriptedRemote::default();
    let start = Instant::now();

    let items = (0..4).map(|i| {
        let remote = remote.clone();
        layer
            .batch()
            .add(format!("item-{i}"), move || async move { remote.fetch("item").await })
    });
    let results = join_all(items).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(remote.calls.get(), 4);
    // only the latency of the remote, no batch delay
    assert!(start.elapsed() < Duration::from_millis(50));
    assert!(!layer.batch().has_armed_timer());
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_waits_for_delay() {
    let layer = setup_layer(|config| {
        config.batch.max_batch_size = 10;
        config.batch.batch_delay = Duration::from_millis(50);
    });
    let remote = ScriptedRemote::default();
    let start = Instant::now();

    let items = (0..3).map(|i| {
        let remote = remote.clone();
        layer
            .batch()
            .add(format!("item-{i}"), move || async move { remote.fetch("item").await })
    });
    let items: Vec<_> = items.collect();
    assert_eq!(layer.batch().queue_len(), 3);
    assert_eq!(remote.calls.get(), 0);

    let results = join_all(items).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(remote.calls.get(), 3);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_does_not_affect_siblings() {
    let layer = setup_layer(|config| config.batch.max_batch_size = 3);

    let ok = layer
        .batch()
        .add("ok".into(), || async { Ok::<_, RequestError>("fine".to_owned()) });
    let failed = layer
        .batch()
        .add("failed".into(), || async {
            Err(RequestError::Network("connection reset".into()))
        });
    let other = layer
        .batch()
        .add("other".into(), || async { Ok("also fine".to_owned()) });

    let (ok, failed, other) = tokio::join!(ok, failed, other);
    assert_eq!(ok.as_deref(), Ok("fine"));
    assert_eq!(failed, Err(RequestError::Network("connection reset".into())));
    assert_eq!(other.as_deref(), Ok("also fine"));
}

#[tokio::test(start_paused = true)]
async fn test_cleared_items_are_cancelled() {
    let layer = setup_layer(|_| {});

    let item = layer
        .batch()
        .add("pending".into(), || async { Ok("never".to_owned()) });
    assert_eq!(layer.batch().clear(), 1);

    assert_eq!(item.await, Err(RequestError::Cancelled));
    assert!(!layer.batch().has_armed_timer());
}
