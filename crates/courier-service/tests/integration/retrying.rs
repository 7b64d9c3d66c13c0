use std::time::Duration;

use courier_service::error::RequestError;
use courier_service::retry::{ErrorKind, RetryPolicy, RetryProfiles};

use crate::{ScriptedRemote, setup_layer};

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::failing_with([RequestError::from_status(400, "bad request")]);

    let result = layer.execute(|| remote.fetch("order")).await;

    assert_eq!(result, Err(RequestError::from_status(400, "bad request")));
    assert_eq!(remote.calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_network_errors_are_retried() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::failing_with([
        RequestError::Network("connection reset".into()),
        RequestError::Network("connection reset".into()),
    ]);

    let result = layer.execute(|| remote.fetch("order")).await;

    assert_eq!(result.as_deref(), Ok("order@3"));
    assert_eq!(remote.calls.get(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_budget() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::failing_with(
        std::iter::repeat_n(RequestError::from_status(503, "unavailable"), 10),
    );

    let result = layer.execute(|| remote.fetch("order")).await;

    assert_eq!(result, Err(RequestError::from_status(503, "unavailable")));
    // the first attempt and 3 retries
    assert_eq!(remote.calls.get(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_deduplicated_request_is_retried_once() {
    let layer = setup_layer(|_| {});
    let remote = ScriptedRemote::failing_with([RequestError::Timeout(Duration::from_secs(1))]);

    let (first, second) = tokio::join!(
        layer.get("instance".into(), remote.producer("instance")),
        layer.get("instance".into(), remote.producer("instance")),
    );

    assert_eq!(first.as_deref(), Ok("instance@2"));
    assert_eq!(second.as_deref(), Ok("instance@2"));
    assert_eq!(remote.calls.get(), 2);
    assert!(layer.store().contains_key(&"instance".to_owned()));
}

fn smart_profiles() -> RetryProfiles {
    let policy = |max_retries| RetryPolicy {
        max_retries,
        delay: Duration::from_millis(10),
        multiplier: 1.0,
        max_delay: Duration::from_millis(10),
    };
    RetryProfiles::new([
        (ErrorKind::Network, policy(1)),
        (ErrorKind::Server, policy(4)),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_smart_retry_uses_profile_of_first_failure() {
    let layer = setup_layer(|config| {
        config.retry.smart = true;
        config.retry.profiles = smart_profiles();
    });

    let remote = ScriptedRemote::failing_with(
        std::iter::repeat_n(RequestError::from_status(502, "bad gateway"), 10),
    );
    let result = layer.execute(|| remote.fetch("order")).await;
    assert!(result.is_err());
    assert_eq!(remote.calls.get(), 5);

    let remote =
        ScriptedRemote::failing_with(std::iter::repeat_n(RequestError::Network("dns".into()), 10));
    let result = layer.execute(|| remote.fetch("order")).await;
    assert!(result.is_err());
    assert_eq!(remote.calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_smart_retry_without_profile() {
    let layer = setup_layer(|config| {
        config.retry.smart = true;
        config.retry.profiles = smart_profiles();
    });
    let remote = ScriptedRemote::failing_with([RequestError::Timeout(Duration::from_secs(1))]);

    let result = layer.execute(|| remote.fetch("order")).await;

    assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(1))));
    assert_eq!(remote.calls.get(), 1);
}
