use std::net::UdpSocket;
use std::time::Duration;

use courier_service::config::Config;
use courier_service::error::RequestError;
use courier_service::layer::Layer;
use courier_service::metrics::{MetricsCollector, StatsdCollector, configure_metrics};
use courier_service::retry::{ErrorKind, RetryStrategy};

use crate::{ScriptedRemote, TestLayer};

#[tokio::test(start_paused = true)]
async fn test_layer_from_config_file() {
    courier_test::setup();
    let dir = courier_test::tempdir();
    let path = courier_test::config_file(
        &dir,
        r#"
        cache:
          ttl: 1s
          max_size: 2
        batch:
          max_batch_size: 2
          batch_delay: 10ms
        retry:
          smart: true
          profiles:
            network:
              max_retries: 1
              delay: 5ms
        "#,
    );

    let config = Config::get(Some(&path)).unwrap();
    let layer: TestLayer = Layer::new("config", &config);

    assert_eq!(layer.store().max_size(), 2);
    assert_eq!(layer.store().default_ttl(), Duration::from_secs(1));
    assert_eq!(layer.batch().config().max_batch_size, 2);
    let RetryStrategy::Smart(smart) = layer.retry() else {
        panic!("expected the smart strategy");
    };
    assert_eq!(smart.profiles().get(ErrorKind::Network).max_retries, 1);
    assert_eq!(smart.profiles().get(ErrorKind::Server).max_retries, 0);

    let remote = ScriptedRemote::failing_with([
        RequestError::Network("reset".into()),
        RequestError::Network("reset".into()),
    ]);
    let result = layer.execute(|| remote.fetch("order")).await;
    assert_eq!(result, Err(RequestError::Network("reset".into())));
    assert_eq!(remote.calls.get(), 2);
}

#[test]
fn test_invalid_config_file() {
    courier_test::setup();
    let dir = courier_test::tempdir();
    let path = courier_test::config_file(
        &dir,
        r#"
        cache:
          max_size: 0
        "#,
    );

    let error = Config::get(Some(&path)).unwrap_err();
    assert!(format!("{error:#}").contains("max_size"));
}

#[test]
fn test_metrics_reach_configured_statsd() {
    courier_test::setup();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = server.local_addr().unwrap().port();

    let dir = courier_test::tempdir();
    let yaml = format!(
        r#"
        metrics:
          statsd: 127.0.0.1:{port}
          prefix: courier.integration
          custom_tags:
            region: eu
        "#
    );
    let path = courier_test::config_file(&dir, &yaml);
    let config = Config::get(Some(&path)).unwrap();

    configure_metrics(&config.metrics).unwrap();
    StatsdCollector.record_success();

    // other tests in this binary may report as well, so skip anything else
    let mut buf = [0; 1024];
    let received = loop {
        let len = server.recv(&mut buf).unwrap();
        let datagram = String::from_utf8_lossy(&buf[..len]).into_owned();
        if datagram.starts_with("courier.integration.requests.outcome") {
            break datagram;
        }
    };
    assert!(received.contains("status:success"), "{received}");
    assert!(received.contains("region:eu"), "{received}");
}
