use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_service::config::Config;
use courier_service::error::RequestError;
use courier_service::layer::Layer;
use courier_service::retry::RetryPolicy;
use courier_test as test;
use futures::future::BoxFuture;

pub use test::CallCounter;

pub type TestLayer = Layer<String, String, RequestError>;

/// Setup tests and create a layer.
///
/// Retries use short delays, so tests running on a paused clock do not jump far ahead.
/// The `update_config` closure can modify any default configuration if needed before the layer
/// is created.
pub fn setup_layer(update_config: impl FnOnce(&mut Config)) -> TestLayer {
    test::setup();

    let mut config = Config::default();
    config.retry.policy = RetryPolicy {
        max_retries: 3,
        delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(100),
    };
    update_config(&mut config);

    Layer::new("integration", &config)
}

/// A remote that answers with a scripted sequence of outcomes.
///
/// Once the script is exhausted, every call succeeds.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRemote {
    script: Arc<Mutex<Vec<RequestError>>>,
    pub calls: CallCounter,
}

impl ScriptedRemote {
    /// Creates a remote failing with `failures`, in order, before it recovers.
    pub fn failing_with(failures: impl IntoIterator<Item = RequestError>) -> Self {
        let mut script: Vec<_> = failures.into_iter().collect();
        script.reverse();
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: CallCounter::new(),
        }
    }

    pub async fn fetch(&self, key: &str) -> Result<String, RequestError> {
        let attempt = self.calls.increment();
        tokio::time::sleep(Duration::from_millis(5)).await;

        match self.script.lock().unwrap().pop() {
            Some(error) => Err(error),
            None => Ok(format!("{key}@{attempt}")),
        }
    }

    /// A producer for `key`, as accepted by the deduplicator.
    pub fn producer(
        &self,
        key: &str,
    ) -> impl Fn() -> BoxFuture<'static, Result<String, RequestError>> + Send + Sync + 'static {
        let remote = self.clone();
        let key = key.to_owned();
        move || {
            let remote = remote.clone();
            let key = key.clone();
            Box::pin(async move { remote.fetch(&key).await })
        }
    }
}
