use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_service::error::RequestError;
use courier_service::layer::Layer;
use courier_service::retry::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type StressLayer = Layer<u64, String, RequestError>;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The operation every task of a workload runs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Single lookups through the cache and deduplicator, with keys drawn from `0..keys`.
    Dedup { keys: u64 },
    /// Single lookups through the batch coalescer.
    Batch { keys: u64 },
    /// Uncached calls protected by the retry strategy.
    Retry,
    /// Lookups of `ids` keys at once through the bulk loader.
    Bulk { keys: u64, ids: usize },
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Dedup { .. } => "dedup",
            Payload::Batch { .. } => "batch",
            Payload::Retry => "retry",
            Payload::Bulk { .. } => "bulk",
        }
    }
}

/// How the simulated remote service behaves.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// The time the remote takes to answer. The actual latency varies between half and all of it.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The probability of a call failing.
    pub failure_rate: f64,
    /// The kind of failure the remote produces.
    pub failure: ErrorKind,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            failure_rate: 0.0,
            failure: ErrorKind::Network,
        }
    }
}

/// A stand-in for the remote service.
#[derive(Debug)]
pub struct SimulatedRemote {
    config: RemoteConfig,
    calls: AtomicUsize,
}

impl SimulatedRemote {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            calls: AtomicUsize::new(0),
        }
    }

    /// How often the remote was called so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let latency = self.config.latency.mul_f64(rng.gen_range(0.5..=1.0));
        let failed = rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        (latency, failed)
    }

    fn failure(&self) -> RequestError {
        match self.config.failure {
            ErrorKind::Network => RequestError::Network("connection reset by peer".into()),
            ErrorKind::Timeout => RequestError::Timeout(self.config.latency),
            ErrorKind::Server => RequestError::from_status(503, "service unavailable"),
            ErrorKind::Client => RequestError::from_status(400, "bad request"),
            ErrorKind::Authentication => RequestError::from_status(401, "unauthorized"),
            ErrorKind::Authorization => RequestError::from_status(403, "forbidden"),
            ErrorKind::Unknown => RequestError::Other("something went wrong".into()),
        }
    }

    pub async fn fetch(&self, key: u64) -> Result<String, RequestError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (latency, failed) = self.roll();
        tokio::time::sleep(latency).await;

        if failed {
            return Err(self.failure());
        }
        Ok(format!("instance-{key}"))
    }

    pub async fn fetch_many(&self, keys: Vec<u64>) -> Result<HashMap<u64, String>, RequestError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (latency, failed) = self.roll();
        tokio::time::sleep(latency).await;

        if failed {
            return Err(self.failure());
        }
        Ok(keys
            .into_iter()
            .map(|key| (key, format!("instance-{key}")))
            .collect())
    }
}

/// Runs one operation of `payload`, returning whether it succeeded.
pub async fn process_payload(
    layer: &StressLayer,
    remote: &Arc<SimulatedRemote>,
    payload: Payload,
) -> bool {
    match payload {
        Payload::Dedup { keys } => {
            let key = random_key(keys);
            let remote = Arc::clone(remote);
            layer
                .get(key, move || {
                    let remote = Arc::clone(&remote);
                    async move { remote.fetch(key).await }
                })
                .await
                .is_ok()
        }
        Payload::Batch { keys } => {
            let key = random_key(keys);
            let remote = Arc::clone(remote);
            layer
                .batch()
                .add(key, move || async move { remote.fetch(key).await })
                .await
                .is_ok()
        }
        Payload::Retry => {
            let key = random_key(u64::MAX);
            layer.execute(|| remote.fetch(key)).await.is_ok()
        }
        Payload::Bulk { keys, ids } => {
            let ids: Vec<_> = (0..ids).map(|_| random_key(keys)).collect();
            layer
                .bulk()
                .load_many(ids, |missing| remote.fetch_many(missing))
                .await
                .is_ok()
        }
    }
}

fn random_key(keys: u64) -> u64 {
    rand::thread_rng().gen_range(0..keys.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 10
                dedup:
                  keys: 50
              - concurrency: 4
                remote:
                  latency: 5ms
                  failure_rate: 0.3
                  failure: server
                retry:
              - concurrency: 2
                bulk:
                  keys: 1000
                  ids: 20
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workloads.len(), 3);

        let retry = &config.workloads[1];
        assert!(matches!(retry.payload, Payload::Retry));
        assert_eq!(retry.remote.latency, Duration::from_millis(5));
        assert_eq!(retry.remote.failure, ErrorKind::Server);

        assert!(matches!(
            config.workloads[2].payload,
            Payload::Bulk { keys: 1000, ids: 20 }
        ));
    }
}
