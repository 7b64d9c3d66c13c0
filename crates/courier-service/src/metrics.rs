//! Provides access to the metrics system.
//!
//! There are two ways the layer reports what it is doing:
//!
//! - The [`metric!`](crate::metric) macro sends low-level counters and timers to statsd, if
//!   [`configure_metrics`] or [`configure_statsd`] was called. Otherwise it is a no-op.
//! - A [`MetricsCollector`] receives per-call outcome events from the retry engine. Collectors are
//!   external and optional; [`report`] makes sure a misbehaving collector never reaches callers.
use std::collections::BTreeMap;
use std::fmt;
use std::net::ToSocketAddrs;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::retry::ErrorKind;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,

    /// A collection of tags and values that will be sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// Tell the metrics system to report to statsd.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;
    let statsd_client = StatsdClient::from_sink(prefix, sink);

    METRICS_CLIENT
        .set(MetricsClient {
            statsd_client,
            tags,
        })
        .map_err(|_| anyhow::anyhow!("statsd was already configured"))
}

/// Reports to the statsd server in `config`, if one is set.
///
/// Every metric is prefixed with the configured prefix and carries the configured custom tags.
pub fn configure_metrics(config: &crate::config::Metrics) -> Result<()> {
    let Some(statsd) = &config.statsd else {
        tracing::debug!("No statsd server configured, metrics are disabled");
        return Ok(());
    };
    configure_statsd(&config.prefix, statsd.as_str(), config.custom_tags.clone())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    // counters
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // gauges
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // timers
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // histograms
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

/// Receives outcome events for executed operations.
///
/// Implementations are owned by the embedding application. All methods are fire-and-forget and
/// are invoked through [`report`], so a panicking implementation is contained.
pub trait MetricsCollector: Send + Sync + fmt::Debug {
    /// An operation settled successfully.
    fn record_success(&self);

    /// An operation settled with a failure of the given kind.
    fn record_failure(&self, kind: ErrorKind);

    /// The total time an operation took, including all retries.
    fn record_response_time(&self, elapsed: Duration);
}

/// Shared handle to an optional [`MetricsCollector`].
pub type CollectorRef = Option<Arc<dyn MetricsCollector>>;

/// Invokes `f` with the collector, if there is one.
///
/// Panics raised by the collector are caught and logged; they never propagate to the caller.
pub fn report<F>(collector: &CollectorRef, f: F)
where
    F: FnOnce(&dyn MetricsCollector),
{
    let Some(collector) = collector else {
        return;
    };

    if panic::catch_unwind(AssertUnwindSafe(|| f(collector.as_ref()))).is_err() {
        tracing::warn!(collector = ?collector, "Metrics collector panicked");
    }
}

/// A [`MetricsCollector`] that forwards all events to statsd.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsdCollector;

impl MetricsCollector for StatsdCollector {
    fn record_success(&self) {
        metric!(counter("requests.outcome") += 1, "status" => "success");
    }

    fn record_failure(&self, kind: ErrorKind) {
        metric!(
            counter("requests.outcome") += 1,
            "status" => "failure",
            "kind" => kind.as_str(),
        );
    }

    fn record_response_time(&self, elapsed: Duration) {
        metric!(timer("requests.duration") = elapsed);
    }
}
