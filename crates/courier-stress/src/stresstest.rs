use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use courier_service::clock::tokio_clock;
use courier_service::config::Config;
use courier_service::metrics::StatsdCollector;
use futures::future::join_all;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Payload, SimulatedRemote, StressLayer, WorkloadsConfig, process_payload};

/// One workload, ready to run.
struct Runner {
    concurrency: usize,
    payload: Payload,
    layer: StressLayer,
    remote: Arc<SimulatedRemote>,
}

/// The outcome of running a workload until its deadline.
struct Report {
    concurrency: usize,
    failures: usize,
    remote_calls: usize,
    cache_hits: u64,
    durations: DDSketch,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload gets its own layer and remote, so they do not share cached values
    let runners: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| Runner {
            concurrency: workload.concurrency,
            payload: workload.payload,
            layer: StressLayer::with_clock(
                "stresstest",
                &config,
                tokio_clock(),
                Some(Arc::new(StatsdCollector)),
            ),
            remote: Arc::new(SimulatedRemote::new(workload.remote)),
        })
        .collect();

    // warm the caches by running every workload once
    let start = Instant::now();
    let warmups = runners.iter().map(|runner| {
        let (layer, remote) = (runner.layer.clone(), Arc::clone(&runner.remote));
        let payload = runner.payload;
        tokio::spawn(async move { process_payload(&layer, &remote, payload).await })
    });
    join_all(warmups).await;
    println!("Warmup: {:?}", start.elapsed());
    println!();

    let deadline = tokio::time::Instant::now() + duration;
    let tasks = runners
        .into_iter()
        .map(|runner| tokio::spawn(run_until(runner, deadline)));
    let reports = join_all(tasks).await;

    for (i, report) in reports.into_iter().enumerate() {
        print_report(i, &report?, duration);
    }

    Ok(())
}

/// Keeps `concurrency` operations of the workload in flight until `deadline`.
async fn run_until(runner: Runner, deadline: tokio::time::Instant) -> Report {
    let Runner {
        concurrency,
        payload,
        layer,
        remote,
    } = runner;

    let durations = Arc::new(Mutex::new(DDSketch::default()));
    let failures = Arc::new(AtomicUsize::new(0));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                let layer = layer.clone();
                let remote = Arc::clone(&remote);
                let durations = Arc::clone(&durations);
                let failures = Arc::clone(&failures);

                let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                let ctx = sentry::TransactionContext::new("stresstest", payload.name());
                let transaction = hub.start_transaction(ctx);

                let operation = async move {
                    let op_start = Instant::now();
                    if !process_payload(&layer, &remote, payload).await {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    transaction.finish();

                    if let Ok(mut durations) = durations.lock() {
                        durations.add(op_start.elapsed().as_secs_f64());
                    }
                    drop(permit);
                };
                tokio::spawn(operation.bind_hub(hub));
            }
            _ = &mut sleep => break,
        }
    }

    // holding every permit means all outstanding operations are done
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let durations = durations
        .lock()
        .map(|mut durations| std::mem::take(&mut *durations))
        .unwrap_or_default();

    Report {
        concurrency,
        failures: failures.load(Ordering::Relaxed),
        remote_calls: remote.calls(),
        cache_hits: layer.store().stats().hits,
        durations,
    }
}

fn print_report(index: usize, report: &Report, duration: Duration) {
    let Report {
        concurrency,
        failures,
        remote_calls,
        cache_hits,
        durations,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!("Workload {index} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
    println!("  failures: {failures}; remote calls: {remote_calls}; cache hits: {cache_hits}");

    if ops == 0 {
        return;
    }
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    let quantile = |q| {
        let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
