use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_service::config::Config;
use courier_service::logging::{ensure_log_error, init_logging, init_sentry};
use courier_service::metrics::configure_metrics;
use humantime::parse_duration;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable reporting to a local sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Enable JSON logging to a sink that discards everything.
    #[arg(long, conflicts_with = "log")]
    tracing: bool,

    /// Log to the console as configured in the `logging` section of the config file.
    #[arg(long)]
    log: bool,

    /// Enable reporting metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run(Cli::parse()) {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: No other threads exist yet, the runtime is started below.
    let mut guard = unsafe {
        logging::init(
            logging::Config {
                backtraces: config.logging.enable_backtraces,
                sentry: cli.sentry,
                tracing: cli.tracing,
                metrics: cli.metrics,
            },
            &config.metrics,
        )
    }?;
    if cli.log {
        // SAFETY: Still single-threaded.
        unsafe { init_logging(&config) };
    }

    // the local sinks take precedence over the configured servers
    let _sentry = (!cli.sentry).then(|| init_sentry(&config));
    if !cli.metrics {
        configure_metrics(&config.metrics).context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let sinks = std::mem::take(&mut guard.sinks);
        for sink in sinks {
            tokio::spawn(sink);
        }

        perform_stresstest(config, workloads, cli.duration).await
    })
}
