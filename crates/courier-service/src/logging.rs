//! Logging and error reporting for binaries embedding a [`Layer`](crate::layer::Layer).
//!
//! Binaries set up sentry with [`init_sentry`] and the console or JSON output with
//! [`init_logging`]. Statsd reporting lives in [`configure_metrics`](crate::metrics::configure_metrics).

use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Metadata;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// Crates whose own logs follow the configured level beyond `INFO`.
const VERBOSE_CRATES: &[&str] = &["courier_service", "courier_stress"];

/// The `RUST_LOG` filter used when the environment does not provide one.
///
/// Up to `INFO` the level applies globally. More verbose levels only apply to our own crates so
/// that dependencies do not drown the output.
fn default_filter(level: LevelFilter) -> String {
    if level <= LevelFilter::INFO {
        return level.to_string();
    }

    let verbose: Vec<_> = VERBOSE_CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect();
    format!("info,{}", verbose.join(","))
}

/// Sentry receives errors as events and everything down to `INFO` as logs.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs a JSON subscriber writing one flattened object per event to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .init();
}

/// Initializes logging as configured in the `logging` section.
///
/// `RUST_LOG` takes precedence over the configured level. `RUST_BACKTRACE` is forced on when
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) is set.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    let logging = &config.logging;
    if logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(logging.level));

    let pretty = match logging.format {
        LogFormat::Json => return init_json_logging(&filter, std::io::stdout),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended(),
    };

    let console = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let console = if pretty {
        console.pretty().boxed()
    } else {
        console.compact().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(console.with_filter(EnvFilter::new(&filter)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .init();
}

/// Initializes sentry with the configured [`sentry_dsn`](Config::sentry_dsn).
///
/// Without a DSN the returned guard is inert and nothing is reported. Keep the guard alive for as
/// long as events should be sent.
pub fn init_sentry(config: &Config) -> sentry::ClientInitGuard {
    let guard = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });
    if guard.is_enabled() {
        tracing::info!("Reporting internal errors to sentry");
    }
    guard
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentry_without_dsn() {
        let guard = init_sentry(&Config::default());
        assert!(!guard.is_enabled());
    }

    #[test]
    fn test_default_filter_follows_level() {
        assert_eq!(default_filter(LevelFilter::OFF), "off");
        assert_eq!(default_filter(LevelFilter::WARN), "WARN");
        assert_eq!(
            default_filter(LevelFilter::DEBUG),
            "info,courier_service=DEBUG,courier_stress=DEBUG"
        );

        for level in [LevelFilter::OFF, LevelFilter::INFO, LevelFilter::TRACE] {
            EnvFilter::try_new(default_filter(level)).unwrap();
        }
    }
}
