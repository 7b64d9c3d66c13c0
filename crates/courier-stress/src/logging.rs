use std::env;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};

use anyhow::{Context, Result};
use courier_service::config::Metrics;
use courier_service::logging::init_json_logging;
use courier_service::metrics as statsd;
use futures::FutureExt;
use futures::future::BoxFuture;

/// Which observability integrations are active during the stresstest.
#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

/// Keeps the integrations alive for the duration of the stresstest.
#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    /// Local servers swallowing whatever the integrations send. Spawn these on the runtime.
    pub sinks: Vec<BoxFuture<'static, ()>>,
}

/// Sets up sentry, logging and metrics, each reporting to a local sink that discards everything.
///
/// Metrics use the prefix and custom tags of `metrics`, only the statsd server is replaced.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init(config: Config, metrics: &Metrics) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        let (port, sink) = http_sink()?;
        guard.sinks.push(sink);

        let dsn = format!("http://stresstest@127.0.0.1:{port}/1");
        guard._sentry = Some(sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        // keep the whole formatting pipeline busy, like in production, without flooding stdout
        init_json_logging("INFO,courier_service=TRACE", || NoopWriter);
    }

    if config.metrics {
        let (port, sink) = udp_sink()?;
        guard.sinks.push(sink);

        // have some default tags, just to be closer to the real world config
        let mut tags = metrics.custom_tags.clone();
        for tag in ["host", "env"] {
            tags.entry(tag.to_owned()).or_insert_with(|| "stresstest".to_owned());
        }
        statsd::configure_statsd(&metrics.prefix, format!("127.0.0.1:{port}"), tags)?;
    }

    Ok(guard)
}

/// Binds an HTTP server answering `OK` to everything, returning its port.
fn http_sink() -> Result<(u16, BoxFuture<'static, ()>)> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .context("failed to bind sentry sink")?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let sink = async move {
        use axum::handler::HandlerWithoutStateExt;

        async fn ok() -> &'static str {
            "OK"
        }

        let Ok(listener) = tokio::net::TcpListener::from_std(listener) else {
            return;
        };
        axum::serve(listener, ok.into_make_service()).await.ok();
    };

    Ok((port, sink.boxed()))
}

/// Binds a UDP socket dropping every datagram, returning its port.
fn udp_sink() -> Result<(u16, BoxFuture<'static, ()>)> {
    let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .context("failed to bind statsd sink")?;
    socket.set_nonblocking(true)?;
    let port = socket.local_addr()?.port();

    let sink = async move {
        let Ok(socket) = tokio::net::UdpSocket::from_std(socket) else {
            return;
        };
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            if socket.recv_buf(&mut buf).await.is_err() {
                break;
            }
        }
    };

    Ok((port, sink.boxed()))
}

struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
