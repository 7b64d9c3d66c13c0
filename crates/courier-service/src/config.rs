use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::retry::{RetryPolicy, RetryProfiles, RetryStrategy, SmartRetry};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "courier".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of a [`CacheStore`](crate::caching::CacheStore).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an entry is served after it was written.
    ///
    /// A value of zero disables caching: entries are stored, but never served.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// The maximum number of entries.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_size: 100,
        }
    }
}

/// Settings of a [`BatchCoalescer`](crate::batch::BatchCoalescer).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// A batch is flushed as soon as it holds this many items.
    pub max_batch_size: usize,

    /// A batch is flushed this long after its first item was added.
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_delay: Duration::from_millis(50),
        }
    }
}

/// Controls how failed requests are retried.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// The budget used by the fixed strategy.
    #[serde(flatten)]
    pub policy: RetryPolicy,

    /// Use per-kind profiles, picked based on the first failure, instead of `policy`.
    pub smart: bool,

    /// Per-kind budgets of the smart strategy.
    pub profiles: RetryProfiles,
}

impl RetryConfig {
    /// The strategy described by this config.
    pub fn strategy(&self) -> RetryStrategy {
        if self.smart {
            SmartRetry::new(self.profiles.clone()).into()
        } else {
            self.policy.into()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,

    /// The response cache.
    pub cache: CacheConfig,

    /// The batch coalescer.
    pub batch: BatchConfig,

    /// Retrying of failed requests.
    pub retry: RetryConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.cache.max_size > 0, "cache.max_size must be at least 1");
        anyhow::ensure!(
            self.batch.max_batch_size > 0,
            "batch.max_batch_size must be at least 1"
        );

        validate_policy(&self.retry.policy).context("invalid retry policy")?;
        for (kind, policy) in self.retry.profiles.iter() {
            validate_policy(policy).with_context(|| format!("invalid retry profile `{kind}`"))?;
        }

        Ok(())
    }
}

fn validate_policy(policy: &RetryPolicy) -> Result<()> {
    anyhow::ensure!(
        policy.multiplier.is_finite() && policy.multiplier >= 1.0,
        "multiplier must be a finite number of at least 1, got {}",
        policy.multiplier
    );
    Ok(())
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
