/*!
Observability infrastructure for dbrotate.

This module provides:
- Structured logging setup (plain or JSON lines, `RUST_LOG` aware)
- Prometheus metrics for runs, transfers, evictions and dump sizes, written
  as a node-exporter textfile (behind the `metrics` feature)
*/

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "metrics")]
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::path::Path;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single lines
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(BackupError::config(format!("unknown log format '{other}'"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("plain"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Default filter directive when `RUST_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Initialize the global tracing subscriber
///
/// Log lines go to stderr so stdout stays free for reports and tables.
///
/// # Arguments
/// * `verbose` - Raise the default level to `debug`
/// * `format` - Plain or JSON log lines
pub fn init_observability(verbose: bool, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let plain = matches!(format, LogFormat::Plain).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let json = matches!(format, LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
    });

    let subscriber = TracingRegistry::default().with(filter).with(plain).with(json);
    set_global_default(subscriber).map_err(|e| {
        BackupError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(%format, "observability initialized");
    Ok(())
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Metrics collected over one process lifetime
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub runs_total: Counter,
    pub run_failures_total: Counter,
    pub transfer_failures_total: Counter,
    pub evictions_total: CounterVec,
    pub dump_size_bytes: Histogram,
    pub dump_duration_seconds: Histogram,
    pub last_success_timestamp_seconds: Gauge,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackupError {
    BackupError::config(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = Counter::new("dbrotate_runs_total", "Backup runs started")
            .map_err(|e| metric_error("runs_total", e))?;
        let run_failures_total = Counter::new("dbrotate_run_failures_total", "Backup runs that ended in failure")
            .map_err(|e| metric_error("run_failures_total", e))?;
        let transfer_failures_total = Counter::new(
            "dbrotate_transfer_failures_total",
            "Runs whose remote transfer failed",
        )
        .map_err(|e| metric_error("transfer_failures_total", e))?;
        let evictions_total = CounterVec::new(
            Opts::new("dbrotate_evictions_total", "Tier memberships evicted"),
            &["store"],
        )
        .map_err(|e| metric_error("evictions_total", e))?;
        let dump_size_bytes = Histogram::with_opts(
            HistogramOpts::new("dbrotate_dump_size_bytes", "Size of stored dumps in bytes")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| metric_error("dump_size_bytes", e))?),
        )
        .map_err(|e| metric_error("dump_size_bytes", e))?;
        let dump_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "dbrotate_dump_duration_seconds",
            "Duration of the dump step in seconds",
        ))
        .map_err(|e| metric_error("dump_duration_seconds", e))?;
        let last_success_timestamp_seconds = Gauge::new(
            "dbrotate_last_success_timestamp_seconds",
            "Unix time of the last successful run",
        )
        .map_err(|e| metric_error("last_success_timestamp_seconds", e))?;

        registry
            .register(Box::new(runs_total.clone()))
            .map_err(|e| metric_error("runs_total", e))?;
        registry
            .register(Box::new(run_failures_total.clone()))
            .map_err(|e| metric_error("run_failures_total", e))?;
        registry
            .register(Box::new(transfer_failures_total.clone()))
            .map_err(|e| metric_error("transfer_failures_total", e))?;
        registry
            .register(Box::new(evictions_total.clone()))
            .map_err(|e| metric_error("evictions_total", e))?;
        registry
            .register(Box::new(dump_size_bytes.clone()))
            .map_err(|e| metric_error("dump_size_bytes", e))?;
        registry
            .register(Box::new(dump_duration_seconds.clone()))
            .map_err(|e| metric_error("dump_duration_seconds", e))?;
        registry
            .register(Box::new(last_success_timestamp_seconds.clone()))
            .map_err(|e| metric_error("last_success_timestamp_seconds", e))?;

        Ok(Self {
            runs_total,
            run_failures_total,
            transfer_failures_total,
            evictions_total,
            dump_size_bytes,
            dump_duration_seconds,
            last_success_timestamp_seconds,
            registry,
        })
    }

    /// Enable metrics collection for this process
    pub fn install() -> Result<&'static BackupMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let metrics = Self::new()?;
        Ok(METRICS.get_or_init(|| metrics))
    }

    /// The installed metrics, if collection was enabled
    pub fn global() -> Option<&'static BackupMetrics> {
        METRICS.get()
    }

    pub fn record_run(&self) {
        self.runs_total.inc();
    }

    pub fn record_failure(&self) {
        self.run_failures_total.inc();
    }

    pub fn record_transfer_failure(&self) {
        self.transfer_failures_total.inc();
    }

    pub fn record_evictions(&self, store: &str, count: usize) {
        self.evictions_total
            .with_label_values(&[store])
            .inc_by(count as f64);
    }

    pub fn record_dump(&self, size_bytes: u64, duration: std::time::Duration) {
        self.dump_size_bytes.observe(size_bytes as f64);
        self.dump_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_success(&self, at: chrono::DateTime<chrono::Utc>) {
        self.last_success_timestamp_seconds.set(at.timestamp() as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| BackupError::config(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| BackupError::config(format!("Failed to convert metrics to string: {e}")))
    }

    /// Write the metrics as a textfile-collector file
    ///
    /// Written to a sibling temporary first so the collector never reads a
    /// half-written file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.gather_metrics()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}


#[cfg(all(test, feature = "metrics"))]
mod metrics_tests {
    use super::*;

    #[test]
    fn test_metrics_gathering() {
        let metrics = BackupMetrics::install().unwrap();
        metrics.record_run();
        metrics.record_transfer_failure();
        metrics.record_evictions("local", 2);
        metrics.record_dump(4096, std::time::Duration::from_millis(1500));

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("dbrotate_runs_total"));
        assert!(text.contains("dbrotate_evictions_total{store=\"local\"}"));
        assert!(text.contains("dbrotate_dump_size_bytes_bucket"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dbrotate.prom");
        let metrics = BackupMetrics::install().unwrap();
        metrics.record_success(chrono::Utc::now());

        metrics.write_textfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("dbrotate_last_success_timestamp_seconds"));
        assert!(BackupMetrics::global().is_some());
    }
}
