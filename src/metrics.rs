//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `gitjob_reconciliations_total` - Total number of reconciliations
//! - `gitjob_reconciliation_errors_total` - Total number of reconciliation errors
//! - `gitjob_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `gitjob_poll_probes_total` - Total number of remote ref probes
//! - `gitjob_poll_probe_errors_total` - Total number of failed probes
//! - `gitjob_poll_watches` - Current number of registered poll watches
//! - `gitjob_webhook_requests_total` - Webhook requests by provider
//! - `gitjob_webhook_errors_total` - Webhook requests answered with an error
//! - `gitjob_jobs_created_total` - Child jobs created

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitjob_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitjob_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitjob_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static POLL_PROBES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("gitjob_poll_probes_total", "Total number of remote ref probes")
        .expect("Failed to create POLL_PROBES_TOTAL metric - this should never happen")
});

static POLL_PROBE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitjob_poll_probe_errors_total",
        "Total number of failed remote ref probes",
    )
    .expect("Failed to create POLL_PROBE_ERRORS_TOTAL metric - this should never happen")
});

static POLL_WATCHES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("gitjob_poll_watches", "Current number of registered poll watches")
        .expect("Failed to create POLL_WATCHES metric - this should never happen")
});

static WEBHOOK_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("gitjob_webhook_requests_total", "Webhook requests by provider"),
        &["provider"],
    )
    .expect("Failed to create WEBHOOK_REQUESTS_TOTAL metric - this should never happen")
});

static WEBHOOK_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitjob_webhook_errors_total",
        "Webhook requests answered with an error",
    )
    .expect("Failed to create WEBHOOK_ERRORS_TOTAL metric - this should never happen")
});

static JOBS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("gitjob_jobs_created_total", "Child jobs created")
        .expect("Failed to create JOBS_CREATED_TOTAL metric - this should never happen")
});

/// Register all metrics with the shared registry. Must run once at startup,
/// before the first scrape.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(POLL_PROBES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_PROBE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_WATCHES.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn increment_probes() {
    POLL_PROBES_TOTAL.inc();
}

pub fn increment_probe_errors() {
    POLL_PROBE_ERRORS_TOTAL.inc();
}

pub fn set_poll_watches(count: i64) {
    POLL_WATCHES.set(count);
}

pub fn increment_webhook_requests(provider: &str) {
    WEBHOOK_REQUESTS_TOTAL.with_label_values(&[provider]).inc();
}

pub fn increment_webhook_errors() {
    WEBHOOK_ERRORS_TOTAL.inc();
}

pub fn increment_jobs_created() {
    JOBS_CREATED_TOTAL.inc();
}
