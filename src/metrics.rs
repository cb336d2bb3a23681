//! Prometheus instrumentation
//!
//! One `Metrics` value is built at bootstrap and injected wherever counters
//! are recorded; the registry is owned here, not process-global.

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    // Ingestion
    pub files_processed: IntCounterVec,
    pub files_skipped: IntCounter,
    pub files_failed: IntCounter,
    pub iocs_extracted: IntCounterVec,
    pub bytes_processed: IntCounter,
    pub active_workers: IntGauge,
    pub batch_insert_seconds: Histogram,
    pub batch_insert_size: Histogram,

    // Lookup API
    pub api_requests: IntCounterVec,
    pub api_latency: HistogramVec,
    pub bloom_hits: IntCounter,
    pub bloom_misses: IntCounter,

    // Membership filter state
    pub bloom_size_bytes: IntGauge,
    pub bloom_items: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let files_processed = IntCounterVec::new(
            Opts::new("sieve_files_processed_total", "Files processed by status"),
            &["status"],
        )?;
        let files_skipped = IntCounter::new(
            "sieve_files_skipped_total",
            "Files skipped as unchanged since the last pass",
        )?;
        let files_failed =
            IntCounter::new("sieve_files_failed_total", "Files that failed processing")?;
        let iocs_extracted = IntCounterVec::new(
            Opts::new("sieve_iocs_extracted_total", "IOCs extracted by type"),
            &["type"],
        )?;
        let bytes_processed = IntCounter::new(
            "sieve_bytes_processed_total",
            "Bytes of file content processed",
        )?;
        let active_workers =
            IntGauge::new("sieve_active_workers", "Currently active worker tasks")?;
        let batch_insert_seconds = Histogram::with_opts(
            HistogramOpts::new("sieve_batch_insert_seconds", "IOC batch insert latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let batch_insert_size = Histogram::with_opts(
            HistogramOpts::new("sieve_batch_insert_size", "IOCs per batch insert")
                .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        )?;

        let api_requests = IntCounterVec::new(
            Opts::new(
                "sieve_api_requests_total",
                "API requests by endpoint, method, and outcome",
            ),
            &["endpoint", "method", "status"],
        )?;
        let api_latency = HistogramVec::new(
            HistogramOpts::new("sieve_api_latency_seconds", "API request latency by endpoint")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["endpoint", "method"],
        )?;
        let bloom_hits = IntCounter::new(
            "sieve_bloom_filter_hits_total",
            "Bloom filter positives (candidates for index lookup)",
        )?;
        let bloom_misses = IntCounter::new(
            "sieve_bloom_filter_misses_total",
            "Bloom filter negatives (definite non-matches)",
        )?;

        let bloom_size_bytes =
            IntGauge::new("sieve_bloom_filter_size_bytes", "Bloom filter size in bytes")?;
        let bloom_items = IntGauge::new("sieve_bloom_filter_items", "Items in the Bloom filter")?;

        for collector in [
            Box::new(files_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(files_skipped.clone()),
            Box::new(files_failed.clone()),
            Box::new(iocs_extracted.clone()),
            Box::new(bytes_processed.clone()),
            Box::new(active_workers.clone()),
            Box::new(batch_insert_seconds.clone()),
            Box::new(batch_insert_size.clone()),
            Box::new(api_requests.clone()),
            Box::new(api_latency.clone()),
            Box::new(bloom_hits.clone()),
            Box::new(bloom_misses.clone()),
            Box::new(bloom_size_bytes.clone()),
            Box::new(bloom_items.clone()),
        ] {
            registry
                .register(collector)
                .context("failed to register metric")?;
        }

        Ok(Self {
            registry,
            files_processed,
            files_skipped,
            files_failed,
            iocs_extracted,
            bytes_processed,
            active_workers,
            batch_insert_seconds,
            batch_insert_size,
            api_requests,
            api_latency,
            bloom_hits,
            bloom_misses,
            bloom_size_bytes,
            bloom_items,
        })
    }

    pub fn record_file_processed(&self, status: &str) {
        self.files_processed.with_label_values(&[status]).inc();
    }

    pub fn record_iocs_extracted(&self, ioc_type: &str, count: usize) {
        self.iocs_extracted
            .with_label_values(&[ioc_type])
            .inc_by(count as u64);
    }

    pub fn record_batch_insert(&self, size: usize, seconds: f64) {
        self.batch_insert_size.observe(size as f64);
        self.batch_insert_seconds.observe(seconds);
    }

    pub fn record_api_request(&self, endpoint: &str, method: &str, status: u16, seconds: f64) {
        let outcome = if status >= 400 { "error" } else { "success" };
        self.api_requests
            .with_label_values(&[endpoint, method, outcome])
            .inc();
        self.api_latency
            .with_label_values(&[endpoint, method])
            .observe(seconds);
    }

    pub fn record_bloom_check(&self, hit: bool) {
        if hit {
            self.bloom_hits.inc();
        } else {
            self.bloom_misses.inc();
        }
    }

    pub fn update_bloom_state(&self, size_bytes: i64, items: i64) {
        self.bloom_size_bytes.set(size_bytes);
        self.bloom_items.set(items);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .context("failed to encode metrics")
    }
}

/// Serve `/metrics` on its own port until the process exits.
pub async fn serve(metrics: std::sync::Arc<Metrics>, port: u16) -> Result<()> {
    use axum::{extract::State, routing::get, Router};

    async fn render(State(metrics): State<std::sync::Arc<Metrics>>) -> String {
        metrics.render().unwrap_or_default()
    }

    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    tracing::info!(addr = %addr, "starting metrics server");
    axum::serve(listener, app)
        .await
        .context("metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics.record_file_processed("infected");
        metrics.record_iocs_extracted("ipv4", 3);
        metrics.record_bloom_check(true);
        metrics.record_api_request("/check", "POST", 200, 0.01);

        let text = metrics.render().unwrap();
        assert!(text.contains("sieve_files_processed_total"));
        assert!(text.contains("sieve_iocs_extracted_total"));
        assert!(text.contains("sieve_bloom_filter_hits_total"));
    }
}
