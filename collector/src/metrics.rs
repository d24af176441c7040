use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref INGEST_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_ingest_requests_total",
        "Total measurement upload requests received"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_measurements_stored_total",
        "Total measurements stored"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_measurements_rejected_total",
        "Total measurement uploads rejected by validation"
    ))
    .unwrap();
    pub static ref AUTH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_auth_failures_total",
        "Total measurement uploads with a missing or incorrect API key"
    ))
    .unwrap();
    pub static ref RUNS_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_runs_created_total",
        "Total runs created"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_REASSIGNED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_measurements_reassigned_total",
        "Total measurements moved into newly created runs"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "collector_ingest_latency_seconds",
            "Time taken to authenticate and store one measurement"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(INGEST_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MEASUREMENTS_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MEASUREMENTS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RUNS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MEASUREMENTS_REASSIGNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
