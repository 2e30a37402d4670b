use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REPORTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_reports_total",
        "Total room reports received over MQTT or REST"
    ))
    .unwrap();
    pub static ref READINGS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_readings_accepted_total",
        "Total readings turned into telemetry records"
    ))
    .unwrap();
    pub static ref READINGS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_readings_skipped_total",
        "Total report entries skipped as unknown or malformed"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hub_ingest_latency_seconds",
            "Time taken to write a telemetry batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "hub_batch_size",
        "Current telemetry batch size being flushed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_channel_full_total",
        "Total number of times the telemetry channel was full"
    ))
    .unwrap();
    pub static ref RULES_FIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_rules_fired_total",
        "Total automation rule firings"
    ))
    .unwrap();
    pub static ref DISPATCH_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("hub_dispatch_total", "Controller commands by outcome"),
        &["outcome"]
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REPORTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_ACCEPTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RULES_FIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_outcomes_are_labelled() {
        DISPATCH_TOTAL.with_label_values(&["timeout"]).inc();
        assert!(DISPATCH_TOTAL.with_label_values(&["timeout"]).get() >= 1);
    }
}
