use once_cell::sync::Lazy;
use prometheus::{core::Collector, histogram_opts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::error;

static PIPELINE_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "histguard_pipeline_outcomes_total",
            "Protected requests by final pipeline outcome",
        ),
        &["outcome"],
    )
    .expect("histguard_pipeline_outcomes_total definition")
});

static STAGE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        histogram_opts!(
            "histguard_stage_latency_ms",
            "Time spent per validation stage",
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0]
        ),
        &["stage"],
    )
    .expect("histguard_stage_latency_ms definition")
});

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector)) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register pipeline metric");
        }
    }
}

/// Registers pipeline and sandbox collectors on `registry`.
pub fn register_metrics(registry: &Registry) {
    register(registry, PIPELINE_OUTCOMES_TOTAL.clone());
    register(registry, STAGE_LATENCY_MS.clone());
    policy_sandbox::metrics::register_metrics(registry);
}

pub fn record_outcome(outcome: &str) {
    PIPELINE_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_stage(stage: &str, latency_ms: f64) {
    STAGE_LATENCY_MS.with_label_values(&[stage]).observe(latency_ms);
}

pub fn outcome_count(outcome: &str) -> u64 {
    PIPELINE_OUTCOMES_TOTAL.with_label_values(&[outcome]).get()
}
