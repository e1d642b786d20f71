use once_cell::sync::Lazy;
use prometheus::{core::Collector, histogram_opts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::error;

static SANDBOX_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("histguard_sandbox_runs_total", "Guest program invocations"),
        &["kind", "result"],
    )
    .expect("histguard_sandbox_runs_total definition")
});

static SANDBOX_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        histogram_opts!(
            "histguard_sandbox_latency_ms",
            "Wall time of guest program invocations",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
        ),
        &["kind"],
    )
    .expect("histguard_sandbox_latency_ms definition")
});

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector)) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register sandbox metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, SANDBOX_RUNS_TOTAL.clone());
    register(registry, SANDBOX_LATENCY_MS.clone());
}

pub fn observe_run(kind: &str, result: &str, latency_ms: f64) {
    SANDBOX_RUNS_TOTAL.with_label_values(&[kind, result]).inc();
    SANDBOX_LATENCY_MS
        .with_label_values(&[kind])
        .observe(latency_ms);
}

pub fn run_count(kind: &str, result: &str) -> u64 {
    SANDBOX_RUNS_TOTAL.with_label_values(&[kind, result]).get()
}
