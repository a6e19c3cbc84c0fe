use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Shared metrics registry for dataset and RPC instrumentation.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    rpc_calls: CounterVec,
    partials_emitted: CounterVec,
    registered_objects: Gauge,
    active_subscriptions: Gauge,
    open_sessions: Gauge,
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let rpc_calls = CounterVec::new(
            Opts::new("pdq_rpc_calls_total", "RPC calls received by method"),
            &["method"],
        )
        .expect("rpc_calls opts");
        let partials_emitted = CounterVec::new(
            Opts::new(
                "pdq_partials_emitted_total",
                "Partial results emitted by operation kind",
            ),
            &["operation"],
        )
        .expect("partials_emitted opts");
        let registered_objects = Gauge::new(
            "pdq_registered_objects",
            "Live dataset handles in the object registry",
        )
        .expect("registered_objects opts");
        let active_subscriptions = Gauge::new(
            "pdq_active_subscriptions",
            "Streaming subscriptions currently live on the server",
        )
        .expect("active_subscriptions opts");
        let open_sessions =
            Gauge::new("pdq_open_sessions", "Open client sessions").expect("open_sessions opts");

        registry
            .register(Box::new(rpc_calls.clone()))
            .expect("register rpc_calls");
        registry
            .register(Box::new(partials_emitted.clone()))
            .expect("register partials_emitted");
        registry
            .register(Box::new(registered_objects.clone()))
            .expect("register registered_objects");
        registry
            .register(Box::new(active_subscriptions.clone()))
            .expect("register active_subscriptions");
        registry
            .register(Box::new(open_sessions.clone()))
            .expect("register open_sessions");

        Self {
            registry,
            rpc_calls,
            partials_emitted,
            registered_objects,
            active_subscriptions,
            open_sessions,
        }
    }
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Counts one received RPC call for `method`.
    pub fn record_rpc_call(&self, method: &str) {
        self.inner.rpc_calls.with_label_values(&[method]).inc();
    }

    /// Counts one emitted partial result for `operation`.
    pub fn record_partial(&self, operation: &str) {
        self.inner
            .partials_emitted
            .with_label_values(&[operation])
            .inc();
    }

    /// Adjusts the live registry object gauge by `delta`.
    pub fn adjust_registered_objects(&self, delta: i64) {
        self.inner.registered_objects.add(delta as f64);
    }

    /// Adjusts the active subscription gauge by `delta`.
    pub fn adjust_active_subscriptions(&self, delta: i64) {
        self.inner.active_subscriptions.add(delta as f64);
    }

    /// Adjusts the open session gauge by `delta`.
    pub fn adjust_open_sessions(&self, delta: i64) {
        self.inner.open_sessions.add(delta as f64);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry, created on first use.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_metrics_contain_recorded_calls() {
        let metrics = MetricsRegistry::new();
        metrics.record_rpc_call("sketch");
        metrics.record_partial("sketch");
        metrics.adjust_active_subscriptions(1);
        let body = metrics.render_prometheus();
        assert!(body.contains("pdq_rpc_calls_total"));
        assert!(body.contains("pdq_active_subscriptions"));
    }
}
