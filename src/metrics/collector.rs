// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    // Backend metrics
    pub backend_requests_total: IntCounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub backend_health_status: IntGaugeVec,

    // Pool metrics
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of requests"),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "Request duration in seconds, including retries",
            ),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let backend_requests_total = IntCounterVec::new(
            Opts::new("lb_backend_requests_total", "Total backend forwarding attempts"),
            &["backend", "status"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_backend_request_duration_seconds",
                "Backend request duration",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_request_duration_seconds.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=eligible, 0=held back)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let healthy_backends =
            IntGauge::new("lb_healthy_backends", "Number of healthy backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends = IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            backend_requests_total,
            backend_request_duration_seconds,
            backend_health_status,
            healthy_backends,
            total_backends,
        })
    }

    pub fn record_request(&self, method: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method, &status])
            .observe(duration.as_secs_f64());
    }

    pub fn record_backend_request(&self, backend: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, status])
            .inc();

        self.backend_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exports_recorded_values() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request("GET", 200, Duration::from_millis(12));
        metrics.record_backend_request("alpha", false, Duration::from_millis(3));
        metrics.update_backend_health("alpha", false);
        metrics.update_backend_counts(1, 2);

        let text = String::from_utf8(registry.gather()).unwrap();
        assert!(text.contains(r#"lb_requests_total{method="GET",status_code="200"} 1"#));
        assert!(text.contains(r#"lb_backend_requests_total{backend="alpha",status="failure"} 1"#));
        assert!(text.contains(r#"lb_backend_health_status{backend="alpha"} 0"#));
        assert!(text.contains("lb_healthy_backends 1"));
        assert!(text.contains("lb_total_backends 2"));
    }
}
