use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "proxy_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "proxy_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client's perspective"
        );
        describe_histogram!(
            "proxy_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream round-trip duration"
        );
        describe_gauge!(
            "proxy_http_requests_in_flight",
            Unit::Count,
            "Requests currently being forwarded"
        );

        describe_gauge!(
            "proxy_upstreams_healthy",
            Unit::Count,
            "Upstream health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "proxy_health_check_total",
            Unit::Count,
            "Active health probe attempts"
        );
        describe_counter!(
            "proxy_upstream_retries_total",
            Unit::Count,
            "Forwarding attempts that were retried"
        );

        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Downstream connections accepted"
        );
        describe_gauge!(
            "proxy_upgraded_streams_active",
            Unit::Count,
            "Hijacked (upgraded) streams currently spliced"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
