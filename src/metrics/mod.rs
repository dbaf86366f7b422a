use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for cycle durations (seconds).
const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

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
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                DURATION_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // verification pipeline
        describe_counter!(
            "manager_verify_cycles_total",
            Unit::Count,
            "Verification cycles by result"
        );
        describe_histogram!(
            "manager_verify_cycle_duration_seconds",
            Unit::Seconds,
            "Wall-clock duration of a verification cycle"
        );

        // probe
        describe_counter!(
            "manager_probe_start_total",
            Unit::Count,
            "Probe kernel startup attempts"
        );
        describe_gauge!(
            "manager_probe_running",
            Unit::Count,
            "Probe kernel liveness: 1=running 0=stopped"
        );

        // managed kernel
        describe_gauge!(
            "manager_kernel_running",
            Unit::Count,
            "Managed kernel liveness: 1=running 0=stopped"
        );
        describe_counter!(
            "manager_config_applies_total",
            Unit::Count,
            "Config rebuild + apply passes"
        );

        // subscriptions
        describe_counter!(
            "manager_sub_refresh_total",
            Unit::Count,
            "Subscription refresh attempts by result"
        );

        // event bus
        describe_counter!(
            "manager_events_published_total",
            Unit::Count,
            "Events published per topic"
        );
        describe_counter!(
            "manager_events_dropped_total",
            Unit::Count,
            "Events dropped for slow subscribers"
        );

        // http surface
        describe_counter!(
            "manager_http_requests_total",
            Unit::Count,
            "API requests by path group and status"
        );
        describe_gauge!(
            "manager_ws_clients",
            Unit::Count,
            "Connected WebSocket clients"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
