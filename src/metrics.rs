//! Counters, gauges, and histograms, exposed on a `prometheus::Registry`
//! the same way the teacher wires its `/metrics` exposition (see
//! `cloud-component-service/src/server.rs`'s `PrometheusExporter`).

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

pub struct Metrics {
    pub requests_total: IntCounterVec,
    pub restarts_total: IntCounterVec,
    pub build_errors_total: IntCounterVec,
    pub health_failures_total: IntCounterVec,
    pub instance_count: IntGaugeVec,
    pub healthy_instance_count: IntGaugeVec,
    pub queue_depth: IntGaugeVec,
    pub worker_up: IntGaugeVec,
    pub request_duration_seconds: HistogramVec,
    pub health_check_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn register(registry: &Registry) -> Self {
        Self {
            requests_total: register_int_counter_vec_with_registry!(
                "tqserver_requests_total",
                "Total proxied requests by worker and status class",
                &["worker", "status_class"],
                registry
            )
            .unwrap(),
            restarts_total: register_int_counter_vec_with_registry!(
                "tqserver_worker_restarts_total",
                "Rolling restarts completed per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            build_errors_total: register_int_counter_vec_with_registry!(
                "tqserver_build_errors_total",
                "Build failures per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            health_failures_total: register_int_counter_vec_with_registry!(
                "tqserver_health_check_failures_total",
                "Health probe failures per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            instance_count: register_int_gauge_vec_with_registry!(
                "tqserver_instance_count",
                "Current instance count per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            healthy_instance_count: register_int_gauge_vec_with_registry!(
                "tqserver_healthy_instance_count",
                "Current healthy instance count per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            queue_depth: register_int_gauge_vec_with_registry!(
                "tqserver_queue_depth",
                "Current dispatch queue depth per worker",
                &["worker"],
                registry
            )
            .unwrap(),
            worker_up: register_int_gauge_vec_with_registry!(
                "tqserver_worker_up",
                "1 if the worker has at least one healthy instance",
                &["worker"],
                registry
            )
            .unwrap(),
            request_duration_seconds: register_histogram_vec_with_registry!(
                "tqserver_request_duration_seconds",
                "Proxied request duration",
                &["worker"],
                registry
            )
            .unwrap(),
            health_check_duration_seconds: register_histogram_vec_with_registry!(
                "tqserver_health_check_duration_seconds",
                "Health probe duration",
                &["worker"],
                registry
            )
            .unwrap(),
        }
    }

    pub fn record_instance_started(&self, worker: &str) {
        self.instance_count.with_label_values(&[worker]).inc();
    }

    pub fn record_instance_terminated(&self, worker: &str) {
        self.instance_count.with_label_values(&[worker]).dec();
    }

    pub fn record_restart(&self, worker: &str) {
        self.restarts_total.with_label_values(&[worker]).inc();
    }

    pub fn record_build_error(&self, worker: &str) {
        self.build_errors_total.with_label_values(&[worker]).inc();
    }

    pub fn record_health_failure(&self, worker: &str) {
        self.health_failures_total
            .with_label_values(&[worker])
            .inc();
    }

    pub fn record_request(&self, worker: &str, status_class: &str, duration_seconds: f64) {
        self.requests_total
            .with_label_values(&[worker, status_class])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[worker])
            .observe(duration_seconds);
    }

    pub fn set_healthy_instance_count(&self, worker: &str, count: i64) {
        self.healthy_instance_count
            .with_label_values(&[worker])
            .set(count);
    }

    pub fn set_queue_depth(&self, worker: &str, depth: i64) {
        self.queue_depth.with_label_values(&[worker]).set(depth);
    }

    pub fn set_worker_up(&self, worker: &str, up: bool) {
        self.worker_up
            .with_label_values(&[worker])
            .set(if up { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_panicking() {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry);
        metrics.record_request("index", "2xx", 0.01);
        metrics.record_restart("index");
        assert!(!registry.gather().is_empty());
    }
}
