//! Periodically probes every instance of every worker. Three consecutive
//! failures against one instance terminate it by notifying its dispatcher
//! — the monitor never mutates `Worker` state directly, it only proposes,
//! and it never touches a worker mid-reload since it only ever reads a
//! published snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::WorkerKind;
use crate::instance::InstanceState;
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;
use crate::worker::DispatcherCommand;

const FAILURE_THRESHOLD: u32 = 3;

pub struct HealthMonitor {
    pub registry: Arc<WorkerRegistry>,
    pub metrics: Arc<Metrics>,
    pub tick_interval: Duration,
    pub probe_timeout: Duration,
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        metrics: Arc<Metrics>,
        tick_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            tick_interval,
            probe_timeout,
            failure_counts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One tick: snapshot every worker's instance list (a read), probe
    /// each healthy instance concurrently, and report an instance as
    /// unhealthy only after `FAILURE_THRESHOLD` consecutive failures —
    /// the dispatcher decides what to do with that report.
    async fn probe_all(&self) {
        let workers = self.registry.all().await;
        let mut seen = std::collections::HashSet::new();

        for worker in workers {
            let snapshot = worker.snapshot().await;
            self.metrics
                .set_worker_up(&worker.name, snapshot.healthy_count > 0);
            self.metrics
                .set_queue_depth(&worker.name, snapshot.queue_depth as i64);
            self.metrics
                .set_healthy_instance_count(&worker.name, snapshot.healthy_count as i64);

            let mut probes = FuturesUnordered::new();
            for instance in snapshot
                .instances
                .iter()
                .filter(|i| i.state == InstanceState::Healthy)
            {
                seen.insert(instance.id.clone());
                let id = instance.id.clone();
                let port = instance.port;
                let kind = worker.kind;
                let timeout = self.probe_timeout;
                probes.push(async move {
                    let start = Instant::now();
                    let ok = probe_one(kind, port, timeout).await;
                    (id, ok, start.elapsed())
                });
            }

            while let Some((id, ok, duration)) = probes.next().await {
                self.metrics
                    .health_check_duration_seconds
                    .with_label_values(&[&worker.name])
                    .observe(duration.as_secs_f64());

                let mut counts = self.failure_counts.lock().await;
                if ok {
                    counts.remove(&id);
                    continue;
                }
                self.metrics.record_health_failure(&worker.name);
                let failures = counts.entry(id.clone()).or_insert(0);
                *failures += 1;
                debug!(worker = %worker.name, instance = %id, failures = *failures, "health probe failed");
                if *failures >= FAILURE_THRESHOLD {
                    counts.remove(&id);
                    drop(counts);
                    worker
                        .send_command(DispatcherCommand::InstanceUnhealthy(id))
                        .await;
                }
            }
        }

        // Drop bookkeeping for instances that no longer exist (already
        // terminated by the dispatcher, e.g. via a rolling restart).
        let mut counts = self.failure_counts.lock().await;
        counts.retain(|id, _| seen.contains(id));
    }
}

async fn probe_one(kind: WorkerKind, port: u16, timeout: Duration) -> bool {
    match kind {
        WorkerKind::Cgi => tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .is_ok_and(|r| r.is_ok()),
        WorkerKind::Native | WorkerKind::Script => {
            tokio::time::timeout(timeout, http_health_check(port))
                .await
                .unwrap_or(false)
        }
    }
}

async fn http_health_check(port: u16) -> bool {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(_) => return false,
    };
    let request = b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    if stream.write_all(request).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 32];
    match stream.read(&mut buf).await {
        Ok(n) if n > 0 => {
            let text = String::from_utf8_lossy(&buf[..n]);
            text.starts_with("HTTP/1.1 2") || text.starts_with("HTTP/1.0 2")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_against_unbound_port_fails() {
        assert!(!probe_one(WorkerKind::Native, 1, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn cgi_probe_is_a_plain_tcp_connect() {
        assert!(!probe_one(WorkerKind::Cgi, 1, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn monitor_reports_only_after_threshold() {
        let registry = Arc::new(WorkerRegistry::new());
        let prometheus_registry = prometheus::Registry::new();
        let metrics = Arc::new(Metrics::register(&prometheus_registry));
        let monitor = HealthMonitor::new(
            registry,
            metrics,
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        let mut counts = monitor.failure_counts.lock().await;
        counts.insert("demo-1".to_string(), FAILURE_THRESHOLD - 1);
        assert_eq!(counts["demo-1"], 2);
    }
}
