//! Top-level wiring: loads configuration, discovers worker specs, spawns
//! one dispatcher per worker, and coordinates the health monitor, file
//! watcher, and graceful shutdown. Mirrors the teacher's `Services`/
//! `CloudService` bootstrap shape, minus the database layer this system
//! has no use for.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use prometheus::Registry;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::builder::{Builder, FsBuilder};
use crate::config::ServerConfig;
use crate::fastcgi::{FastCgiClient, StubFastCgiClient};
use crate::health::HealthMonitor;
use crate::launcher::Launcher;
use crate::metrics::Metrics;
use crate::port_allocator::PortAllocator;
use crate::proxy::ProxyState;
use crate::registry::WorkerRegistry;
use crate::watcher::FileWatcher;
use crate::worker::{self, WorkerDeps};

pub struct Supervisor {
    pub config: ServerConfig,
    pub registry: Arc<WorkerRegistry>,
    pub metrics: Arc<Metrics>,
    pub proxy_state: Arc<ProxyState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher_tasks: JoinSet<()>,
    background_tasks: JoinSet<()>,
}

impl Supervisor {
    /// Loads config, discovers every `workers/<name>/config/worker.yaml`,
    /// and brings each enabled worker's dispatcher up to `min_instances`.
    pub async fn bootstrap(config: ServerConfig, prometheus_registry: &Registry) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::register(prometheus_registry));
        let registry = Arc::new(WorkerRegistry::new());
        let allocator = Arc::new(PortAllocator::new(
            config.workers.port_range_start,
            config.workers.port_range_end,
        ));
        let launcher = Arc::new(Launcher {
            allocator: allocator.clone(),
            mode: config.mode,
            health_wait_timeout: config.health_check_wait_timeout(),
        });
        let builder: Arc<dyn Builder> = Arc::new(FsBuilder::new(config.workers.directory.clone()));
        let fastcgi: Arc<dyn FastCgiClient> = Arc::new(StubFastCgiClient);

        let specs = crate::config::discover_worker_specs(&config.workers.directory)
            .context("discovering worker specs")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut dispatcher_tasks = JoinSet::new();

        for spec in specs {
            if !spec.enabled.is_enabled(config.mode) {
                info!(worker = %spec.name, "worker disabled for this mode, skipping bring-up");
                continue;
            }
            info!(worker = %spec.name, prefix = %spec.url_prefix, "bringing up worker");

            let deps = WorkerDeps {
                builder: builder.clone(),
                launcher: launcher.clone(),
                metrics: metrics.clone(),
                mode: config.mode,
                scaling_tick_interval: std::time::Duration::from_secs(2),
                startup_delay: std::time::Duration::from_millis(config.workers.startup_delay_ms),
                shutdown_grace: config.shutdown_grace_period(),
            };
            let (handle, join) = worker::spawn(spec, deps);
            registry.register(handle).await;
            dispatcher_tasks.spawn(async move {
                if let Err(e) = join.await {
                    warn!(error = %e, "dispatcher task panicked");
                }
            });
        }

        let proxy_state = Arc::new(ProxyState::new(
            registry.clone(),
            metrics.clone(),
            config.mode,
            config.workers.directory.clone(),
            PathBuf::from("server/public"),
            fastcgi,
        ));

        let mut background_tasks = JoinSet::new();

        let health_monitor = HealthMonitor::new(
            registry.clone(),
            metrics.clone(),
            std::time::Duration::from_secs(5),
            config.health_check_timeout(),
        );
        let health_shutdown = shutdown_rx.clone();
        background_tasks.spawn(async move {
            health_monitor.run(health_shutdown).await;
        });

        let watcher = FileWatcher::new(
            config.workers.directory.clone(),
            PathBuf::from("config/server.yaml"),
            registry.clone(),
            std::time::Duration::from_millis(config.file_watcher.debounce_ms),
        );
        let watcher_shutdown = shutdown_rx.clone();
        background_tasks.spawn(async move {
            if let Err(e) = watcher.run(watcher_shutdown).await {
                warn!(error = %e, "file watcher stopped");
            }
        });

        Ok(Self {
            config,
            registry,
            metrics,
            proxy_state,
            shutdown_tx,
            shutdown_rx,
            dispatcher_tasks,
            background_tasks,
        })
    }

    /// Broadcasts shutdown to every worker and background task, then
    /// waits (bounded by the configured grace period) for them to exit.
    pub async fn shutdown(mut self) {
        info!("shutdown requested, draining workers");
        let _ = self.shutdown_tx.send(true);

        let workers = self.registry.all().await;
        for worker in &workers {
            worker
                .send_command(crate::worker::DispatcherCommand::Shutdown)
                .await;
        }

        let grace = self.config.shutdown_grace_period();
        let _ = tokio::time::timeout(grace, async {
            while self.dispatcher_tasks.join_next().await.is_some() {}
        })
        .await;
        let _ = tokio::time::timeout(grace, async {
            while self.background_tasks.join_next().await.is_some() {}
        })
        .await;
        info!("shutdown complete");
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}
