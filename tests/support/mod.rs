//! Shared fixtures for the integration tests: a minimal `python3`-based
//! HTTP worker (the simplest interpreter virtually guaranteed present on
//! a dev machine) that answers every request, including `/health`, with
//! 200 OK.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tqserver::builder::NoopBuilder;
use tqserver::config::{EnabledPolicy, Mode, RuntimeOptions, ScalingConfig, WorkerKind, WorkerSpec};
use tqserver::launcher::Launcher;
use tqserver::metrics::Metrics;
use tqserver::port_allocator::PortAllocator;
use tqserver::worker::{self, WorkerDeps, WorkerHandle};

const ECHO_SERVER_PY: &str = r#"
import http.server
import os
import sys

class Handler(http.server.BaseHTTPRequestHandler):
    def _respond(self):
        body = f"{os.environ.get('WORKER_NAME', '')}:{os.environ['WORKER_PORT']}".encode()
        self.send_response(200)
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def do_GET(self):
        self._respond()

    def log_message(self, *args):
        pass

port = int(os.environ["WORKER_PORT"])
http.server.HTTPServer(("127.0.0.1", port), Handler).serve_forever()
"#;

/// Holds the tempdir alive for the test's duration; the script path
/// inside it is what gets wired into `RuntimeOptions::entrypoint`.
pub struct EchoFixture {
    _dir: TempDir,
    pub script_path: PathBuf,
}

impl EchoFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("echo_server.py");
        std::fs::write(&script_path, ECHO_SERVER_PY).expect("write fixture script");
        Self {
            _dir: dir,
            script_path,
        }
    }

    pub fn spec(&self, name: &str, url_prefix: &str, scaling: ScalingConfig) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            url_prefix: url_prefix.to_string(),
            kind: WorkerKind::Script,
            enabled: EnabledPolicy::Always,
            scaling,
            runtime: RuntimeOptions {
                interpreter: Some("python3".to_string()),
                entrypoint: Some(self.script_path.to_string_lossy().into_owned()),
                ..Default::default()
            },
            log_template: "{name}-{port}-{date}.log".to_string(),
            source_mtime: None,
        }
    }
}

/// Shared process-supervision context for one test: one port allocator,
/// one metrics registry, reused across every worker the test spawns —
/// exactly as the real supervisor shares them across all workers.
pub struct TestEnv {
    pub allocator: Arc<PortAllocator>,
    metrics: Arc<Metrics>,
}

impl TestEnv {
    pub fn new(port_start: u16, port_end: u16) -> Self {
        let prometheus_registry = prometheus::Registry::new();
        Self {
            allocator: Arc::new(PortAllocator::new(port_start, port_end)),
            metrics: Arc::new(Metrics::register(&prometheus_registry)),
        }
    }

    pub fn deps(&self, tick_interval: Duration) -> WorkerDeps {
        WorkerDeps {
            builder: Arc::new(NoopBuilder),
            launcher: Arc::new(Launcher {
                allocator: self.allocator.clone(),
                mode: Mode::Dev,
                health_wait_timeout: Duration::from_secs(5),
            }),
            metrics: self.metrics.clone(),
            mode: Mode::Dev,
            scaling_tick_interval: tick_interval,
            startup_delay: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn spawn_worker(
        &self,
        spec: WorkerSpec,
        tick_interval: Duration,
    ) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
        worker::spawn(spec, self.deps(tick_interval))
    }
}
