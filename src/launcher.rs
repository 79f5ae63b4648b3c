//! Spawns a worker's child process, injects the documented environment
//! variables, captures stdout/stderr to a per-instance log file, and polls
//! `/health` until the instance is ready or the wait times out.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{Mode, WorkerKind, WorkerSpec};
use crate::error::LaunchError;
use crate::instance::WorkerInstance;
use crate::port_allocator::PortAllocator;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Launcher {
    pub allocator: std::sync::Arc<PortAllocator>,
    pub mode: Mode,
    pub health_wait_timeout: Duration,
}

impl Launcher {
    /// Spawns one instance for `spec`, polling health until ready or the
    /// configured wait timeout elapses. On any failure the child is
    /// killed and the port released before the error is returned.
    pub async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerInstance, LaunchError> {
        let port = self.allocator.acquire()?;
        let log_path = log_path_for(spec, port);

        let mut command = build_command(spec, port, self.mode);
        if let Some(parent) = log_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;

        let (stdout, stderr) = match log_file {
            Ok(file) => {
                let stdio = file.into_std().await;
                let stdio_err = stdio.try_clone().map_err(LaunchError::Spawn)?;
                (Stdio::from(stdio), Stdio::from(stdio_err))
            }
            Err(_) => (Stdio::null(), Stdio::null()),
        };

        command.stdout(stdout).stderr(stderr).stdin(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.allocator.release(port);
                return Err(LaunchError::Spawn(e));
            }
        };
        let pid = child.id().unwrap_or(0);

        if let Err(timeout) = self.wait_until_healthy(spec, port).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.allocator.release(port);
            return Err(LaunchError::HealthTimeout(timeout));
        }

        let mut instance = WorkerInstance::new(&spec.name, port, pid, child);
        instance.mark_healthy();
        Ok(instance)
    }

    async fn wait_until_healthy(&self, spec: &WorkerSpec, port: u16) -> Result<(), Duration> {
        let deadline = Instant::now() + self.health_wait_timeout;
        loop {
            let ok = match spec.kind {
                WorkerKind::Cgi => TcpStream::connect(("127.0.0.1", port)).await.is_ok(),
                WorkerKind::Native | WorkerKind::Script => probe_health(port).await,
            };
            if ok {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.health_wait_timeout);
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

async fn probe_health(port: u16) -> bool {
    let addr = format!("127.0.0.1:{port}");
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(_) => return false,
    };
    let mut stream = stream;
    let request = b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    if stream.write_all(request).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 32];
    use tokio::io::AsyncReadExt;
    match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            let text = String::from_utf8_lossy(&buf[..n]);
            text.starts_with("HTTP/1.1 2") || text.starts_with("HTTP/1.0 2")
        }
        _ => false,
    }
}

fn build_command(spec: &WorkerSpec, port: u16, mode: Mode) -> Command {
    let program = spec
        .runtime
        .entrypoint
        .clone()
        .unwrap_or_else(|| format!("workers/{}/bin/{}", spec.name, spec.name));
    let mut command = match spec.kind {
        WorkerKind::Script => {
            let interpreter = spec
                .runtime
                .interpreter
                .clone()
                .unwrap_or_else(|| "node".to_string());
            let mut c = Command::new(interpreter);
            c.arg(&program);
            c
        }
        WorkerKind::Native | WorkerKind::Cgi => Command::new(&program),
    };

    command
        .env("WORKER_PORT", port.to_string())
        .env("PORT", port.to_string())
        .env("WORKER_NAME", &spec.name)
        .env("WORKER_PATH", &spec.url_prefix)
        .env("WORKER_TYPE", kind_str(spec.kind))
        .env("WORKER_MODE", mode_str(mode));

    for (key, value) in &spec.runtime.env {
        command.env(key, value);
    }

    command.kill_on_drop(true);
    command
}

fn kind_str(kind: WorkerKind) -> &'static str {
    match kind {
        WorkerKind::Native => "native",
        WorkerKind::Script => "script",
        WorkerKind::Cgi => "cgi",
    }
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Dev => "dev",
        Mode::Prod => "prod",
    }
}

fn log_path_for(spec: &WorkerSpec, port: u16) -> PathBuf {
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let name = spec
        .log_template
        .replace("{name}", &spec.name)
        .replace("{port}", &port.to_string())
        .replace("{date}", &date);
    PathBuf::from("logs").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnabledPolicy, RuntimeOptions, ScalingConfig};

    fn spec() -> WorkerSpec {
        WorkerSpec {
            name: "demo".to_string(),
            url_prefix: "/".to_string(),
            kind: WorkerKind::Native,
            enabled: EnabledPolicy::Always,
            scaling: ScalingConfig::default(),
            runtime: RuntimeOptions::default(),
            log_template: "{name}-{port}-{date}.log".to_string(),
            source_mtime: None,
        }
    }

    #[test]
    fn log_path_substitutes_all_placeholders() {
        let path = log_path_for(&spec(), 9001);
        let rendered = path.to_string_lossy();
        assert!(rendered.contains("demo"));
        assert!(rendered.contains("9001"));
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn command_carries_documented_env_vars() {
        let command = build_command(&spec(), 9002, Mode::Dev).as_std().clone();
        let envs: std::collections::HashMap<_, _> = command
            .get_envs()
            .map(|(k, v)| (k.to_string_lossy().to_string(), v.map(|v| v.to_string_lossy().to_string())))
            .collect();
        assert_eq!(envs.get("WORKER_PORT").cloned().flatten(), Some("9002".to_string()));
        assert_eq!(envs.get("PORT").cloned().flatten(), Some("9002".to_string()));
        assert_eq!(envs.get("WORKER_NAME").cloned().flatten(), Some("demo".to_string()));
        assert_eq!(envs.get("WORKER_MODE").cloned().flatten(), Some("dev".to_string()));
    }

    #[tokio::test]
    async fn health_probe_against_closed_port_fails_fast() {
        assert!(!probe_health(1).await);
    }
}
