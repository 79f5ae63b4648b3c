//! Compiles/installs a worker's artifact idempotently by comparing source
//! mtimes against the artifact mtime, skipping work when nothing changed.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{WorkerKind, WorkerSpec};
use crate::error::BuildError;

#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, spec: &WorkerSpec) -> Result<(), BuildError>;
}

pub struct FsBuilder {
    pub workers_root: PathBuf,
}

impl FsBuilder {
    pub fn new(workers_root: PathBuf) -> Self {
        Self { workers_root }
    }

    fn worker_dir(&self, spec: &WorkerSpec) -> PathBuf {
        self.workers_root.join(&spec.name)
    }

    fn artifact_path(&self, spec: &WorkerSpec) -> PathBuf {
        self.worker_dir(spec).join("bin").join(&spec.name)
    }

    fn latest_source_mtime(&self, spec: &WorkerSpec) -> Option<SystemTime> {
        let src_dir = self.worker_dir(spec).join("src");
        latest_mtime_under(&src_dir)
    }
}

#[async_trait]
impl Builder for FsBuilder {
    async fn build(&self, spec: &WorkerSpec) -> Result<(), BuildError> {
        match spec.kind {
            WorkerKind::Script => {
                // Nothing to compile; the entrypoint is interpreted directly.
                // Presence is a prerequisite the launcher itself will surface.
                Ok(())
            }
            WorkerKind::Native | WorkerKind::Cgi => {
                let artifact = self.artifact_path(spec);
                let artifact_mtime = std::fs::metadata(&artifact).ok().and_then(|m| m.modified().ok());
                let source_mtime = self.latest_source_mtime(spec);

                if let (Some(artifact_mtime), Some(source_mtime)) = (artifact_mtime, source_mtime) {
                    if artifact_mtime >= source_mtime {
                        info!(worker = %spec.name, "build is up to date, skipping");
                        return Ok(());
                    }
                }

                let worker_dir = self.worker_dir(spec);
                info!(worker = %spec.name, dir = %worker_dir.display(), "building worker");
                let status = Command::new("cargo")
                    .arg("build")
                    .arg("--release")
                    .current_dir(&worker_dir)
                    .status()
                    .await;

                match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => {
                        let message = format!("build exited with {status}");
                        warn!(worker = %spec.name, %message);
                        Err(BuildError::Failed(message))
                    }
                    Err(e) => {
                        let message = format!("failed to invoke build: {e}");
                        warn!(worker = %spec.name, %message);
                        Err(BuildError::Failed(message))
                    }
                }
            }
        }
    }
}

fn latest_mtime_under(dir: &Path) -> Option<SystemTime> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

/// A no-op builder used in tests and for `script` workers driven entirely
/// by a pre-existing interpreter + entrypoint.
pub struct NoopBuilder;

#[async_trait]
impl Builder for NoopBuilder {
    async fn build(&self, _spec: &WorkerSpec) -> Result<(), BuildError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnabledPolicy, RuntimeOptions, ScalingConfig};
    use std::fs;
    use tempfile::tempdir;

    fn spec(name: &str, kind: WorkerKind) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            url_prefix: "/".to_string(),
            kind,
            enabled: EnabledPolicy::Always,
            scaling: ScalingConfig::default(),
            runtime: RuntimeOptions::default(),
            log_template: "{name}-{port}-{date}.log".to_string(),
            source_mtime: None,
        }
    }

    #[tokio::test]
    async fn script_worker_build_is_a_noop() {
        let builder = FsBuilder::new(PathBuf::from("/nonexistent"));
        let result = builder.build(&spec("s", WorkerKind::Script)).await;
        assert!(result.is_ok());
    }

    #[test]
    fn up_to_date_artifact_is_detected() {
        let dir = tempdir().unwrap();
        let worker_dir = dir.path().join("demo");
        fs::create_dir_all(worker_dir.join("src")).unwrap();
        fs::create_dir_all(worker_dir.join("bin")).unwrap();
        fs::write(worker_dir.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(worker_dir.join("bin/demo"), "binary").unwrap();

        // Bump the artifact's mtime past the source file's.
        let artifact = worker_dir.join("bin/demo");
        let now = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
        filetime_touch(&artifact, now);

        let builder = FsBuilder::new(dir.path().to_path_buf());
        let artifact_mtime = std::fs::metadata(&artifact).unwrap().modified().unwrap();
        let source_mtime = builder.latest_source_mtime(&spec("demo", WorkerKind::Native));
        assert!(source_mtime.is_some());
        assert!(artifact_mtime >= source_mtime.unwrap());
    }

    fn filetime_touch(path: &Path, time: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}
