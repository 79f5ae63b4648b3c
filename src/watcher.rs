//! Watches each worker's source tree (and the server's own config file)
//! for changes and drives the rolling-restart protocol by sending a
//! `DispatcherCommand::Reload` into the affected worker's dispatcher —
//! never by touching `Worker` state directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config;
use crate::registry::WorkerRegistry;
use crate::worker::DispatcherCommand;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum WatchTarget {
    Worker(String),
    ServerConfig,
}

pub struct FileWatcher {
    workers_dir: PathBuf,
    server_config_path: PathBuf,
    registry: Arc<WorkerRegistry>,
    debounce: Duration,
}

impl FileWatcher {
    pub fn new(
        workers_dir: PathBuf,
        server_config_path: PathBuf,
        registry: Arc<WorkerRegistry>,
        debounce: Duration,
    ) -> Self {
        Self {
            workers_dir,
            server_config_path,
            registry,
            debounce,
        }
    }

    /// Runs until `shutdown` fires. Returns an error only if the
    /// underlying OS watch could not be established.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> notify::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.workers_dir, RecursiveMode::Recursive)?;
        if let Some(parent) = self.server_config_path.parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<WatchTarget>();
        let mut timers: HashMap<WatchTarget, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                maybe_event = raw_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    if !is_relevant(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        if is_ignored(path) {
                            continue;
                        }
                        if let Some(target) = self.classify(path) {
                            self.schedule(target, &fire_tx, &mut timers);
                        }
                    }
                }
                maybe_target = fire_rx.recv() => {
                    let Some(target) = maybe_target else { break };
                    timers.remove(&target);
                    self.handle_fire(target).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (_, handle) in timers {
            handle.abort();
        }
        Ok(())
    }

    fn classify(&self, path: &Path) -> Option<WatchTarget> {
        if path == self.server_config_path {
            return Some(WatchTarget::ServerConfig);
        }
        let relative = path.strip_prefix(&self.workers_dir).ok()?;
        let name = relative.components().next()?;
        Some(WatchTarget::Worker(
            name.as_os_str().to_string_lossy().into_owned(),
        ))
    }

    fn schedule(
        &self,
        target: WatchTarget,
        fire_tx: &mpsc::UnboundedSender<WatchTarget>,
        timers: &mut HashMap<WatchTarget, JoinHandle<()>>,
    ) {
        if let Some(existing) = timers.remove(&target) {
            existing.abort();
        }
        let debounce = self.debounce;
        let fire_tx = fire_tx.clone();
        let fire_target = target.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = fire_tx.send(fire_target);
        });
        timers.insert(target, handle);
    }

    async fn handle_fire(&self, target: WatchTarget) {
        match target {
            WatchTarget::ServerConfig => {
                warn!(
                    "server configuration changed on disk; most settings require a process \
                     restart to take effect and were not hot-reloaded"
                );
            }
            WatchTarget::Worker(name) => {
                let Some(handle) = self.registry.find_by_name(&name).await else {
                    debug!(worker = %name, "change detected for an unregistered worker, ignoring");
                    return;
                };
                let spec_path = self
                    .workers_dir
                    .join(&name)
                    .join("config")
                    .join("worker.yaml");
                match config::load_worker_spec(&spec_path) {
                    Ok(new_spec) => {
                        info!(worker = %name, "source change detected, reloading");
                        handle.send_command(DispatcherCommand::Reload(new_spec)).await;
                    }
                    Err(e) => {
                        warn!(worker = %name, error = %e, "failed to reload worker spec, keeping previous");
                    }
                }
            }
        }
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        s == "bin" || s == "node_modules" || (s.starts_with('.') && s.len() > 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_bin_and_dotdirs_and_node_modules() {
        assert!(is_ignored(Path::new("workers/api/bin/api")));
        assert!(is_ignored(Path::new("workers/api/.git/HEAD")));
        assert!(is_ignored(Path::new("workers/api/node_modules/foo.js")));
        assert!(!is_ignored(Path::new("workers/api/src/main.rs")));
    }

    #[test]
    fn relevant_events_are_only_create_and_modify() {
        assert!(is_relevant(&EventKind::Create(notify::event::CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(
            notify::event::ModifyKind::Data(notify::event::DataChange::Any)
        )));
        assert!(!is_relevant(&EventKind::Remove(notify::event::RemoveKind::File)));
        assert!(!is_relevant(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[test]
    fn classify_worker_path_extracts_directory_name() {
        let watcher = FileWatcher::new(
            PathBuf::from("/srv/workers"),
            PathBuf::from("/srv/config/server.yaml"),
            Arc::new(WorkerRegistry::new()),
            Duration::from_millis(500),
        );
        let target = watcher.classify(Path::new("/srv/workers/api/src/main.rs"));
        assert_eq!(target, Some(WatchTarget::Worker("api".to_string())));

        let target = watcher.classify(Path::new("/srv/config/server.yaml"));
        assert_eq!(target, Some(WatchTarget::ServerConfig));
    }
}
