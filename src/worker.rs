//! The per-worker dispatcher: a single task that owns a worker's mutable
//! state (its instance pool, round-robin cursor, build state, restart
//! epoch) and serializes every mutation through itself. All other tasks
//! — proxy handler, health monitor, file watcher — only ever read a
//! published snapshot or send it a command.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{info, warn};

use crate::builder::Builder;
use crate::config::{WorkerKind, WorkerSpec};
use crate::error::DispatchError;
use crate::instance::{InstanceHandle, InstanceState, WorkerInstance};
use crate::launcher::Launcher;
use crate::metrics::Metrics;

pub const DISPATCH_QUEUE_CAPACITY: usize = 1024;
const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, Default)]
pub enum BuildState {
    #[default]
    Ok,
    Error(String),
}

/// Read-only summary of one instance, published for the health monitor
/// and metrics — never used to mutate dispatcher-owned state.
#[derive(Clone, Debug)]
pub struct InstanceInfo {
    pub id: String,
    pub port: u16,
    pub pid: u32,
    pub state: InstanceState,
}

#[derive(Clone, Debug, Default)]
pub struct WorkerSnapshot {
    pub build_state: BuildState,
    pub restart_epoch: u64,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub queue_depth: usize,
    pub instances: Vec<InstanceInfo>,
}

/// A one-shot "request for an instance" placed on a worker's queue.
/// Fulfilling with `None` is the explicit refusal signal.
pub struct DispatchToken {
    reply: oneshot::Sender<Option<InstanceHandle>>,
}

impl DispatchToken {
    fn fulfill(self, instance: Option<InstanceHandle>) {
        let _ = self.reply.send(instance);
    }
}

pub enum DispatcherCommand {
    /// A new spec was loaded (config or source change); rebuild and
    /// roll the worker onto it.
    Reload(WorkerSpec),
    /// The health monitor observed a probe failure severe enough to kill
    /// this one instance.
    InstanceUnhealthy(String),
    Shutdown,
}

/// Cheap-to-clone handle to a running worker's dispatcher.
#[derive(Clone)]
pub struct WorkerHandle {
    pub name: String,
    pub url_prefix: String,
    pub kind: WorkerKind,
    queue_tx: mpsc::Sender<DispatchToken>,
    command_tx: mpsc::Sender<DispatcherCommand>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
}

impl WorkerHandle {
    /// Enqueues a dispatch request and awaits the reply, honoring the
    /// 30 s dispatch deadline. Returns `QueueFull` immediately if the
    /// non-blocking enqueue fails, `Timeout` if the deadline elapses, and
    /// `NoInstance` if the dispatcher explicitly refused.
    pub async fn dispatch(&self, timeout: Duration) -> Result<InstanceHandle, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let token = DispatchToken { reply: reply_tx };
        self.queue_tx
            .try_send(token)
            .map_err(|_| DispatchError::QueueFull)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Some(instance))) => Ok(instance),
            Ok(Ok(None)) => Err(DispatchError::NoInstance),
            Ok(Err(_)) => Err(DispatchError::NoInstance),
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    pub async fn send_command(&self, command: DispatcherCommand) {
        let _ = self.command_tx.send(command).await;
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.read().await.clone()
    }
}

pub struct WorkerDeps {
    pub builder: Arc<dyn Builder>,
    pub launcher: Arc<Launcher>,
    pub metrics: Arc<Metrics>,
    pub mode: crate::config::Mode,
    pub scaling_tick_interval: Duration,
    pub startup_delay: Duration,
    pub shutdown_grace: Duration,
}

struct Dispatcher {
    spec: WorkerSpec,
    instances: Vec<WorkerInstance>,
    next_instance_index: usize,
    build_state: BuildState,
    restart_epoch: u64,
    deps: WorkerDeps,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    queue_depth_hint: usize,
}

impl Dispatcher {
    /// `enabled: "development"`-style policies can make a worker
    /// ineligible under the server's current mode without removing its
    /// registry entry — the pool is simply held at zero instances.
    fn is_enabled(&self) -> bool {
        self.spec.enabled.is_enabled(self.deps.mode)
    }

    fn healthy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Healthy)
            .count()
    }

    async fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.build_state = self.build_state.clone();
        snapshot.restart_epoch = self.restart_epoch;
        snapshot.instance_count = self.instances.len();
        snapshot.healthy_count = self.healthy_count();
        snapshot.queue_depth = self.queue_depth_hint;
        snapshot.instances = self
            .instances
            .iter()
            .map(|i| InstanceInfo {
                id: i.id.clone(),
                port: i.port,
                pid: i.pid,
                state: i.state,
            })
            .collect();
    }

    /// Picks the next eligible (healthy) instance, advancing the
    /// round-robin cursor past ineligible ones without resetting it.
    fn pick_instance(&mut self) -> Option<InstanceHandle> {
        let len = self.instances.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = self.next_instance_index % len;
            self.next_instance_index = (self.next_instance_index + 1) % len;
            if self.instances[idx].is_eligible_for_dispatch() {
                self.instances[idx].touch();
                return Some(self.instances[idx].handle());
            }
        }
        None
    }

    async fn scale_up_one(&mut self) {
        match self.deps.launcher.launch(&self.spec).await {
            Ok(instance) => {
                self.deps.metrics.record_instance_started(&self.spec.name);
                self.instances.push(instance);
            }
            Err(e) => {
                warn!(worker = %self.spec.name, error = %e, "scale-up failed");
            }
        }
    }

    async fn bring_up_minimum(&mut self) {
        if !self.is_enabled() {
            return;
        }
        for i in 0..self.spec.scaling.min_instances {
            self.scale_up_one().await;
            if i + 1 < self.spec.scaling.min_instances {
                tokio::time::sleep(self.deps.startup_delay).await;
            }
        }
    }

    async fn reap_dead_instances(&mut self) {
        let mut i = 0;
        while i < self.instances.len() {
            let exited = match self.instances[i].child.as_mut() {
                Some(child) => child.try_wait().ok().flatten().is_some(),
                None => true,
            };
            if exited {
                let dead = self.instances.remove(i);
                self.deps.launcher.allocator.release(dead.port);
                self.deps.metrics.record_instance_terminated(&self.spec.name);
                info!(worker = %self.spec.name, instance = %dead.id, "instance exited, port released");
            } else {
                i += 1;
            }
        }
    }

    async fn drain_and_terminate(&mut self, instance_ids: &[String]) {
        for instance in self.instances.iter_mut() {
            if instance_ids.contains(&instance.id) {
                instance.mark_draining();
            }
        }
        let grace = self.deps.shutdown_grace;
        for instance in self.instances.iter_mut() {
            if instance_ids.contains(&instance.id) {
                if let Some(child) = instance.child.as_mut() {
                    send_sigterm(child);
                    let _ = tokio::time::timeout(grace, child.wait()).await;
                    let _ = child.start_kill();
                }
                instance.mark_terminated();
            }
        }
        let mut i = 0;
        while i < self.instances.len() {
            if instance_ids.contains(&self.instances[i].id) {
                let dead = self.instances.remove(i);
                self.deps.launcher.allocator.release(dead.port);
            } else {
                i += 1;
            }
        }
    }

    async fn handle_scaling_tick(&mut self) {
        self.reap_dead_instances().await;

        if !self.is_enabled() {
            if !self.instances.is_empty() {
                let all_ids: Vec<String> = self.instances.iter().map(|i| i.id.clone()).collect();
                self.drain_and_terminate(&all_ids).await;
            }
            self.publish_snapshot().await;
            return;
        }

        let queue_depth = self.queue_depth_hint;
        if queue_depth > self.spec.scaling.queue_high_water
            && self.instances.len() < self.spec.scaling.max_instances
        {
            self.scale_up_one().await;
        }

        while self.instances.len() < self.spec.scaling.min_instances {
            self.scale_up_one().await;
        }

        if queue_depth == 0 && self.instances.len() > self.spec.scaling.min_instances {
            let idle_threshold = Duration::from_secs(self.spec.scaling.scale_down_idle_seconds);
            let min_instances = self.spec.scaling.min_instances;
            let healthy_count = self.healthy_count();
            if healthy_count > min_instances {
                let mut to_drain = Vec::new();
                let mut remaining_healthy = healthy_count;
                for instance in self.instances.iter() {
                    if remaining_healthy <= min_instances {
                        break;
                    }
                    if instance.state == InstanceState::Healthy
                        && instance.idle_for() > idle_threshold
                    {
                        to_drain.push(instance.id.clone());
                        remaining_healthy -= 1;
                    }
                }
                if !to_drain.is_empty() {
                    self.drain_and_terminate(&to_drain).await;
                }
            }
        }

        self.publish_snapshot().await;
    }

    async fn handle_reload(&mut self, new_spec: WorkerSpec) {
        match self.deps.builder.build(&new_spec).await {
            Err(e) => {
                warn!(worker = %new_spec.name, error = %e.message(), "build failed, keeping previous artifact");
                self.build_state = BuildState::Error(e.message().to_string());
                self.deps.metrics.record_build_error(&new_spec.name);
                self.publish_snapshot().await;
            }
            Ok(()) => {
                self.build_state = BuildState::Ok;
                self.spec = new_spec;
                if self.is_enabled() {
                    self.rolling_restart().await;
                } else {
                    info!(worker = %self.spec.name, "worker disabled by reload, draining to zero");
                    let all_ids: Vec<String> = self.instances.iter().map(|i| i.id.clone()).collect();
                    self.drain_and_terminate(&all_ids).await;
                    self.publish_snapshot().await;
                }
            }
        }
    }

    /// Pre-build-then-swap rolling restart: launch replacements, wait for
    /// every one to become healthy, only then drain the incumbents. This
    /// briefly doubles memory but guarantees zero downtime without
    /// session affinity.
    async fn rolling_restart(&mut self) {
        let target = self
            .instances
            .len()
            .max(self.spec.scaling.min_instances);
        let incumbent_ids: Vec<String> = self.instances.iter().map(|i| i.id.clone()).collect();

        let mut replacements = Vec::with_capacity(target);
        for i in 0..target {
            match self.deps.launcher.launch(&self.spec).await {
                Ok(instance) => {
                    self.deps.metrics.record_instance_started(&self.spec.name);
                    replacements.push(instance);
                }
                Err(e) => {
                    warn!(worker = %self.spec.name, error = %e, "rolling restart: replacement failed to start");
                }
            }
            if i + 1 < target {
                tokio::time::sleep(self.deps.startup_delay).await;
            }
        }

        self.instances.append(&mut replacements);
        self.drain_and_terminate(&incumbent_ids).await;
        self.restart_epoch += 1;
        self.deps.metrics.record_restart(&self.spec.name);
        self.publish_snapshot().await;
        info!(worker = %self.spec.name, epoch = self.restart_epoch, "rolling restart complete");
    }

    async fn handle_unhealthy(&mut self, instance_id: String) {
        if let Some(instance) = self.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.mark_draining();
        }
        self.drain_and_terminate(&[instance_id]).await;
        self.publish_snapshot().await;
    }

    async fn shutdown(&mut self) {
        let all_ids: Vec<String> = self.instances.iter().map(|i| i.id.clone()).collect();
        self.drain_and_terminate(&all_ids).await;
        self.publish_snapshot().await;
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &mut tokio::process::Child) {}

/// Spawns the dispatcher task for `spec` and returns a handle to it.
pub fn spawn(spec: WorkerSpec, deps: WorkerDeps) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
    let (queue_tx, mut queue_rx) = mpsc::channel::<DispatchToken>(DISPATCH_QUEUE_CAPACITY);
    let (command_tx, mut command_rx) = mpsc::channel::<DispatcherCommand>(COMMAND_QUEUE_CAPACITY);
    let snapshot = Arc::new(RwLock::new(WorkerSnapshot::default()));
    let handle = WorkerHandle {
        name: spec.name.clone(),
        url_prefix: spec.url_prefix.clone(),
        kind: spec.kind,
        queue_tx,
        command_tx,
        snapshot: snapshot.clone(),
    };

    let tick_interval = deps.scaling_tick_interval;
    let mut dispatcher = Dispatcher {
        spec,
        instances: Vec::new(),
        next_instance_index: 0,
        build_state: BuildState::Ok,
        restart_epoch: 0,
        deps,
        snapshot,
        queue_depth_hint: 0,
    };

    let join = tokio::spawn(async move {
        dispatcher.bring_up_minimum().await;
        dispatcher.publish_snapshot().await;

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending: VecDeque<DispatchToken> = VecDeque::new();

        loop {
            tokio::select! {
                maybe_token = queue_rx.recv() => {
                    match maybe_token {
                        Some(token) => {
                            let was_empty = dispatcher.instances.is_empty();
                            if was_empty && dispatcher.is_enabled() {
                                dispatcher.scale_up_one().await;
                            }
                            match dispatcher.pick_instance() {
                                Some(instance) => token.fulfill(Some(instance)),
                                None if was_empty => {
                                    // Emergency scale-up failed: refuse immediately
                                    // rather than making the caller wait out the
                                    // full dispatch deadline.
                                    token.fulfill(None);
                                }
                                None => pending.push_back(token),
                            }
                            while let Some(waiting) = pending.pop_front() {
                                match dispatcher.pick_instance() {
                                    Some(instance) => waiting.fulfill(Some(instance)),
                                    None => {
                                        pending.push_front(waiting);
                                        break;
                                    }
                                }
                            }
                            dispatcher.queue_depth_hint = queue_rx.len() + pending.len();
                        }
                        None => {
                            while let Some(token) = pending.pop_front() {
                                token.fulfill(None);
                            }
                            dispatcher.shutdown().await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    dispatcher.queue_depth_hint = queue_rx.len() + pending.len();
                    dispatcher.handle_scaling_tick().await;
                    while let Some(waiting) = pending.pop_front() {
                        match dispatcher.pick_instance() {
                            Some(instance) => waiting.fulfill(Some(instance)),
                            None => {
                                pending.push_front(waiting);
                                break;
                            }
                        }
                    }
                }
                maybe_command = command_rx.recv() => {
                    match maybe_command {
                        Some(DispatcherCommand::Reload(new_spec)) => {
                            dispatcher.handle_reload(new_spec).await;
                        }
                        Some(DispatcherCommand::InstanceUnhealthy(id)) => {
                            dispatcher.handle_unhealthy(id).await;
                        }
                        Some(DispatcherCommand::Shutdown) | None => {
                            while let Some(token) = pending.pop_front() {
                                token.fulfill(None);
                            }
                            while let Ok(token) = queue_rx.try_recv() {
                                token.fulfill(None);
                            }
                            dispatcher.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    });

    (handle, join)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A worker handle wired to channels nobody is servicing, useful only
    /// for exercising the registry's prefix-matching logic in isolation.
    pub fn fake_handle(name: &str, url_prefix: &str) -> WorkerHandle {
        let (queue_tx, _queue_rx) = mpsc::channel(1);
        let (command_tx, _command_rx) = mpsc::channel(1);
        WorkerHandle {
            name: name.to_string(),
            url_prefix: url_prefix.to_string(),
            kind: crate::config::WorkerKind::Native,
            queue_tx,
            command_tx,
            snapshot: Arc::new(RwLock::new(WorkerSnapshot::default())),
        }
    }
}
