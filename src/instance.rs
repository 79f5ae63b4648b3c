//! A single child process owning one port, and its lifecycle state.

use std::time::{Duration, SystemTime};

use tokio::process::Child;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Healthy,
    Draining,
    Terminated,
}

/// Cheap-to-clone read-only view of an instance, handed to the proxy and
/// to metrics. Never used to mutate instance state — only the dispatcher
/// does that.
#[derive(Clone, Debug)]
pub struct InstanceHandle {
    pub id: String,
    pub port: u16,
    pub pid: u32,
}

pub struct WorkerInstance {
    pub id: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: SystemTime,
    pub last_request_at: SystemTime,
    pub state: InstanceState,
    pub child: Option<Child>,
}

impl WorkerInstance {
    pub fn new(worker_name: &str, port: u16, pid: u32, child: Child) -> Self {
        let now = SystemTime::now();
        let nanos = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            id: format!("{worker_name}-{port}-{nanos}"),
            port,
            pid,
            started_at: now,
            last_request_at: now,
            state: InstanceState::Starting,
            child: Some(child),
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            port: self.port,
            pid: self.pid,
        }
    }

    pub fn is_eligible_for_dispatch(&self) -> bool {
        self.state == InstanceState::Healthy
    }

    pub fn mark_healthy(&mut self) {
        self.state = InstanceState::Healthy;
    }

    pub fn mark_draining(&mut self) {
        if self.state != InstanceState::Terminated {
            self.state = InstanceState::Draining;
        }
    }

    pub fn mark_terminated(&mut self) {
        self.state = InstanceState::Terminated;
    }

    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_request_at)
            .unwrap_or_default()
    }

    pub fn touch(&mut self) {
        self.last_request_at = SystemTime::now();
    }
}
