//! Error taxonomy for the supervision and dispatch core.
//!
//! Each kind maps to a disposition documented in the design notes: some are
//! recovered locally (the caller logs and moves on), others propagate up to
//! the proxy handler and become an HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] figment::Error),
    #[error("invalid worker spec {name}: {reason}")]
    InvalidWorkerSpec { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("port pool exhausted")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Failed(String),
}

impl BuildError {
    pub fn message(&self) -> &str {
        match self {
            BuildError::Failed(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no ports available")]
    NoPort(#[from] PortAllocatorError),
    #[error("health probe timed out after {0:?}")]
    HealthTimeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("no instance became available")]
    NoInstance,
    #[error("timed out waiting for an instance")]
    Timeout,
    #[error("instance turned unhealthy between pick and proxy")]
    InstanceUnhealthy,
}
