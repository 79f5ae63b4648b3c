//! Server and per-worker configuration.
//!
//! Mirrors the teacher's `ConfigLoader` shape: a YAML file provider layered
//! with environment overrides via `figment`. `ServerConfig` is the
//! immutable root; worker specs are discovered separately by
//! [`crate::discovery`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Dev,
    Prod,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Dev
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
            idle_timeout_seconds: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub directory: PathBuf,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub startup_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub shutdown_grace_period_ms: u64,
    pub health_check_wait_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("workers"),
            port_range_start: 9000,
            port_range_end: 9999,
            startup_delay_ms: 100,
            restart_delay_ms: 250,
            shutdown_grace_period_ms: 5_000,
            health_check_wait_timeout_ms: 5_000,
            health_check_timeout_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileWatcherConfig {
    pub debounce_ms: u64,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: HttpConfig,
    pub workers: WorkersConfig,
    pub file_watcher: FileWatcherConfig,
    pub mode: Mode,
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.workers.shutdown_grace_period_ms)
    }

    pub fn health_check_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.health_check_wait_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.health_check_timeout_ms)
    }

    pub fn is_dev(&self) -> bool {
        self.mode == Mode::Dev
    }
}

/// Loads `ServerConfig` from a YAML file, overridden by `TQSERVER_`-prefixed
/// environment variables, the way the teacher's `ConfigLoader` layers a
/// `Yaml` provider under an `Env` provider.
pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    let figment = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed("TQSERVER_").split("__"));

    figment.extract().map_err(ConfigError::Parse)
}

/// Loads one worker's `config/worker.yaml`. Used both at startup discovery
/// and by the file watcher when the spec itself changes.
pub fn load_worker_spec(path: &Path) -> Result<WorkerSpec, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut spec: WorkerSpec =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::InvalidWorkerSpec {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
    // `<workers_dir>/<name>/config/worker.yaml` — the directory name is
    // the worker's identity; it is never read from the YAML body.
    if let Some(name) = path
        .parent()
        .and_then(Path::parent)
        .and_then(|p| p.file_name())
    {
        spec.name = name.to_string_lossy().into_owned();
    }
    spec.source_mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
    spec.validate()?;
    Ok(spec)
}

/// Discovers every `<workers_dir>/<name>/config/worker.yaml` and loads it,
/// skipping (with a log at the call site) any worker directory that isn't
/// enabled for `mode`.
pub fn discover_worker_specs(workers_dir: &Path) -> Result<Vec<WorkerSpec>, ConfigError> {
    let mut specs = Vec::new();
    let entries = match std::fs::read_dir(workers_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(specs),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let spec_path = path.join("config").join("worker.yaml");
        if spec_path.is_file() {
            specs.push(load_worker_spec(&spec_path)?);
        }
    }
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Native,
    Script,
    Cgi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnabledPolicy {
    Always,
    Never,
    DevOnly,
}

impl EnabledPolicy {
    pub fn is_enabled(&self, mode: Mode) -> bool {
        match self {
            EnabledPolicy::Always => true,
            EnabledPolicy::Never => false,
            EnabledPolicy::DevOnly => mode == Mode::Dev,
        }
    }
}

/// Accepts the documented `true` | `false` | `"development"` shapes for
/// the `enabled` key rather than forcing config authors into a flat enum.
impl Serialize for EnabledPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EnabledPolicy::Always => serializer.serialize_bool(true),
            EnabledPolicy::Never => serializer.serialize_bool(false),
            EnabledPolicy::DevOnly => serializer.serialize_str("development"),
        }
    }
}

impl<'de> Deserialize<'de> for EnabledPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bool(true) => Ok(EnabledPolicy::Always),
            Raw::Bool(false) => Ok(EnabledPolicy::Never),
            Raw::Str(s) if s == "development" => Ok(EnabledPolicy::DevOnly),
            Raw::Str(other) => Err(serde::de::Error::custom(format!(
                "invalid `enabled` value: expected true, false, or \"development\", got {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    #[serde(rename = "min_workers")]
    pub min_instances: usize,
    #[serde(rename = "max_workers")]
    pub max_instances: usize,
    #[serde(rename = "queue_threshold")]
    pub queue_high_water: usize,
    #[serde(rename = "scale_down_delay")]
    pub scale_down_idle_seconds: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 1,
            queue_high_water: 16,
            scale_down_idle_seconds: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    pub interpreter: Option<String>,
    pub entrypoint: Option<String>,
    pub memory_hint_mb: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "path")]
    pub url_prefix: String,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    #[serde(default = "default_enabled")]
    pub enabled: EnabledPolicy,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub runtime: RuntimeOptions,
    #[serde(default = "default_log_template")]
    pub log_template: String,
    #[serde(skip)]
    pub source_mtime: Option<std::time::SystemTime>,
}

fn default_enabled() -> EnabledPolicy {
    EnabledPolicy::Always
}

fn default_log_template() -> String {
    "{name}-{port}-{date}.log".to_string()
}

impl WorkerSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url_prefix.starts_with('/') {
            return Err(ConfigError::InvalidWorkerSpec {
                name: self.name.clone(),
                reason: "url_prefix must start with '/'".to_string(),
            });
        }
        if self.scaling.min_instances < 1 {
            return Err(ConfigError::InvalidWorkerSpec {
                name: self.name.clone(),
                reason: "min_instances must be >= 1".to_string(),
            });
        }
        if self.scaling.max_instances < self.scaling.min_instances {
            return Err(ConfigError::InvalidWorkerSpec {
                name: self.name.clone(),
                reason: "max_instances must be >= min_instances".to_string(),
            });
        }
        Ok(())
    }
}
