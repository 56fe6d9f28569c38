//! Core types for the sandbox engine

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Language runtime an execution targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Node,
    Shell,
    Multi,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Node => "node",
            RuntimeKind::Shell => "shell",
            RuntimeKind::Multi => "multi",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(RuntimeKind::Python),
            "node" | "nodejs" | "javascript" => Ok(RuntimeKind::Node),
            "shell" | "sh" | "bash" => Ok(RuntimeKind::Shell),
            "multi" => Ok(RuntimeKind::Multi),
            other => Err(format!("unknown runtime kind: {}", other)),
        }
    }
}

/// A request to run code or a command inside a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Runtime image family to use
    pub runtime: RuntimeKind,

    /// Command vector run inside the container
    pub command: Vec<String>,

    /// Inline code (written to the runtime's entry file when `files` lacks it)
    pub code: Option<String>,

    /// Relative path -> contents, materialized under /workspace
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Environment overrides (filtered by the policy whitelist)
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Packages baked into the runtime image before the container starts
    #[serde(default)]
    pub packages: Vec<String>,

    /// Policy name (engine default when absent)
    pub policy: Option<String>,

    /// Base image override (runtime default when absent)
    pub image: Option<String>,

    /// Timeout override (policy default when absent)
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub timeout: Option<Duration>,

    /// Caller identity recorded in the audit trail
    pub user_id: String,

    /// Caller address recorded in the audit trail
    pub source_ip: Option<String>,

    /// Working directory inside the container
    pub working_dir: Option<String>,
}

impl ExecutionRequest {
    pub fn new(runtime: RuntimeKind, command: Vec<String>) -> Self {
        Self {
            runtime,
            command,
            code: None,
            files: BTreeMap::new(),
            environment: BTreeMap::new(),
            packages: Vec::new(),
            policy: None,
            image: None,
            timeout: None,
            user_id: "anonymous".to_string(),
            source_ip: None,
            working_dir: None,
        }
    }

    pub fn policy(mut self, name: &str) -> Self {
        self.policy = Some(name.to_string());
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn packages(mut self, packages: &[String]) -> Self {
        self.packages = packages.to_vec();
        self
    }
}

/// Result of one execution. Exactly one is produced per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub request_id: String,
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time in milliseconds
    pub execution_time_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
    pub security_events: Vec<String>,
    pub audit_event_ids: Vec<String>,
    pub container_id: Option<String>,
    pub timed_out: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Exit code reported when no container exit status exists
pub const EXIT_CODE_UNAVAILABLE: i64 = -1;

impl ExecutionResponse {
    pub fn failed(request_id: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: false,
            exit_code: EXIT_CODE_UNAVAILABLE,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            resource_usage: None,
            security_events: Vec::new(),
            audit_event_ids: Vec::new(),
            container_id: None,
            timed_out: false,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

/// Point-in-time resource sample for one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub disk_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub process_count: u64,
    /// Not every runtime reports descriptor counts
    #[serde(default)]
    pub open_files: Option<u64>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_percent: 0.0,
            disk_bytes: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            process_count: 0,
            open_files: None,
        }
    }
}

/// Process / file ulimit applied to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Host directory mounted into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Fully-resolved container launch parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerLaunchConfig {
    pub image: String,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,

    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub pids_limit: Option<i64>,
    pub read_only_root: bool,
    /// "uid:gid"
    pub user: Option<String>,
    pub security_opt: Vec<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub network_mode: String,
    pub ulimits: Vec<Ulimit>,
    /// mount point -> tmpfs options
    pub tmpfs: BTreeMap<String, String>,
    pub binds: Vec<BindMount>,
}

/// Captured container output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Snapshot of an in-flight execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecutionInfo {
    pub request_id: String,
    pub container_id: Option<String>,
    pub policy: String,
    pub runtime: RuntimeKind,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Standard labels applied to all sandbox containers
pub mod labels {
    pub const MANAGED: &str = "sandbox.managed";
    pub const REQUEST_ID: &str = "sandbox.request-id";
    pub const POLICY: &str = "sandbox.policy";
    pub const USER: &str = "sandbox.user";
    pub const RUNTIME: &str = "sandbox.runtime";
}
