//! Container runtime abstraction
//!
//! The engine never talks to Docker directly. Everything goes through
//! `ContainerRuntime`, implemented by `DockerRuntime` in production and by a
//! recording fake in tests.

use crate::error::RuntimeError;
use crate::types::{ContainerLaunchConfig, ContainerOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

/// Underlying container engine primitives
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its id
    async fn create_container(&self, config: &ContainerLaunchConfig)
        -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64, RuntimeError>;

    async fn container_logs(&self, container_id: &str) -> Result<ContainerOutput, RuntimeError>;

    /// Stop with a grace period; zero kills immediately
    async fn stop_container(&self, container_id: &str, grace: Duration)
        -> Result<(), RuntimeError>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    /// One stats sample; `None` once the container is gone
    async fn container_stats(&self, container_id: &str) -> Result<Option<RawStats>, RuntimeError>;

    /// `None` if the image does not exist locally
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError>;

    async fn build_image(&self, tag: &str, dockerfile: &str) -> Result<ImageDetails, RuntimeError>;

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Image names and ids referenced by any existing container
    async fn images_in_use(&self) -> Result<HashSet<String>, RuntimeError>;
}

/// Raw counters from one stats read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: u64,
    pub presystem_cpu: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    /// Block device bytes read plus written
    pub blkio_bytes: u64,
    pub pids: u64,
}

impl RawStats {
    /// `(cpuDelta / systemDelta) * numCPUs * 100`
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total) as f64;
        let system_delta = self.system_cpu.saturating_sub(self.presystem_cpu) as f64;
        if system_delta <= 0.0 || cpu_delta <= 0.0 {
            return 0.0;
        }
        let cpus = self.online_cpus.max(1) as f64;
        (cpu_delta / system_delta) * cpus * 100.0
    }

    /// `usage / limit * 100`
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit == 0 {
            return 0.0;
        }
        self.memory_usage as f64 / self.memory_limit as f64 * 100.0
    }
}

/// Image metadata reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetails {
    pub id: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub layers: Vec<String>,
}
