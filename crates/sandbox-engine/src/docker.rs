//! Docker implementation of `ContainerRuntime`
//!
//! SECURITY: this is the only component that holds a Docker connection. The
//! launch configuration it receives has already been shaped by the policy
//! engine; this layer only translates it to the Docker API and forces
//! `privileged: false`.

use crate::error::RuntimeError;
use crate::policy::{INTERNAL_NETWORK, LIMITED_NETWORK};
use crate::runtime::{ContainerRuntime, ImageDetails, RawStats};
use crate::types::{ContainerLaunchConfig, ContainerOutput};
use async_trait::async_trait;
use bollard::container::{
    BlkioStatsEntry, Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Docker-backed container runtime
pub struct DockerRuntime {
    docker: Docker,
    /// Networks already verified to exist
    networks: Mutex<HashSet<String>>,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Docker(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Docker(format!("Failed to ping Docker: {}", e)))?;

        info!("Sandbox runtime connected to Docker daemon");

        Ok(Self {
            docker,
            networks: Mutex::new(HashSet::new()),
        })
    }

    /// Ensure a sandbox network exists
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        if self.networks.lock().contains(name) {
            return Ok(());
        }

        let networks = self.docker.list_networks::<String>(None).await?;
        let exists = networks
            .iter()
            .any(|n| n.name.as_deref().map(|n| n == name).unwrap_or(false));

        if !exists {
            use bollard::network::CreateNetworkOptions;

            let config = CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                // Internal networks have no route off the host
                internal: name == INTERNAL_NETWORK,
                ..Default::default()
            };

            self.docker.create_network(config).await?;
            info!(network = %name, "Created sandbox network");
        } else {
            debug!(network = %name, "Sandbox network already exists");
        }

        self.networks.lock().insert(name.to_string());
        Ok(())
    }

    fn host_config(config: &ContainerLaunchConfig) -> HostConfig {
        let binds: Vec<String> = config
            .binds
            .iter()
            .map(|b| {
                format!(
                    "{}:{}:{}",
                    b.source,
                    b.target,
                    if b.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let ulimits: Vec<ResourcesUlimits> = config
            .ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.clone()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        HostConfig {
            memory: config.memory_bytes,
            // No swap beyond the memory limit
            memory_swap: config.memory_bytes,
            nano_cpus: config.nano_cpus,
            pids_limit: config.pids_limit,
            readonly_rootfs: Some(config.read_only_root),
            network_mode: Some(config.network_mode.clone()),
            binds: Some(binds),
            tmpfs: Some(config.tmpfs.clone().into_iter().collect()),
            ulimits: Some(ulimits),
            // SECURITY: Non-privileged container settings
            privileged: Some(false),
            cap_drop: Some(config.cap_drop.clone()),
            cap_add: Some(config.cap_add.clone()),
            security_opt: Some(config.security_opt.clone()),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(
        &self,
        config: &ContainerLaunchConfig,
    ) -> Result<String, RuntimeError> {
        if config.network_mode == INTERNAL_NETWORK || config.network_mode == LIMITED_NETWORK {
            self.ensure_network(&config.network_mode).await?;
        }

        let container_name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("sandbox-{}", &uuid::Uuid::new_v4().to_string()[..8]));

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            hostname: Some("sandbox".to_string()),
            cmd: if config.command.is_empty() {
                None
            } else {
                Some(config.command.clone())
            },
            working_dir: config.working_dir.clone(),
            env: Some(env),
            user: config.user.clone(),
            labels: Some(config.labels.clone().into_iter().collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(config.network_mode == "none"),
            host_config: Some(Self::host_config(config)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await?;

        for warning in &response.warnings {
            warn!(container = %container_name, warning = %warning, "Docker create warning");
        }

        debug!(container_id = %response.id, name = %container_name, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container_id = %container_id, "Container started");
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));

        let mut exit_code = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => exit_code = Some(response.status_code),
                // Non-zero exits are reported as an error by the wait endpoint
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = Some(code)
                }
                Err(e) => return Err(e.into()),
            }
        }

        exit_code.ok_or_else(|| {
            RuntimeError::Docker(format!("No exit status for container {}", container_id))
        })
    }

    async fn container_logs(&self, container_id: &str) -> Result<ContainerOutput, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut output = ContainerOutput::default();
        let mut stream = self.docker.logs(container_id, Some(options));

        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::Console { message } => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }

        Ok(output)
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace: Duration,
    ) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self
            .docker
            .stop_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id = %container_id, "Container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already stopped
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id = %container_id, "Container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_stats(&self, container_id: &str) -> Result<Option<RawStats>, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(container_id, Some(options));

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }))
            | None => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
        };

        let (network_rx, network_tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(Some(RawStats {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_cpu: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            network_rx,
            network_tx,
            blkio_bytes: blkio_bytes(stats.blkio_stats.io_service_bytes_recursive.as_deref()),
            pids: stats.pids_stats.current.unwrap_or(0),
        }))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(info) => Ok(Some(ImageDetails {
                id: info.id.unwrap_or_default(),
                size: info.size.unwrap_or(0).max(0) as u64,
                created: info
                    .created
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(chrono::Utc::now),
                layers: info
                    .root_fs
                    .and_then(|fs| fs.layers)
                    .unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str, dockerfile: &str) -> Result<ImageDetails, RuntimeError> {
        // Build context holds only the Dockerfile
        let mut tar_buffer = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_buffer);
            let mut header = tar::Header::new_gnu();
            header.set_size(dockerfile.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "Dockerfile", dockerfile.as_bytes())
                .map_err(|e| RuntimeError::Build(format!("Failed to create build context: {}", e)))?;
            builder
                .finish()
                .map_err(|e| RuntimeError::Build(format!("Failed to finish build context: {}", e)))?;
        }

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        info!(tag = %tag, "Building runtime image");
        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(tar_buffer)));

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RuntimeError::Build(error));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim();
                        if !line.is_empty() {
                            debug!(tag = %tag, "{}", line);
                        }
                    }
                }
                Err(e) => return Err(RuntimeError::Build(e.to_string())),
            }
        }

        self.inspect_image(tag)
            .await?
            .ok_or_else(|| RuntimeError::Build(format!("Image {} missing after build", tag)))
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_image(reference, Some(options), None)
            .await
        {
            Ok(_) => {
                info!(image = %reference, "Image removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn images_in_use(&self) -> Result<HashSet<String>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::new(),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let mut images = HashSet::new();
        for container in containers {
            if let Some(image) = container.image {
                images.insert(image);
            }
            if let Some(id) = container.image_id {
                images.insert(id);
            }
        }
        Ok(images)
    }
}

/// Bytes read and written across block devices. cgroup v1 also reports a
/// `Total` row, which is skipped so nothing is counted twice.
fn blkio_bytes(entries: Option<&[BlkioStatsEntry]>) -> u64 {
    entries
        .unwrap_or_default()
        .iter()
        .filter(|e| e.op.eq_ignore_ascii_case("read") || e.op.eq_ignore_ascii_case("write"))
        .fold(0u64, |total, e| total.saturating_add(e.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BindMount, Ulimit};

    fn blkio(op: &str, value: u64) -> BlkioStatsEntry {
        BlkioStatsEntry {
            major: 8,
            minor: 0,
            op: op.to_string(),
            value,
        }
    }

    #[test]
    fn test_blkio_bytes_sums_reads_and_writes() {
        assert_eq!(blkio_bytes(None), 0);

        let v1 = vec![blkio("Read", 100), blkio("Write", 50), blkio("Sync", 7), blkio("Total", 150)];
        assert_eq!(blkio_bytes(Some(&v1)), 150);

        let v2 = vec![blkio("read", 10), blkio("write", 5), blkio("read", 1)];
        assert_eq!(blkio_bytes(Some(&v2)), 16);

        let huge = vec![blkio("read", u64::MAX), blkio("write", 1)];
        assert_eq!(blkio_bytes(Some(&huge)), u64::MAX);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_docker_connect() {
        let runtime = DockerRuntime::connect().await;
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_host_config_translation() {
        let mut config = ContainerLaunchConfig {
            image: "alpine:3.19".into(),
            memory_bytes: Some(1024),
            nano_cpus: Some(500_000_000),
            pids_limit: Some(32),
            read_only_root: true,
            network_mode: "none".into(),
            cap_drop: vec!["ALL".into()],
            security_opt: vec!["no-new-privileges:true".into()],
            ulimits: vec![Ulimit {
                name: "nofile".into(),
                soft: 64,
                hard: 64,
            }],
            binds: vec![BindMount {
                source: "/host/ws".into(),
                target: "/workspace".into(),
                read_only: true,
            }],
            ..Default::default()
        };
        config
            .tmpfs
            .insert("/tmp".into(), "rw,noexec,size=1024".into());

        let host = DockerRuntime::host_config(&config);
        assert_eq!(host.memory, Some(1024));
        assert_eq!(host.memory_swap, Some(1024));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.binds, Some(vec!["/host/ws:/workspace:ro".to_string()]));
        assert_eq!(
            host.tmpfs.as_ref().and_then(|t| t.get("/tmp")).map(String::as_str),
            Some("rw,noexec,size=1024")
        );
        let ulimits = host.ulimits.expect("ulimits");
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
        assert_eq!(ulimits[0].hard, Some(64));
    }
}
