//! Configuration types for the sandbox engine
//!
//! `EngineConfig` is serializable/deserializable with human-friendly duration
//! fields (plain seconds) so the same file can be shared between the engine
//! process and external tooling. Every field has a default, so an empty JSON
//! object is a valid configuration.

use crate::types::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Optional declarative policy file merged over the built-ins
    pub policy_file: Option<PathBuf>,
    /// Policy used when a request names none
    pub default_policy: String,
    /// Directory under which per-execution workspaces are created
    pub workspace_root: PathBuf,
    /// Grace period given to a container before it is killed
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Remove containers once their output has been collected
    pub remove_containers: bool,
    /// Cap on captured stdout / stderr, each
    pub max_output_bytes: usize,
    pub audit: AuditConfig,
    pub images: ImageConfig,
    pub resources: ResourceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy_file: None,
            default_policy: "standard".to_string(),
            workspace_root: std::env::temp_dir().join("sandbox-workspaces"),
            stop_grace: Duration::from_secs(5),
            remove_containers: true,
            max_output_bytes: 1024 * 1024,
            audit: AuditConfig::default(),
            images: ImageConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }
}

/// Audit log settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: PathBuf,
    /// Rotate once the current file exceeds this many bytes
    pub max_file_size: u64,
    pub retention_days: u32,
    pub integrity_enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/audit"),
            max_file_size: 100 * 1024 * 1024,
            retention_days: 90,
            integrity_enabled: true,
        }
    }
}

/// Image build / registry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// JSON registry of built images
    pub registry_path: PathBuf,
    pub python_base: String,
    pub node_base: String,
    pub shell_base: String,
    pub multi_base: String,
    /// Non-root user baked into runtime images
    pub user_id: u32,
    pub group_id: u32,
    pub max_age_days: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("./data/image_registry.json"),
            python_base: "python:3.11-slim".to_string(),
            node_base: "node:18-alpine".to_string(),
            shell_base: "alpine:3.19".to_string(),
            multi_base: "ubuntu:22.04".to_string(),
            user_id: 1000,
            group_id: 1000,
            max_age_days: 30,
        }
    }
}

impl ImageConfig {
    pub fn base_image(&self, runtime: RuntimeKind) -> &str {
        match runtime {
            RuntimeKind::Python => &self.python_base,
            RuntimeKind::Node => &self.node_base,
            RuntimeKind::Shell => &self.shell_base,
            RuntimeKind::Multi => &self.multi_base,
        }
    }
}

/// Resource monitoring and admission settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Container-count admission ceiling
    pub max_containers: usize,
    /// Host CPU admission ceiling (percent)
    pub max_cpu_percent: f64,
    /// Host memory admission ceiling (percent)
    pub max_memory_percent: f64,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub system_interval: Duration,
    /// Host load above which a critical "system" alert fires (percent)
    pub system_alert_percent: f64,
    pub history_limit: usize,
    pub alert_history_limit: usize,
    pub thresholds: AlertThresholds,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_containers: 50,
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
            sample_interval: Duration::from_secs(5),
            system_interval: Duration::from_secs(30),
            system_alert_percent: 90.0,
            history_limit: 1000,
            alert_history_limit: 1000,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Per-container alert thresholds (exclusive lower bounds, percent)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
        }
    }
}

/// Humantime serde helper
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.as_secs()).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs = Option::<u64>::deserialize(deserializer)?;
            Ok(secs.map(Duration::from_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.default_policy, "standard");
        assert_eq!(config.resources.sample_interval, Duration::from_secs(5));
        assert_eq!(config.resources.history_limit, 1000);
        assert!(config.audit.integrity_enabled);
    }

    #[test]
    fn test_empty_object_is_valid_config() {
        let config: EngineConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config.images.python_base, "python:3.11-slim");
        assert_eq!(config.resources.thresholds, AlertThresholds::default());
    }

    #[test]
    fn test_config_serializes_durations_as_seconds() {
        let mut config = EngineConfig::default();
        config.resources.sample_interval = Duration::from_secs(2);
        config.stop_grace = Duration::from_secs(10);

        let json = serde_json::to_value(&config).expect("serialize config");
        assert_eq!(json["resources"]["sample_interval"], 2);
        assert_eq!(json["stop_grace"], 10);

        let round_trip: EngineConfig = serde_json::from_value(json).expect("deserialize");
        assert_eq!(round_trip.resources.sample_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_humantime_deserialize_rejects_negative_values() {
        #[derive(Debug, Deserialize)]
        struct DurationWrapper {
            #[serde(with = "super::humantime_serde")]
            #[allow(dead_code)]
            value: Duration,
        }

        let err = serde_json::from_str::<DurationWrapper>(r#"{"value": -5}"#)
            .expect_err("negative durations rejected");
        assert!(err.to_string().contains("invalid value"));
    }

    #[test]
    fn test_load_reads_partial_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"default_policy": "hardened", "resources": {"max_containers": 3}}"#,
        )
        .expect("write config");

        let config = EngineConfig::load(&path).expect("load config");
        assert_eq!(config.default_policy, "hardened");
        assert_eq!(config.resources.max_containers, 3);
        assert_eq!(config.resources.max_cpu_percent, 80.0);
    }

    #[test]
    fn test_base_image_per_runtime() {
        let images = ImageConfig::default();
        assert_eq!(images.base_image(RuntimeKind::Node), "node:18-alpine");
        assert_eq!(images.base_image(RuntimeKind::Shell), "alpine:3.19");
    }
}
