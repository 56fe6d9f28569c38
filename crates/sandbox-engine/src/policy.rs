//! Security policies for sandboxed executions
//!
//! A policy bundles resource limits, container security constraints and
//! allow/deny lists. The four built-in tiers always exist; a declarative JSON
//! file can add policies or override built-ins by name.
//!
//! SECURITY: `apply_policy_to_container_config` is the single place where a
//! policy becomes Docker launch parameters. It performs no I/O so every
//! produced configuration is unit-testable.

use crate::config::{humantime_serde, EngineConfig};
use crate::error::PolicyError;
use crate::types::{labels, ContainerLaunchConfig, Ulimit};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Docker network for `NetworkPolicy::Internal` (no egress)
pub const INTERNAL_NETWORK: &str = "sandbox-internal";
/// Docker network for `NetworkPolicy::Limited` (egress, isolated from other bridges)
pub const LIMITED_NETWORK: &str = "sandbox-limited";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Coarse policy tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Minimal,
    Standard,
    Hardened,
    Paranoid,
}

/// Network exposure granted to the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network interface besides loopback
    None,
    /// Internal bridge without egress
    Internal,
    /// Dedicated bridge with egress
    Limited,
    /// Default Docker bridge
    Full,
}

impl NetworkPolicy {
    pub fn network_mode(&self) -> &'static str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Internal => INTERNAL_NETWORK,
            NetworkPolicy::Limited => LIMITED_NETWORK,
            NetworkPolicy::Full => "bridge",
        }
    }
}

/// Resource limits applied to one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(rename = "memory", with = "byte_size")]
    pub memory_bytes: u64,
    /// 1.0 = one core
    #[serde(rename = "cpu")]
    pub cpu_cores: f64,
    #[serde(rename = "disk", with = "byte_size")]
    pub disk_bytes: u64,
    #[serde(rename = "processes")]
    pub max_processes: i64,
    #[serde(rename = "open_files")]
    pub max_open_files: i64,
    #[serde(rename = "execution_time", with = "humantime_serde")]
    pub execution_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * MIB,
            cpu_cores: 1.0,
            disk_bytes: GIB,
            max_processes: 128,
            max_open_files: 512,
            execution_timeout: Duration::from_secs(120),
        }
    }
}

/// Container security constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConstraints {
    pub read_only_root: bool,
    pub no_new_privileges: bool,
    pub drop_capabilities: Vec<String>,
    pub add_capabilities: Vec<String>,
    pub seccomp_profile: Option<String>,
    pub apparmor_profile: Option<String>,
    pub user_id: u32,
    pub group_id: u32,
}

impl Default for SecurityConstraints {
    fn default() -> Self {
        Self {
            read_only_root: true,
            no_new_privileges: true,
            drop_capabilities: vec!["ALL".to_string()],
            add_capabilities: Vec::new(),
            seccomp_profile: None,
            apparmor_profile: None,
            user_id: 1000,
            group_id: 1000,
        }
    }
}

/// Restrictions on writable mounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountRestrictions {
    /// Writable space is tmpfs only; host binds are forced read-only
    pub tmpfs_only: bool,
    #[serde(with = "byte_size")]
    pub max_size: u64,
    pub noexec: bool,
    pub nosuid: bool,
    pub nodev: bool,
}

impl Default for MountRestrictions {
    fn default() -> Self {
        Self {
            tmpfs_only: true,
            max_size: 100 * MIB,
            noexec: true,
            nosuid: true,
            nodev: true,
        }
    }
}

impl MountRestrictions {
    /// tmpfs option string, e.g. `rw,noexec,nosuid,nodev,size=104857600`
    pub fn tmpfs_options(&self, disk_cap: u64) -> String {
        let mut opts = vec!["rw".to_string()];
        if self.noexec {
            opts.push("noexec".to_string());
        }
        if self.nosuid {
            opts.push("nosuid".to_string());
        }
        if self.nodev {
            opts.push("nodev".to_string());
        }
        let size = if disk_cap > 0 {
            self.max_size.min(disk_cap)
        } else {
            self.max_size
        };
        opts.push(format!("size={}", size));
        opts.join(",")
    }
}

/// A named execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Filled from the policy file key
    #[serde(default, skip_serializing)]
    pub name: String,
    pub security_level: SecurityLevel,
    pub network_policy: NetworkPolicy,
    #[serde(rename = "resources", default)]
    pub resource_limits: ResourceLimits,
    #[serde(rename = "security", default)]
    pub security_constraints: SecurityConstraints,
    /// Empty = any image
    #[serde(default)]
    pub allowed_images: BTreeSet<String>,
    /// Substrings rejected in any command token
    #[serde(default)]
    pub blocked_commands: BTreeSet<String>,
    /// None = unrestricted, Some(empty) = no variables pass
    #[serde(default)]
    pub environment_whitelist: Option<BTreeSet<String>>,
    #[serde(default)]
    pub mount_restrictions: MountRestrictions,
    #[serde(default = "default_true")]
    pub audit_required: bool,
}

fn default_true() -> bool {
    true
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const BASE_BLOCKED: &[&str] = &[
    "rm -rf /",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    ":(){",
];

const STANDARD_BLOCKED: &[&str] = &[
    "sudo",
    "su -",
    "chmod 777",
    "chmod +s",
    "chown root",
    "mount ",
    "nsenter",
    "unshare",
    "docker",
    "kubectl",
    "iptables",
    "/etc/shadow",
    "/var/run/docker.sock",
];

const HARDENED_BLOCKED: &[&str] = &[
    "curl",
    "wget",
    "ssh",
    "scp",
    "telnet",
    "netcat",
    "ncat",
    "nc -",
    "/dev/tcp",
    "bash -i",
    "python -c",
    "perl -e",
];

impl ExecutionPolicy {
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            security_level: SecurityLevel::Minimal,
            network_policy: NetworkPolicy::Limited,
            resource_limits: ResourceLimits {
                memory_bytes: GIB,
                cpu_cores: 2.0,
                disk_bytes: 2 * GIB,
                max_processes: 256,
                max_open_files: 1024,
                execution_timeout: Duration::from_secs(300),
            },
            security_constraints: SecurityConstraints {
                read_only_root: false,
                drop_capabilities: vec![
                    "NET_ADMIN".to_string(),
                    "SYS_ADMIN".to_string(),
                    "SYS_MODULE".to_string(),
                    "SYS_PTRACE".to_string(),
                ],
                ..Default::default()
            },
            allowed_images: BTreeSet::new(),
            blocked_commands: set(BASE_BLOCKED),
            environment_whitelist: None,
            mount_restrictions: MountRestrictions {
                tmpfs_only: false,
                max_size: GIB,
                noexec: false,
                nosuid: true,
                nodev: true,
            },
            audit_required: true,
        }
    }

    pub fn standard() -> Self {
        let mut blocked = set(BASE_BLOCKED);
        blocked.extend(set(STANDARD_BLOCKED));
        Self {
            name: "standard".to_string(),
            security_level: SecurityLevel::Standard,
            network_policy: NetworkPolicy::None,
            resource_limits: ResourceLimits::default(),
            security_constraints: SecurityConstraints::default(),
            allowed_images: set(&[
                "python:3.11-slim",
                "python:3.12-slim",
                "node:18-alpine",
                "node:20-alpine",
                "alpine:3.19",
                "ubuntu:22.04",
            ]),
            blocked_commands: blocked,
            environment_whitelist: Some(set(&[
                "PATH",
                "HOME",
                "LANG",
                "LC_ALL",
                "TZ",
                "PYTHONPATH",
                "PYTHONUNBUFFERED",
                "PYTHONDONTWRITEBYTECODE",
                "NODE_PATH",
                "NODE_ENV",
            ])),
            mount_restrictions: MountRestrictions::default(),
            audit_required: true,
        }
    }

    pub fn hardened() -> Self {
        let mut blocked = set(BASE_BLOCKED);
        blocked.extend(set(STANDARD_BLOCKED));
        blocked.extend(set(HARDENED_BLOCKED));
        Self {
            name: "hardened".to_string(),
            security_level: SecurityLevel::Hardened,
            network_policy: NetworkPolicy::None,
            resource_limits: ResourceLimits {
                memory_bytes: 256 * MIB,
                cpu_cores: 0.5,
                disk_bytes: 512 * MIB,
                max_processes: 64,
                max_open_files: 256,
                execution_timeout: Duration::from_secs(60),
            },
            security_constraints: SecurityConstraints {
                user_id: 65534,
                group_id: 65534,
                ..Default::default()
            },
            allowed_images: set(&["python:3.11-slim", "node:18-alpine", "alpine:3.19"]),
            blocked_commands: blocked,
            environment_whitelist: Some(set(&["PATH", "HOME", "LANG", "PYTHONUNBUFFERED"])),
            mount_restrictions: MountRestrictions {
                max_size: 50 * MIB,
                ..Default::default()
            },
            audit_required: true,
        }
    }

    /// No explicit command blacklist: the restriction comes from the
    /// distroless-only image list and the empty environment whitelist.
    pub fn paranoid() -> Self {
        Self {
            name: "paranoid".to_string(),
            security_level: SecurityLevel::Paranoid,
            network_policy: NetworkPolicy::None,
            resource_limits: ResourceLimits {
                memory_bytes: 128 * MIB,
                cpu_cores: 0.25,
                disk_bytes: 256 * MIB,
                max_processes: 32,
                max_open_files: 128,
                execution_timeout: Duration::from_secs(30),
            },
            security_constraints: SecurityConstraints {
                user_id: 65534,
                group_id: 65534,
                ..Default::default()
            },
            allowed_images: set(&[
                "scratch",
                "gcr.io/distroless/static-debian12",
                "gcr.io/distroless/python3-debian12",
                "gcr.io/distroless/nodejs20-debian12",
            ]),
            blocked_commands: BTreeSet::new(),
            environment_whitelist: Some(BTreeSet::new()),
            mount_restrictions: MountRestrictions {
                max_size: 64 * MIB,
                ..Default::default()
            },
            audit_required: true,
        }
    }

    pub fn builtins() -> Vec<Self> {
        vec![
            Self::minimal(),
            Self::standard(),
            Self::hardened(),
            Self::paranoid(),
        ]
    }

    fn check(&self) -> Result<(), String> {
        let limits = &self.resource_limits;
        if limits.memory_bytes == 0 {
            return Err("memory limit must be positive".to_string());
        }
        if limits.memory_bytes > i64::MAX as u64 {
            return Err("memory limit out of range".to_string());
        }
        if !(limits.cpu_cores > 0.0) {
            return Err("cpu limit must be positive".to_string());
        }
        if limits.max_processes <= 0 || limits.max_open_files <= 0 {
            return Err("process and open-file limits must be positive".to_string());
        }
        if limits.execution_timeout.is_zero() {
            return Err("execution_time must be positive".to_string());
        }
        Ok(())
    }
}

/// Normalize an image reference so equivalent spellings compare equal.
///
/// `python` -> `library/python:latest`, `docker.io/library/python:3.11` ->
/// `library/python:3.11`. Digest references keep their digest and gain no tag.
pub fn normalize_image_reference(image: &str) -> String {
    let mut image = image.trim().to_lowercase();

    for prefix in ["docker.io/", "index.docker.io/", "registry-1.docker.io/"] {
        if let Some(rest) = image.strip_prefix(prefix) {
            image = rest.to_string();
            break;
        }
    }

    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name.to_string(), Some(digest.to_string())),
        None => (image, None),
    };

    let last_segment = name.rsplit('/').next().unwrap_or(&name);
    let has_tag = last_segment.contains(':');

    let normalized = if name.contains('/') {
        name
    } else {
        format!("library/{}", name)
    };

    match digest {
        Some(digest) => format!("{}@{}", normalized, digest),
        None if has_tag => normalized,
        None => format!("{}:latest", normalized),
    }
}

/// Registry of named policies
pub struct SecurityPolicyEngine {
    policies: RwLock<HashMap<String, Arc<ExecutionPolicy>>>,
    default_policy: String,
}

impl SecurityPolicyEngine {
    /// Engine with the built-in policies only
    pub fn new(default_policy: &str) -> Self {
        let policies = ExecutionPolicy::builtins()
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        Self {
            policies: RwLock::new(policies),
            default_policy: default_policy.to_string(),
        }
    }

    /// Policies named by an engine configuration. Fails if the default
    /// policy does not exist.
    pub fn from_config(config: &EngineConfig) -> Result<Self, PolicyError> {
        let engine = match &config.policy_file {
            Some(path) => Self::with_policy_file(&config.default_policy, path)?,
            None => Self::new(&config.default_policy),
        };
        engine.get_policy(None)?;
        Ok(engine)
    }

    /// Built-ins merged with the policies in `path`. A missing file falls
    /// back to built-ins; malformed entries fail the whole load.
    pub fn with_policy_file(default_policy: &str, path: &Path) -> Result<Self, PolicyError> {
        let engine = Self::new(default_policy);

        if !path.exists() {
            debug!(path = %path.display(), "Policy file not found, using built-in policies");
            return Ok(engine);
        }

        let invalid = |errors: Vec<String>| PolicyError::InvalidPolicyFile {
            path: path.to_path_buf(),
            errors,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| invalid(vec![e.to_string()]))?;
        let document: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| invalid(vec![e.to_string()]))?;
        let entries = document
            .as_object()
            .ok_or_else(|| invalid(vec!["top level must map policy names to policies".into()]))?;

        let mut errors = Vec::new();
        let mut loaded = Vec::new();
        for (name, value) in entries {
            match serde_json::from_value::<ExecutionPolicy>(value.clone()) {
                Ok(mut policy) => {
                    policy.name = name.clone();
                    match policy.check() {
                        Ok(()) => loaded.push(policy),
                        Err(reason) => errors.push(format!("{}: {}", name, reason)),
                    }
                }
                Err(e) => errors.push(format!("{}: {}", name, e)),
            }
        }

        if !errors.is_empty() {
            return Err(invalid(errors));
        }

        let count = loaded.len();
        for policy in loaded {
            engine.register_policy(policy);
        }
        info!(path = %path.display(), count, "Loaded custom security policies");
        Ok(engine)
    }

    /// Add or replace a policy by name
    pub fn register_policy(&self, policy: ExecutionPolicy) {
        let mut policies = self.policies.write();
        if policies.contains_key(&policy.name) {
            warn!(policy = %policy.name, "Overriding existing policy");
        }
        policies.insert(policy.name.clone(), Arc::new(policy));
    }

    pub fn default_policy_name(&self) -> &str {
        &self.default_policy
    }

    pub fn get_policy(&self, name: Option<&str>) -> Result<Arc<ExecutionPolicy>, PolicyError> {
        let name = name.unwrap_or(&self.default_policy);
        self.policies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))
    }

    pub fn list_policies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Full definitions keyed by name
    pub fn policy_definitions(&self) -> BTreeMap<String, ExecutionPolicy> {
        self.policies
            .read()
            .iter()
            .map(|(name, policy)| (name.clone(), ExecutionPolicy::clone(policy)))
            .collect()
    }

    /// Check an image and command vector against a policy
    pub fn validate_execution_request(
        &self,
        image: &str,
        command: &[String],
        policy_name: Option<&str>,
    ) -> Result<(), PolicyError> {
        let policy = self.get_policy(policy_name)?;

        if !policy.allowed_images.is_empty() {
            let normalized = normalize_image_reference(image);
            let allowed = policy
                .allowed_images
                .iter()
                .any(|a| normalize_image_reference(a) == normalized);
            if !allowed {
                warn!(
                    image = %image,
                    policy = %policy.name,
                    "SECURITY: Image not allowed by policy"
                );
                return Err(PolicyError::ImageNotAllowed {
                    image: image.to_string(),
                    policy: policy.name.clone(),
                });
            }
        }

        for element in command {
            if let Some(pattern) = policy
                .blocked_commands
                .iter()
                .find(|pattern| element.contains(pattern.as_str()))
            {
                warn!(
                    element = %element,
                    pattern = %pattern,
                    policy = %policy.name,
                    "SECURITY: Blocked command element"
                );
                return Err(PolicyError::BlockedCommand {
                    element: element.clone(),
                    pattern: pattern.clone(),
                    policy: policy.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Turn a policy into launch parameters on top of `base`
    pub fn apply_policy_to_container_config(
        &self,
        base: &ContainerLaunchConfig,
        policy_name: Option<&str>,
    ) -> Result<ContainerLaunchConfig, PolicyError> {
        let policy = self.get_policy(policy_name)?;
        Ok(apply_policy(base, &policy))
    }
}

/// Pure policy application
pub fn apply_policy(base: &ContainerLaunchConfig, policy: &ExecutionPolicy) -> ContainerLaunchConfig {
    let limits = &policy.resource_limits;
    let security = &policy.security_constraints;
    let mounts = &policy.mount_restrictions;
    let mut config = base.clone();

    config.memory_bytes = Some(limits.memory_bytes as i64);
    config.nano_cpus = Some((limits.cpu_cores * 1_000_000_000.0) as i64);
    config.pids_limit = Some(limits.max_processes);
    config.read_only_root = security.read_only_root;
    config.user = Some(format!("{}:{}", security.user_id, security.group_id));

    if security.no_new_privileges {
        config.security_opt.push("no-new-privileges:true".to_string());
    }
    if let Some(profile) = &security.seccomp_profile {
        config.security_opt.push(format!("seccomp={}", profile));
    }
    if let Some(profile) = &security.apparmor_profile {
        config.security_opt.push(format!("apparmor={}", profile));
    }
    config.security_opt.dedup();

    config.cap_drop = security.drop_capabilities.clone();
    config.cap_add = security.add_capabilities.clone();
    config.network_mode = policy.network_policy.network_mode().to_string();

    config.ulimits = vec![
        Ulimit {
            name: "nproc".to_string(),
            soft: limits.max_processes,
            hard: limits.max_processes,
        },
        Ulimit {
            name: "nofile".to_string(),
            soft: limits.max_open_files,
            hard: limits.max_open_files,
        },
    ];

    if let Some(whitelist) = &policy.environment_whitelist {
        config.env.retain(|key, _| whitelist.contains(key));
    }

    let tmpfs_options = mounts.tmpfs_options(limits.disk_bytes);
    let mut tmpfs: BTreeMap<String, String> = config
        .tmpfs
        .keys()
        .map(|target| (target.clone(), tmpfs_options.clone()))
        .collect();
    tmpfs
        .entry("/tmp".to_string())
        .or_insert_with(|| tmpfs_options.clone());
    config.tmpfs = tmpfs;

    if mounts.tmpfs_only {
        for bind in &mut config.binds {
            bind.read_only = true;
        }
    }

    config
        .labels
        .insert(labels::POLICY.to_string(), policy.name.clone());

    config
}

/// Byte sizes as integers or `512m` / `1g` style strings
mod byte_size {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => parse(&s).map_err(de::Error::custom),
        }
    }

    pub fn parse(s: &str) -> Result<u64, String> {
        let s = s.trim().to_ascii_lowercase();
        let s = s.strip_suffix('b').unwrap_or(&s);
        let (digits, multiplier) = match s.chars().last() {
            Some('k') => (&s[..s.len() - 1], 1024),
            Some('m') => (&s[..s.len() - 1], 1024 * 1024),
            Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            _ => (s, 1),
        };
        let n = digits
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid byte size: {}", s))?;
        n.checked_mul(multiplier)
            .filter(|bytes| *bytes <= i64::MAX as u64)
            .ok_or_else(|| format!("byte size out of range: {}", s))
    }
}
