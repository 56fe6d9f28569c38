//! Runtime image lifecycle
//!
//! Every execution runs on a hardened image derived from a base image. The
//! derived image is identified by a hash of its `BuildContext`, so identical
//! contexts share one cached image. Built images are recorded in a JSON
//! registry that survives restarts.

use crate::config::ImageConfig;
use crate::error::{ImageError, RuntimeError};
use crate::runtime::{ContainerRuntime, ImageDetails};
use crate::scanner::{ImageScanner, ScanReport};
use crate::types::RuntimeKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs that determine a runtime image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub base_image: String,
    pub runtime: RuntimeKind,
    /// Sorted and deduplicated
    pub packages: Vec<String>,
    pub hardened: bool,
    pub minimal_install: bool,
    pub user_id: u32,
    pub group_id: u32,
}

impl BuildContext {
    pub fn new(base_image: &str, runtime: RuntimeKind, packages: &[String]) -> Self {
        let mut packages: Vec<String> = packages
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        packages.sort();
        packages.dedup();

        Self {
            base_image: base_image.to_string(),
            runtime,
            packages,
            hardened: true,
            minimal_install: true,
            user_id: 1000,
            group_id: 1000,
        }
    }

    /// First 12 hex chars of sha256(base|runtime|packages|hardened)
    pub fn tag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.base_image.as_bytes());
        hasher.update(b"|");
        hasher.update(self.runtime.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.packages.join(",").as_bytes());
        hasher.update(b"|");
        hasher.update(if self.hardened { b"1" } else { b"0" });
        hex::encode(hasher.finalize())[..12].to_string()
    }

    pub fn repository(&self) -> String {
        format!("sandbox-{}", self.runtime.as_str())
    }

    /// `sandbox-<runtime>:<tag>`
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.repository(), self.tag())
    }

    pub fn dockerfile(&self) -> String {
        generate_dockerfile(self)
    }
}

/// A registered runtime image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub tag: String,
    pub image_id: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub layers: Vec<String>,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vulnerabilities: Option<ScanReport>,
    #[serde(default)]
    pub security_score: Option<u32>,
}

impl ImageInfo {
    fn from_details(context: &BuildContext, details: ImageDetails) -> Self {
        Self {
            name: context.repository(),
            tag: context.tag(),
            image_id: details.id,
            size: details.size,
            created: details.created,
            layers: details.layers,
            base_image: context.base_image.clone(),
            scanned_at: None,
            vulnerabilities: None,
            security_score: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn vulnerability_count(&self) -> Option<u32> {
        self.vulnerabilities.map(|v| v.total())
    }

    fn record_scan(&mut self, report: ScanReport) {
        self.scanned_at = Some(Utc::now());
        self.security_score = Some(report.security_score());
        self.vulnerabilities = Some(report);
    }
}

/// Aggregate security view over the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSecuritySummary {
    pub total_images: usize,
    pub scanned_images: usize,
    pub average_security_score: Option<f64>,
    pub total_critical: u32,
    pub total_high: u32,
}

/// Builds, caches and scans runtime images
pub struct ImageManager {
    config: ImageConfig,
    runtime: Arc<dyn ContainerRuntime>,
    scanner: Arc<dyn ImageScanner>,
    registry_path: PathBuf,
    registry: Mutex<BTreeMap<String, ImageInfo>>,
    /// Serializes cache misses so one context is built once
    build_lock: tokio::sync::Mutex<()>,
    /// Held from snapshot to rename so registry writes land in order
    persist_lock: Mutex<()>,
}

impl ImageManager {
    /// Load the registry from `config.registry_path` (missing file = empty)
    pub fn new(
        config: ImageConfig,
        runtime: Arc<dyn ContainerRuntime>,
        scanner: Arc<dyn ImageScanner>,
    ) -> Result<Self, ImageError> {
        let registry_path = config.registry_path.clone();
        let registry = load_registry(&registry_path)?;
        info!(
            path = %registry_path.display(),
            images = registry.len(),
            scanner = scanner.name(),
            "Image registry loaded"
        );

        Ok(Self {
            config,
            runtime,
            scanner,
            registry_path,
            registry: Mutex::new(registry),
            build_lock: tokio::sync::Mutex::new(()),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn build_context(
        &self,
        runtime: RuntimeKind,
        base_image: Option<&str>,
        packages: &[String],
    ) -> BuildContext {
        let base = base_image.unwrap_or_else(|| self.config.base_image(runtime));
        let mut context = BuildContext::new(base, runtime, packages);
        context.user_id = self.config.user_id;
        context.group_id = self.config.group_id;
        context
    }

    /// Return the cached image for this context, building it on a miss
    pub async fn get_or_create_runtime_image(
        &self,
        runtime: RuntimeKind,
        base_image: Option<&str>,
        packages: &[String],
    ) -> Result<ImageInfo, ImageError> {
        validate_packages(packages)?;
        let context = self.build_context(runtime, base_image, packages);
        let name = context.image_name();

        if let Some(cached) = self.lookup(&name).await? {
            return Ok(cached);
        }

        let _guard = self.build_lock.lock().await;
        // Another caller may have built it while we waited
        if let Some(cached) = self.lookup(&name).await? {
            return Ok(cached);
        }

        if let Some(details) = self.runtime.inspect_image(&name).await? {
            info!(image = %name, "Adopting existing runtime image");
            let info = ImageInfo::from_details(&context, details);
            self.register(info.clone())?;
            return Ok(info);
        }

        info!(
            image = %name,
            base = %context.base_image,
            packages = context.packages.len(),
            "Building runtime image"
        );
        let details = self
            .runtime
            .build_image(&name, &context.dockerfile())
            .await?;
        let mut info = ImageInfo::from_details(&context, details);

        if self.scanner.is_available() {
            match self.scanner.scan(&name).await {
                Ok(report) => {
                    info.record_scan(report);
                    info!(
                        image = %name,
                        critical = report.critical,
                        high = report.high,
                        score = report.security_score(),
                        "Image scan complete"
                    );
                }
                Err(e) => warn!(image = %name, error = %e, "Image scan failed"),
            }
        }

        self.register(info.clone())?;
        Ok(info)
    }

    /// Registry hit that still exists in the daemon
    async fn lookup(&self, name: &str) -> Result<Option<ImageInfo>, ImageError> {
        let cached = self.registry.lock().get(name).cloned();
        let Some(info) = cached else {
            return Ok(None);
        };

        if self.runtime.inspect_image(name).await?.is_some() {
            debug!(image = %name, "Runtime image cache hit");
            return Ok(Some(info));
        }

        warn!(image = %name, "Registered image missing from daemon, dropping entry");
        self.registry.lock().remove(name);
        self.persist()?;
        Ok(None)
    }

    fn register(&self, info: ImageInfo) -> Result<(), ImageError> {
        self.registry.lock().insert(info.full_name(), info);
        self.persist()
    }

    fn persist(&self) -> Result<(), ImageError> {
        let _guard = self.persist_lock.lock();
        let json = serde_json::to_string_pretty(&*self.registry.lock())?;
        if let Some(parent) = self.registry_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.registry_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.registry_path)?;
        Ok(())
    }

    pub fn get_image(&self, full_name: &str) -> Option<ImageInfo> {
        self.registry.lock().get(full_name).cloned()
    }

    pub fn list_images(&self) -> Vec<ImageInfo> {
        self.registry.lock().values().cloned().collect()
    }

    /// Remove images older than `max_age_days` that no container references
    pub async fn cleanup_old_images(&self, max_age_days: u32) -> Result<usize, ImageError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let in_use = self.runtime.images_in_use().await?;

        let candidates: Vec<ImageInfo> = self
            .registry
            .lock()
            .values()
            .filter(|info| info.created < cutoff)
            .cloned()
            .collect();

        let mut removed = 0;
        for info in candidates {
            let name = info.full_name();
            if in_use.contains(&name) || in_use.contains(&info.image_id) {
                debug!(image = %name, "Skipping image still referenced by a container");
                continue;
            }
            match self.runtime.remove_image(&name).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    self.registry.lock().remove(&name);
                    removed += 1;
                    info!(image = %name, "Removed old runtime image");
                }
                Err(e) => warn!(image = %name, error = %e, "Failed to remove image"),
            }
        }

        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn security_summary(&self) -> ImageSecuritySummary {
        let registry = self.registry.lock();
        let mut summary = ImageSecuritySummary {
            total_images: registry.len(),
            ..Default::default()
        };

        let mut score_total = 0u64;
        for info in registry.values() {
            if let (Some(report), Some(score)) = (info.vulnerabilities, info.security_score) {
                summary.scanned_images += 1;
                summary.total_critical += report.critical;
                summary.total_high += report.high;
                score_total += u64::from(score);
            }
        }
        if summary.scanned_images > 0 {
            summary.average_security_score =
                Some(score_total as f64 / summary.scanned_images as f64);
        }
        summary
    }
}

/// Package specs end up in a Dockerfile `RUN` line, so only characters
/// used by pip / npm / apk / apt version specifiers are accepted
fn validate_packages(packages: &[String]) -> Result<(), ImageError> {
    for package in packages {
        let requirement = package.trim();
        let valid = !requirement.is_empty()
            && !requirement.starts_with('-')
            && requirement
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._-+@/:=<>!~^*,[]".contains(c));
        if !valid {
            return Err(ImageError::InvalidPackage(package.clone()));
        }
    }
    Ok(())
}

fn load_registry(path: &Path) -> Result<BTreeMap<String, ImageInfo>, ImageError> {
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Dockerfile generation
// =============================================================================

fn is_shell_less(base: &str) -> bool {
    base == "scratch" || base.contains("distroless")
}

fn is_alpine(base: &str) -> bool {
    base.contains("alpine")
}

/// Works on both Debian (shadow) and Alpine (busybox) bases
fn create_user(context: &BuildContext) -> String {
    let (uid, gid) = (context.user_id, context.group_id);
    format!(
        "RUN (groupadd -g {gid} sandbox && useradd -u {uid} -g {gid} -M -d /workspace -s /sbin/nologin sandbox) \\\n    \
         || (addgroup -g {gid} sandbox && adduser -D -H -u {uid} -G sandbox -h /workspace -s /sbin/nologin sandbox)\n"
    )
}

/// Single-quoted so version specifiers like `>=` reach the installer intact
fn quoted(packages: &[String]) -> String {
    packages
        .iter()
        .map(|p| format!("'{}'", p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn system_install(context: &BuildContext, packages: &[String]) -> Option<String> {
    if packages.is_empty() {
        return None;
    }
    let list = quoted(packages);
    if is_alpine(&context.base_image) {
        Some(format!("RUN apk add --no-cache {}\n", list))
    } else {
        let recommends = if context.minimal_install {
            " --no-install-recommends"
        } else {
            ""
        };
        Some(format!(
            "RUN apt-get update && apt-get install -y{} {} \\\n    && rm -rf /var/lib/apt/lists/*\n",
            recommends, list
        ))
    }
}

fn strip_artifacts(context: &BuildContext) -> String {
    let mut step = String::from(
        "RUN rm -rf /root/.cache /tmp/* /var/cache/apk/* /usr/share/doc /usr/share/man /usr/share/info \\\n    \
         && find / -xdev -depth \\( -name __pycache__ -o -name '*.pyc' -o -name test -o -name tests \\) \
         -path '*/site-packages/*' -exec rm -rf {} + 2>/dev/null || true\n",
    );
    if context.hardened {
        step.push_str("RUN find / -xdev -perm /6000 -type f -exec chmod a-s {} + 2>/dev/null || true\n");
    }
    step
}

pub(crate) fn generate_dockerfile(context: &BuildContext) -> String {
    let user = format!("{}:{}", context.user_id, context.group_id);

    if is_shell_less(&context.base_image) {
        return format!("FROM {}\nWORKDIR /workspace\nUSER {}\n", context.base_image, user);
    }

    let mut df = format!("FROM {}\n", context.base_image);
    let cmd = match context.runtime {
        RuntimeKind::Python => {
            df.push_str(
                "ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 \
                 PIP_NO_CACHE_DIR=1 PIP_DISABLE_PIP_VERSION_CHECK=1\n",
            );
            df.push_str(&create_user(context));
            if !context.packages.is_empty() {
                df.push_str(&format!(
                    "RUN pip install --no-cache-dir {}\n",
                    quoted(&context.packages)
                ));
            }
            r#"["python", "--version"]"#
        }
        RuntimeKind::Node => {
            df.push_str(
                "ENV NODE_ENV=production NPM_CONFIG_UPDATE_NOTIFIER=false \
                 NODE_PATH=/usr/local/lib/node_modules\n",
            );
            df.push_str(&create_user(context));
            if !context.packages.is_empty() {
                df.push_str(&format!(
                    "RUN npm install -g --no-audit --no-fund {} && npm cache clean --force\n",
                    quoted(&context.packages)
                ));
            }
            r#"["node", "--version"]"#
        }
        RuntimeKind::Shell => {
            df.push_str(&create_user(context));
            if let Some(step) = system_install(context, &context.packages) {
                df.push_str(&step);
            }
            r#"["sh", "-c", "true"]"#
        }
        RuntimeKind::Multi => {
            let mut packages: Vec<String> = ["python3", "python3-pip", "nodejs"]
                .iter()
                .map(|p| p.to_string())
                .collect();
            packages.extend(context.packages.iter().cloned());
            if let Some(step) = system_install(context, &packages) {
                df.push_str(&step);
            }
            df.push_str(&create_user(context));
            r#"["sh", "-c", "true"]"#
        }
    };

    df.push_str(&strip_artifacts(context));
    df.push_str("WORKDIR /workspace\n");
    df.push_str(&format!("USER {}\n", user));
    df.push_str(&format!("CMD {}\n", cmd));
    df
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image_details, RecordingRuntime};
    use async_trait::async_trait;

    struct FixedScanner(ScanReport);

    #[async_trait]
    impl ImageScanner for FixedScanner {
        fn name(&self) -> &str {
            "fixed"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn scan(&self, _image: &str) -> anyhow::Result<ScanReport> {
            Ok(self.0)
        }
    }

    struct FailingScanner;

    #[async_trait]
    impl ImageScanner for FailingScanner {
        fn name(&self) -> &str {
            "failing"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn scan(&self, _image: &str) -> anyhow::Result<ScanReport> {
            anyhow::bail!("scanner crashed")
        }
    }

    fn manager_with(
        dir: &Path,
        runtime: &RecordingRuntime,
        scanner: Arc<dyn ImageScanner>,
    ) -> ImageManager {
        let config = ImageConfig {
            registry_path: dir.join("registry.json"),
            ..Default::default()
        };
        ImageManager::new(config, Arc::new(runtime.clone()), scanner).unwrap()
    }

    fn manager(dir: &Path, runtime: &RecordingRuntime) -> ImageManager {
        manager_with(dir, runtime, Arc::new(crate::scanner::NoopScanner))
    }

    fn pkgs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_context_tag_is_deterministic() {
        let a = BuildContext::new("python:3.11-slim", RuntimeKind::Python, &pkgs(&["requests", "numpy"]));
        let b = BuildContext::new("python:3.11-slim", RuntimeKind::Python, &pkgs(&["numpy", "requests", "numpy"]));
        assert_eq!(a, b);
        assert_eq!(a.tag(), b.tag());
        assert_eq!(a.tag().len(), 12);
        assert!(a.image_name().starts_with("sandbox-python:"));

        let other_base = BuildContext::new("python:3.12-slim", RuntimeKind::Python, &pkgs(&["requests", "numpy"]));
        assert_ne!(a.tag(), other_base.tag());

        let mut soft = a.clone();
        soft.hardened = false;
        assert_ne!(a.tag(), soft.tag());

        let node = BuildContext::new("python:3.11-slim", RuntimeKind::Node, &pkgs(&["requests", "numpy"]));
        assert_ne!(a.tag(), node.tag());
    }

    #[test]
    fn test_python_dockerfile() {
        let ctx = BuildContext::new("python:3.11-slim", RuntimeKind::Python, &pkgs(&["requests"]));
        let df = ctx.dockerfile();
        assert!(df.starts_with("FROM python:3.11-slim\n"));
        assert!(df.contains("useradd -u 1000 -g 1000"));
        assert!(df.contains("pip install --no-cache-dir 'requests'"));
        assert!(df.contains("chmod a-s"));
        assert!(df.contains("USER 1000:1000"));
        assert!(df.trim_end().ends_with(r#"CMD ["python", "--version"]"#));
    }

    #[test]
    fn test_shell_dockerfile_uses_apk_on_alpine() {
        let ctx = BuildContext::new("alpine:3.19", RuntimeKind::Shell, &pkgs(&["jq"]));
        let df = ctx.dockerfile();
        assert!(df.contains("apk add --no-cache 'jq'"));
        assert!(!df.contains("apt-get"));
    }

    #[test]
    fn test_multi_dockerfile_installs_runtimes() {
        let ctx = BuildContext::new("ubuntu:22.04", RuntimeKind::Multi, &[]);
        let df = ctx.dockerfile();
        assert!(df.contains("apt-get install -y --no-install-recommends 'python3' 'python3-pip' 'nodejs'"));
    }

    #[test]
    fn test_node_dockerfile_installs_globally_and_exposes_them() {
        let ctx = BuildContext::new("node:18-alpine", RuntimeKind::Node, &pkgs(&["lodash@^4.17.0"]));
        let df = ctx.dockerfile();
        assert!(df.contains("NODE_PATH=/usr/local/lib/node_modules"));
        assert!(df.contains("npm install -g --no-audit --no-fund 'lodash@^4.17.0'"));
    }

    #[test]
    fn test_package_specs_are_validated() {
        assert!(validate_packages(&pkgs(&["requests==2.31.0", "numpy>=1.26,<2", "@types/node", "uvicorn[standard]"])).is_ok());
        for bad in ["requests; curl evil.sh", "a'b", "$(id)", "--index-url=http://x", "a b", ""] {
            assert!(
                matches!(validate_packages(&pkgs(&[bad])), Err(ImageError::InvalidPackage(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_package_never_reaches_the_builder() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager(dir.path(), &runtime);

        let err = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &pkgs(&["x && rm -rf /"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidPackage(_)));
        assert_eq!(runtime.builds(), 0);
    }

    #[test]
    fn test_concurrent_registry_writes_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager(dir.path(), &runtime);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let images = &images;
                scope.spawn(move || {
                    for i in 0..10 {
                        let context = BuildContext::new(
                            "alpine:3.19",
                            RuntimeKind::Shell,
                            &[format!("pkg-{}-{}", worker, i)],
                        );
                        let details = image_details(&context.tag(), chrono::Duration::zero());
                        images
                            .register(ImageInfo::from_details(&context, details))
                            .unwrap();
                    }
                });
            }
        });

        let on_disk = load_registry(&dir.path().join("registry.json")).unwrap();
        assert_eq!(on_disk.len(), 80);
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[test]
    fn test_shell_less_base_gets_minimal_dockerfile() {
        let ctx = BuildContext::new("gcr.io/distroless/python3", RuntimeKind::Python, &pkgs(&["requests"]));
        let df = ctx.dockerfile();
        assert_eq!(df, "FROM gcr.io/distroless/python3\nWORKDIR /workspace\nUSER 1000:1000\n");
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager(dir.path(), &runtime);

        let first = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &pkgs(&["requests"]))
            .await
            .unwrap();
        let second = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &pkgs(&["requests"]))
            .await
            .unwrap();

        assert_eq!(first.full_name(), second.full_name());
        assert_eq!(runtime.builds(), 1);

        let third = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &pkgs(&["flask"]))
            .await
            .unwrap();
        assert_ne!(first.tag, third.tag);
        assert_eq!(runtime.builds(), 2);
    }

    #[tokio::test]
    async fn test_registry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let name = {
            let images = manager(dir.path(), &runtime);
            images
                .get_or_create_runtime_image(RuntimeKind::Node, None, &[])
                .await
                .unwrap()
                .full_name()
        };

        let reloaded = manager(dir.path(), &runtime);
        assert!(reloaded.get_image(&name).is_some());
        reloaded
            .get_or_create_runtime_image(RuntimeKind::Node, None, &[])
            .await
            .unwrap();
        assert_eq!(runtime.builds(), 1);
    }

    #[tokio::test]
    async fn test_existing_daemon_image_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager(dir.path(), &runtime);
        let name = images
            .build_context(RuntimeKind::Shell, None, &[])
            .image_name();
        runtime.add_image(&name, image_details("sha256:adopted", chrono::Duration::days(1)));

        let info = images
            .get_or_create_runtime_image(RuntimeKind::Shell, None, &[])
            .await
            .unwrap();
        assert_eq!(info.image_id, "sha256:adopted");
        assert_eq!(runtime.builds(), 0);
        assert!(images.get_image(&name).is_some());
    }

    #[tokio::test]
    async fn test_build_failure_fails_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        runtime.fail_builds();
        let images = manager(dir.path(), &runtime);

        let err = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Runtime(RuntimeError::Build(_))));
        assert!(images.list_images().is_empty());
    }

    #[tokio::test]
    async fn test_scan_records_score() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let report = ScanReport {
            critical: 1,
            high: 2,
            medium: 3,
            low: 0,
        };
        let images = manager_with(dir.path(), &runtime, Arc::new(FixedScanner(report)));

        let info = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &[])
            .await
            .unwrap();
        assert_eq!(info.security_score, Some(80));
        assert_eq!(info.vulnerability_count(), Some(6));
        assert!(info.scanned_at.is_some());

        let summary = images.security_summary();
        assert_eq!(summary.total_images, 1);
        assert_eq!(summary.scanned_images, 1);
        assert_eq!(summary.total_critical, 1);
        assert_eq!(summary.total_high, 2);
        assert_eq!(summary.average_security_score, Some(80.0));
    }

    #[tokio::test]
    async fn test_scan_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager_with(dir.path(), &runtime, Arc::new(FailingScanner));

        let info = images
            .get_or_create_runtime_image(RuntimeKind::Python, None, &[])
            .await
            .unwrap();
        assert_eq!(info.security_score, None);
        assert_eq!(images.security_summary().scanned_images, 0);
    }

    #[tokio::test]
    async fn test_cleanup_skips_recent_and_in_use_images() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RecordingRuntime::default();
        let images = manager(dir.path(), &runtime);

        let old = images.build_context(RuntimeKind::Python, None, &[]).image_name();
        let busy = images.build_context(RuntimeKind::Node, None, &[]).image_name();
        let fresh = images.build_context(RuntimeKind::Shell, None, &[]).image_name();
        runtime.add_image(&old, image_details("sha256:old", chrono::Duration::days(60)));
        runtime.add_image(&busy, image_details("sha256:busy", chrono::Duration::days(60)));
        runtime.add_image(&fresh, image_details("sha256:fresh", chrono::Duration::days(1)));
        for runtime_kind in [RuntimeKind::Python, RuntimeKind::Node, RuntimeKind::Shell] {
            images
                .get_or_create_runtime_image(runtime_kind, None, &[])
                .await
                .unwrap();
        }
        runtime.mark_in_use("sha256:busy");

        let removed = images.cleanup_old_images(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(images.get_image(&old).is_none());
        assert!(images.get_image(&busy).is_some());
        assert!(images.get_image(&fresh).is_some());
        assert!(runtime.operations().contains(&format!("rmi:{}", old)));
        assert!(!runtime.has_image(&old));
    }

    #[test]
    fn test_corrupt_registry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("registry.json"), "{not json").unwrap();
        let runtime = RecordingRuntime::default();
        let config = ImageConfig {
            registry_path: dir.path().join("registry.json"),
            ..Default::default()
        };
        let result = ImageManager::new(
            config,
            Arc::new(runtime),
            Arc::new(crate::scanner::NoopScanner),
        );
        assert!(matches!(result, Err(ImageError::Corrupt(_))));
    }
}
