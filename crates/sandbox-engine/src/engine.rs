//! Container execution engine
//!
//! Ties the policy engine, image manager, audit logger and resource manager
//! together behind one call, `execute`. Every request produces exactly one
//! `ExecutionResponse`; errors are folded into it with an `ErrorKind`.
//!
//! Per request the state moves through
//! `validated -> image resolved -> configured -> created -> running -> completed | failed`,
//! and the audit trail records policy applied, container created, container
//! started and finally container stopped or container failed.

use crate::audit::{AuditLogger, AuditSeverity, AuditStatistics};
use crate::config::EngineConfig;
use crate::docker::DockerRuntime;
use crate::error::{AuditError, EngineError, ErrorKind, RuntimeError};
use crate::image::{ImageManager, ImageSecuritySummary};
use crate::monitor::{
    AlertHandler, AlertSeverity, HostProbe, ResourceAlert, ResourceManager, SysinfoProbe,
    UsageSummary, SYSTEM_CONTAINER_ID,
};
use crate::policy::{apply_policy, SecurityPolicyEngine};
use crate::runtime::ContainerRuntime;
use crate::scanner::{ImageScanner, NoopScanner, TrivyScanner};
use crate::types::{
    labels, ActiveExecutionInfo, BindMount, ContainerLaunchConfig, ContainerOutput,
    ExecutionRequest, ExecutionResponse, ResourceUsage, RuntimeKind, EXIT_CODE_UNAVAILABLE,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const WORKSPACE_MOUNT: &str = "/workspace";

struct ActiveExecution {
    container_id: Option<String>,
    policy: String,
    runtime: RuntimeKind,
    user_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    exited: bool,
    security_events: Vec<String>,
}

#[derive(Default)]
struct ExecutionCounters {
    total: u64,
    successful: u64,
    failed: u64,
    rejected: u64,
}

/// What the container run produced
struct RunOutcome {
    container_id: String,
    exit_code: i64,
    output: ContainerOutput,
    usage: Option<ResourceUsage>,
    timed_out: bool,
    /// Set when the run was cut short
    failure: Option<String>,
}

enum WaitResult {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Bookkeeping released when a request ends
#[derive(Default)]
struct Released {
    container_id: Option<String>,
    security_events: Vec<String>,
}

type ActiveMap = Arc<RwLock<HashMap<String, ActiveExecution>>>;

/// Stops monitoring, stopping and removing a container without borrowing
/// the engine, so it can run on a detached task
#[derive(Clone)]
struct Teardown {
    runtime: Arc<dyn ContainerRuntime>,
    resources: Arc<ResourceManager>,
    remove_containers: bool,
}

impl Teardown {
    async fn run(self, container_id: String, exited: bool) {
        self.resources.unregister_container(&container_id).await;
        if !exited {
            force_stop(self.runtime.as_ref(), &container_id).await;
        }
        if self.remove_containers {
            match self.runtime.remove_container(&container_id, true).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    debug!(container_id = %container_id, "Removed container");
                }
                Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
            }
        }
    }
}

/// Owns a request's slot in the active map for the life of `execute`.
///
/// `release` frees the slot and waits for teardown on a spawned task, so a
/// caller that stops polling mid-release still gets its container removed.
/// Dropping the guard while the slot is held means `execute` itself was
/// abandoned: the failure is audited and teardown runs in the background.
struct ExecutionGuard {
    request_id: String,
    active: ActiveMap,
    teardown: Teardown,
    audit: Arc<AuditLogger>,
    audit_poisoned: Arc<AtomicBool>,
}

impl ExecutionGuard {
    async fn release(self) -> Released {
        let Some(entry) = self.active.write().remove(&self.request_id) else {
            return Released::default();
        };

        if let Some(container_id) = entry.container_id.clone() {
            let task = tokio::spawn(self.teardown.clone().run(container_id, entry.exited));
            if let Err(e) = task.await {
                warn!(request_id = %self.request_id, error = %e, "Container teardown task failed");
            }
        }

        Released {
            container_id: entry.container_id,
            security_events: entry.security_events,
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let Some(entry) = self.active.write().remove(&self.request_id) else {
            return;
        };
        warn!(request_id = %self.request_id, "Execution abandoned by caller, releasing in background");

        let Some(container_id) = entry.container_id else {
            return;
        };
        if !entry.exited {
            if let Err(e) = self.audit.log_container_failed(
                Some(container_id.as_str()),
                &entry.user_id,
                "Execution abandoned by caller",
                None,
            ) {
                poison(&self.audit_poisoned, &e);
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.teardown.clone().run(container_id, entry.exited));
            }
            Err(_) => {
                error!(container_id = %container_id, "No async runtime left to tear down abandoned container");
            }
        }
    }
}

/// Counts from one `cleanup_resources` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub images_removed: usize,
    pub audit_logs_removed: usize,
    pub monitors_removed: usize,
}

/// Operational view of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub uptime_secs: u64,
    pub active_executions: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub rejected_executions: u64,
    pub audit_poisoned: bool,
    pub policies: Vec<String>,
    pub resource_usage: UsageSummary,
    pub recent_alerts: Vec<ResourceAlert>,
    pub image_security: ImageSecuritySummary,
    pub audit: Option<AuditStatistics>,
}

/// Runs untrusted code in policy-shaped containers
pub struct ContainerExecutionEngine {
    config: EngineConfig,
    runtime: Arc<dyn ContainerRuntime>,
    policies: SecurityPolicyEngine,
    images: ImageManager,
    audit: Arc<AuditLogger>,
    resources: Arc<ResourceManager>,
    request_counter: Mutex<u64>,
    /// Admitted requests, including those still resolving their image.
    /// Its size is what `max_containers` bounds.
    active: ActiveMap,
    counters: Mutex<ExecutionCounters>,
    audit_poisoned: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

fn poison(flag: &AtomicBool, e: &AuditError) {
    if !flag.swap(true, Ordering::SeqCst) {
        error!(error = %e, "AUDIT FAILURE: refusing further executions until restart");
    }
}

impl ContainerExecutionEngine {
    /// Assemble an engine from its parts. Must be called inside a tokio
    /// runtime; the host monitoring loop starts immediately.
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        scanner: Arc<dyn ImageScanner>,
        probe: Arc<dyn HostProbe>,
    ) -> anyhow::Result<Self> {
        let policies = SecurityPolicyEngine::from_config(&config)?;

        let images = ImageManager::new(config.images.clone(), runtime.clone(), scanner)?;
        let audit = Arc::new(AuditLogger::new(config.audit.clone())?);
        let resources = Arc::new(ResourceManager::new(
            config.resources.clone(),
            runtime.clone(),
            probe,
        ));

        let active = Arc::new(RwLock::new(HashMap::new()));
        let audit_poisoned = Arc::new(AtomicBool::new(false));
        resources.add_alert_handler(alert_to_audit(
            audit.clone(),
            active.clone(),
            audit_poisoned.clone(),
        ));
        resources.start();

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            default_policy = %config.default_policy,
            policies = policies.list_policies().len(),
            "Container execution engine ready"
        );

        Ok(Self {
            config,
            runtime,
            policies,
            images,
            audit,
            resources,
            request_counter: Mutex::new(0),
            active,
            counters: Mutex::new(ExecutionCounters::default()),
            audit_poisoned,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    /// Engine on the local Docker daemon, with Trivy scanning when installed
    pub async fn with_docker(config: EngineConfig) -> anyhow::Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
        let scanner: Arc<dyn ImageScanner> = match TrivyScanner::detect() {
            Some(trivy) => Arc::new(trivy),
            None => {
                info!("No vulnerability scanner found, image scanning disabled");
                Arc::new(NoopScanner)
            }
        };
        Self::new(config, runtime, scanner, Arc::new(SysinfoProbe::new()))
    }

    pub fn policies(&self) -> &SecurityPolicyEngine {
        &self.policies
    }

    pub fn images(&self) -> &ImageManager {
        &self.images
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    fn teardown(&self) -> Teardown {
        Teardown {
            runtime: self.runtime.clone(),
            resources: self.resources.clone(),
            remove_containers: self.config.remove_containers,
        }
    }

    fn guard(&self, request_id: &str) -> ExecutionGuard {
        ExecutionGuard {
            request_id: request_id.to_string(),
            active: self.active.clone(),
            teardown: self.teardown(),
            audit: self.audit.clone(),
            audit_poisoned: self.audit_poisoned.clone(),
        }
    }

    /// Claim an execution slot. The shutdown flag is read under the same
    /// lock `shutdown` sets it under, so nothing is admitted once the drain
    /// has started.
    fn reserve(&self, request_id: &str, request: &ExecutionRequest) -> Result<(), EngineError> {
        let mut active = self.active.write();
        if *self.shutdown_tx.borrow() {
            return Err(shutting_down());
        }
        let max = self.resources.config().max_containers;
        if active.len() >= max {
            warn!(active = active.len(), max, "Container ceiling reached");
            return Err(EngineError::Capacity(format!(
                "{} of {} execution slots in use",
                active.len(),
                max
            )));
        }
        active.insert(
            request_id.to_string(),
            ActiveExecution {
                container_id: None,
                policy: request
                    .policy
                    .clone()
                    .unwrap_or_else(|| self.policies.default_policy_name().to_string()),
                runtime: request.runtime,
                user_id: request.user_id.clone(),
                started_at: Utc::now(),
                started: Instant::now(),
                exited: false,
                security_events: Vec::new(),
            },
        );
        Ok(())
    }

    fn next_request_id(&self) -> String {
        let mut counter = self.request_counter.lock();
        *counter += 1;
        format!("exec-{}-{:06}", Utc::now().format("%Y%m%d%H%M%S"), *counter)
    }

    /// Record an audit event, latching the engine on failure
    fn audited(
        &self,
        result: Result<String, AuditError>,
        trail: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        match result {
            Ok(id) => {
                trail.push(id);
                Ok(())
            }
            Err(e) => {
                poison(&self.audit_poisoned, &e);
                Err(EngineError::Audit(e))
            }
        }
    }

    /// Run one request to completion. Never fails; errors become a failed response.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        let request_id = self.next_request_id();
        let started = Instant::now();
        let mut trail = Vec::new();

        info!(
            request_id = %request_id,
            runtime = %request.runtime,
            user = %request.user_id,
            policy = request.policy.as_deref().unwrap_or(self.policies.default_policy_name()),
            "Execution requested"
        );

        let guard = self.guard(&request_id);
        let result = self.run_request(&request_id, &request, &mut trail).await;
        let released = guard.release().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(outcome) => {
                let success = outcome.failure.is_none() && outcome.exit_code == 0;
                ExecutionResponse {
                    request_id: request_id.clone(),
                    success,
                    exit_code: outcome.exit_code,
                    stdout: truncate_output(outcome.output.stdout, self.config.max_output_bytes),
                    stderr: truncate_output(outcome.output.stderr, self.config.max_output_bytes),
                    execution_time_ms: elapsed_ms,
                    resource_usage: outcome.usage,
                    security_events: released.security_events,
                    audit_event_ids: trail,
                    container_id: Some(outcome.container_id),
                    timed_out: outcome.timed_out,
                    error_kind: outcome
                        .failure
                        .as_ref()
                        .map(|_| ErrorKind::Execution),
                    error_message: outcome.failure,
                }
            }
            Err(err) => {
                self.record_failure(
                    &request_id,
                    &request,
                    &err,
                    released.container_id.as_deref(),
                    &mut trail,
                );
                let mut response = ExecutionResponse::failed(&request_id, err.kind(), err.to_string());
                response.execution_time_ms = elapsed_ms;
                response.container_id = released.container_id;
                response.security_events = released.security_events;
                response.audit_event_ids = trail;
                response
            }
        };

        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            match response.error_kind {
                None if response.success => counters.successful += 1,
                Some(ErrorKind::Policy) | Some(ErrorKind::Capacity) => {
                    counters.rejected += 1
                }
                _ => counters.failed += 1,
            }
        }

        info!(
            request_id = %request_id,
            success = response.success,
            exit_code = response.exit_code,
            elapsed_ms,
            "Execution finished"
        );
        response
    }

    /// Audit trail for a request that ended in an error
    fn record_failure(
        &self,
        request_id: &str,
        request: &ExecutionRequest,
        err: &EngineError,
        container_id: Option<&str>,
        trail: &mut Vec<String>,
    ) {
        match err {
            EngineError::Policy(e) => {
                warn!(request_id = %request_id, error = %e, "Execution rejected by policy");
                let _ = self.audited(
                    self.audit.log_access_denied(
                        &request.user_id,
                        &format!("execution {}", request_id),
                        &e.to_string(),
                        request.source_ip.as_deref(),
                    ),
                    trail,
                );
            }
            EngineError::Capacity(reason) => {
                warn!(request_id = %request_id, reason = %reason, "Execution rejected at capacity");
            }
            EngineError::Build(reason) | EngineError::Execution(reason) => {
                warn!(request_id = %request_id, error = %reason, "Execution failed");
                let _ = self.audited(
                    self.audit
                        .log_container_failed(container_id, &request.user_id, reason, None),
                    trail,
                );
            }
            EngineError::Audit(e) => {
                error!(request_id = %request_id, error = %e, "Execution aborted, audit trail unavailable");
            }
        }
    }

    async fn run_request(
        &self,
        request_id: &str,
        request: &ExecutionRequest,
        trail: &mut Vec<String>,
    ) -> Result<RunOutcome, EngineError> {
        if self.audit_poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::Audit(AuditError::Poisoned));
        }
        if *self.shutdown_tx.borrow() {
            return Err(shutting_down());
        }
        if !self.resources.check_host_capacity() {
            return Err(EngineError::Capacity(
                "host load above admission ceiling".to_string(),
            ));
        }
        self.reserve(request_id, request)?;

        // validated
        let policy = self.policies.get_policy(request.policy.as_deref())?;
        let base_image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.images.base_image(request.runtime).to_string());
        self.policies
            .validate_execution_request(&base_image, &request.command, Some(policy.name.as_str()))?;

        // image resolved
        let image = self
            .images
            .get_or_create_runtime_image(
                request.runtime,
                Some(base_image.as_str()),
                &request.packages,
            )
            .await?;
        self.audited(
            self.audit.log_policy_applied(
                request_id,
                &request.user_id,
                &policy.name,
                &base_image,
                request.source_ip.as_deref(),
            ),
            trail,
        )?;

        // configured
        let workspace = self.prepare_workspace(request_id, request).await?;
        let mut base = ContainerLaunchConfig {
            image: image.full_name(),
            name: Some(format!("sandbox-{}", request_id)),
            command: request.command.clone(),
            working_dir: Some(
                request
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| WORKSPACE_MOUNT.to_string()),
            ),
            env: request.environment.clone(),
            binds: vec![BindMount {
                source: workspace.path().to_string_lossy().into_owned(),
                target: WORKSPACE_MOUNT.to_string(),
                read_only: true,
            }],
            ..Default::default()
        };
        base.labels.insert(labels::MANAGED.to_string(), "true".to_string());
        base.labels.insert(labels::REQUEST_ID.to_string(), request_id.to_string());
        base.labels.insert(labels::USER.to_string(), request.user_id.clone());
        base.labels.insert(labels::RUNTIME.to_string(), request.runtime.to_string());
        let launch = apply_policy(&base, &policy);

        // Image resolution can outlast the shutdown grace period
        if *self.shutdown_tx.borrow() {
            return Err(shutting_down());
        }

        // created
        let container_id = self.runtime.create_container(&launch).await?;
        let tracked = match self.active.write().get_mut(request_id) {
            Some(entry) => {
                entry.container_id = Some(container_id.clone());
                true
            }
            None => false,
        };
        if !tracked {
            // Slot already reclaimed by shutdown
            self.teardown().run(container_id, false).await;
            return Err(shutting_down());
        }
        self.audited(
            self.audit
                .log_container_created(&container_id, &request.user_id, &launch.image, &policy.name),
            trail,
        )?;

        // running
        self.runtime.start_container(&container_id).await?;
        self.audited(
            self.audit.log_container_started(&container_id, &request.user_id),
            trail,
        )?;
        self.resources.register_container(&container_id);

        let timeout = request
            .timeout
            .unwrap_or(policy.resource_limits.execution_timeout);
        let run_started = Instant::now();
        let waited = tokio::select! {
            code = self.runtime.wait_container(&container_id) => WaitResult::Exited(code?),
            _ = tokio::time::sleep(timeout) => WaitResult::TimedOut,
            _ = shutdown_signalled(self.shutdown_tx.subscribe()) => WaitResult::Cancelled,
        };

        let (exit_code, timed_out, failure) = match waited {
            // A stop issued by shutdown can surface as a normal exit
            WaitResult::Exited(code) if *self.shutdown_tx.borrow() => (
                code,
                false,
                Some("Execution cancelled by engine shutdown".to_string()),
            ),
            WaitResult::Exited(code) => (code, false, None),
            WaitResult::TimedOut => {
                warn!(
                    request_id = %request_id,
                    container_id = %container_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "Execution timed out, killing container"
                );
                self.force_stop(&container_id).await;
                (
                    EXIT_CODE_UNAVAILABLE,
                    true,
                    Some(format!("Execution timed out after {:.1}s", timeout.as_secs_f64())),
                )
            }
            WaitResult::Cancelled => {
                self.force_stop(&container_id).await;
                (
                    EXIT_CODE_UNAVAILABLE,
                    false,
                    Some("Execution cancelled by engine shutdown".to_string()),
                )
            }
        };
        if let Some(entry) = self.active.write().get_mut(request_id) {
            entry.exited = true;
        }

        // completed | failed
        let output = match self.runtime.container_logs(&container_id).await {
            Ok(output) => output,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to collect container logs");
                ContainerOutput::default()
            }
        };
        let usage = self.resources.unregister_container(&container_id).await;
        let run_ms = run_started.elapsed().as_millis() as u64;

        match &failure {
            None => self.audited(
                self.audit.log_container_stopped(
                    &container_id,
                    &request.user_id,
                    exit_code,
                    run_ms,
                    usage.clone(),
                ),
                trail,
            )?,
            Some(reason) => self.audited(
                self.audit
                    .log_container_failed(Some(container_id.as_str()), &request.user_id, reason, usage.clone()),
                trail,
            )?,
        }

        tokio::task::spawn_blocking(move || drop(workspace));
        Ok(RunOutcome {
            container_id,
            exit_code,
            output,
            usage,
            timed_out,
            failure,
        })
    }

    async fn force_stop(&self, container_id: &str) {
        force_stop(self.runtime.as_ref(), container_id).await;
    }

    /// Host directory holding the request's code and files, mounted read-only.
    /// File I/O runs on the blocking pool.
    async fn prepare_workspace(
        &self,
        request_id: &str,
        request: &ExecutionRequest,
    ) -> Result<tempfile::TempDir, EngineError> {
        let mut files: Vec<(String, String)> = request
            .files
            .iter()
            .map(|(path, contents)| (path.clone(), contents.clone()))
            .collect();
        if let Some(code) = &request.code {
            let name = default_code_file(request.runtime);
            if !request.files.contains_key(name) {
                files.push((name.to_string(), code.clone()));
            }
        }

        let root = self.config.workspace_root.clone();
        let prefix = format!("{}-", request_id);
        let dir = tokio::task::spawn_blocking(move || write_workspace(&root, &prefix, &files))
            .await
            .map_err(|e| RuntimeError::Workspace(e.to_string()))??;

        debug!(request_id = %request_id, path = %dir.path().display(), "Workspace prepared");
        Ok(dir)
    }

    // =========================================================================
    // Convenience entry points
    // =========================================================================

    /// Run a Python snippet. `requirements` are installed into the runtime
    /// image at build time, so the container itself needs no network.
    pub async fn execute_python_code(
        &self,
        code: &str,
        requirements: &[String],
        policy: Option<&str>,
        user_id: &str,
    ) -> ExecutionResponse {
        let command = vec!["python".to_string(), format!("{}/main.py", WORKSPACE_MOUNT)];
        let mut request = ExecutionRequest::new(RuntimeKind::Python, command)
            .user(user_id)
            .packages(requirements)
            .file("main.py", code);
        if let Some(policy) = policy {
            request = request.policy(policy);
        }
        self.execute(request).await
    }

    /// Run a Node.js snippet with `packages` installed globally in the image
    pub async fn execute_node_code(
        &self,
        code: &str,
        packages: &[String],
        policy: Option<&str>,
        user_id: &str,
    ) -> ExecutionResponse {
        let command = vec!["node".to_string(), format!("{}/main.js", WORKSPACE_MOUNT)];
        let mut request = ExecutionRequest::new(RuntimeKind::Node, command)
            .user(user_id)
            .packages(packages)
            .file("main.js", code);
        if let Some(policy) = policy {
            request = request.policy(policy);
        }
        self.execute(request).await
    }

    pub async fn execute_shell_script(
        &self,
        script: &str,
        policy: Option<&str>,
        user_id: &str,
    ) -> ExecutionResponse {
        let command = vec!["sh".to_string(), format!("{}/script.sh", WORKSPACE_MOUNT)];
        let mut request = ExecutionRequest::new(RuntimeKind::Shell, command)
            .user(user_id)
            .file("script.sh", script);
        if let Some(policy) = policy {
            request = request.policy(policy);
        }
        self.execute(request).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn list_active_executions(&self) -> Vec<ActiveExecutionInfo> {
        let mut active: Vec<ActiveExecutionInfo> = self
            .active
            .read()
            .iter()
            .map(|(request_id, entry)| ActiveExecutionInfo {
                request_id: request_id.clone(),
                container_id: entry.container_id.clone(),
                policy: entry.policy.clone(),
                runtime: entry.runtime,
                user_id: entry.user_id.clone(),
                started_at: entry.started_at,
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn get_execution_statistics(&self) -> ExecutionStatistics {
        let (total, successful, failed, rejected) = {
            let c = self.counters.lock();
            (c.total, c.successful, c.failed, c.rejected)
        };
        let audit = match self.audit.statistics() {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to read audit statistics");
                None
            }
        };

        ExecutionStatistics {
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_executions: self.active.read().len(),
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            rejected_executions: rejected,
            audit_poisoned: self.audit_poisoned.load(Ordering::SeqCst),
            policies: self.policies.list_policies(),
            resource_usage: self.resources.get_usage_summary(),
            recent_alerts: self.resources.recent_alerts(10),
            image_security: self.images.security_summary(),
            audit,
        }
    }

    /// Old images, expired audit logs and dead monitors
    pub async fn cleanup_resources(&self) -> CleanupReport {
        let images_removed = match self
            .images
            .cleanup_old_images(self.config.images.max_age_days)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Image cleanup failed");
                0
            }
        };
        let audit_logs_removed = match self
            .audit
            .cleanup_old_logs(self.config.audit.retention_days)
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Audit log cleanup failed");
                0
            }
        };
        let monitors_removed = self.resources.cleanup_inactive_monitors().await;

        let report = CleanupReport {
            images_removed,
            audit_logs_removed,
            monitors_removed,
        };
        info!(?report, "Cleanup complete");
        report
    }

    /// Force-stop every active container, wait for their requests to
    /// finish, stop monitoring and run cleanup
    pub async fn shutdown(&self) -> CleanupReport {
        {
            let active = self.active.write();
            info!(active = active.len(), "Shutting down execution engine");
            self.shutdown_tx.send_replace(true);
        }

        let containers: Vec<String> = self
            .active
            .read()
            .values()
            .filter_map(|e| e.container_id.clone())
            .collect();
        futures::future::join_all(containers.iter().map(|id| self.force_stop(id))).await;

        // Waits on every reservation, including requests still resolving images
        let deadline = Instant::now() + self.config.stop_grace;
        while !self.active.read().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let abandoned: Vec<ActiveExecution> =
            self.active.write().drain().map(|(_, entry)| entry).collect();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Executions still active after grace period");
            let teardown = self.teardown();
            futures::future::join_all(abandoned.into_iter().filter_map(|entry| {
                let container_id = entry.container_id?;
                Some(teardown.clone().run(container_id, entry.exited))
            }))
            .await;
        }

        self.resources.shutdown().await;
        self.cleanup_resources().await
    }
}

fn shutting_down() -> EngineError {
    EngineError::Execution("engine is shutting down".to_string())
}

async fn force_stop(runtime: &dyn ContainerRuntime, container_id: &str) {
    if let Err(e) = runtime.stop_container(container_id, Duration::ZERO).await {
        warn!(container_id = %container_id, error = %e, "Failed to stop container");
    }
}

/// Resolves once the shutdown flag is set
async fn shutdown_signalled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Alerts become audit records; critical container alerts also become
/// security violations on the affected execution
fn alert_to_audit(
    audit: Arc<AuditLogger>,
    active: ActiveMap,
    poisoned: Arc<AtomicBool>,
) -> AlertHandler {
    Arc::new(move |alert: &ResourceAlert| {
        let severity = match alert.severity {
            AlertSeverity::Warning => AuditSeverity::Warning,
            AlertSeverity::Critical => AuditSeverity::Critical,
        };
        if let Err(e) = audit.log_resource_limit_exceeded(
            &alert.container_id,
            alert.resource_type.label(),
            alert.current_value,
            alert.threshold,
            severity,
        ) {
            poison(&poisoned, &e);
            return;
        }

        if alert.container_id == SYSTEM_CONTAINER_ID {
            return;
        }

        let mut active = active.write();
        let Some(entry) = active
            .values_mut()
            .find(|e| e.container_id.as_deref() == Some(alert.container_id.as_str()))
        else {
            return;
        };
        entry.security_events.push(alert.message.clone());

        if alert.severity == AlertSeverity::Critical {
            let mut context = BTreeMap::new();
            context.insert("resource".to_string(), Value::from(alert.resource_type.label()));
            context.insert("policy".to_string(), Value::from(entry.policy.clone()));
            context.insert("user_id".to_string(), Value::from(entry.user_id.clone()));
            if let Err(e) = audit.log_security_violation(
                Some(alert.container_id.as_str()),
                Some(entry.user_id.as_str()),
                &alert.message,
                context,
            ) {
                poison(&poisoned, &e);
            }
        }
    })
}

fn default_code_file(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Python => "main.py",
        RuntimeKind::Node => "main.js",
        RuntimeKind::Shell | RuntimeKind::Multi => "script.sh",
    }
}

/// Blocking half of `prepare_workspace`
fn write_workspace(
    root: &Path,
    prefix: &str,
    files: &[(String, String)],
) -> Result<tempfile::TempDir, RuntimeError> {
    let workspace_err = |e: std::io::Error| RuntimeError::Workspace(e.to_string());

    std::fs::create_dir_all(root).map_err(workspace_err)?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(root)
        .map_err(workspace_err)?;

    for (relative, contents) in files {
        if !is_safe_relative_path(relative) {
            return Err(RuntimeError::Workspace(format!(
                "file path '{}' escapes the workspace",
                relative
            )));
        }
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(workspace_err)?;
            set_mode(parent, 0o755).map_err(workspace_err)?;
        }
        std::fs::write(&path, contents).map_err(workspace_err)?;
        set_mode(&path, 0o644).map_err(workspace_err)?;
    }
    set_mode(dir.path(), 0o755).map_err(workspace_err)?;
    Ok(dir)
}

fn is_safe_relative_path(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Cap `text` at `max` bytes on a char boundary, with a trailing marker
fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n... [output truncated, {} bytes omitted]", omitted));
    text
}
