//! Live resource monitoring
//!
//! One `ResourceMonitor` per running container samples engine stats on an
//! interval and raises threshold alerts. `ResourceManager` owns the monitors,
//! the bounded alert history, the registered alert handlers and a host-level
//! loop that raises critical "system" alerts. It also gates admission of new
//! work through `check_system_capacity`.

use crate::config::{AlertThresholds, ResourceConfig};
use crate::runtime::{ContainerRuntime, RawStats};
use crate::types::ResourceUsage;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Container id used for host-level alerts
pub const SYSTEM_CONTAINER_ID: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
}

impl ResourceType {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "CPU",
            ResourceType::Memory => "Memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub container_id: String,
    pub resource_type: ResourceType,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
}

impl ResourceAlert {
    fn new(
        container_id: &str,
        resource_type: ResourceType,
        current_value: f64,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        let level = match severity {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        };
        Self {
            container_id: container_id.to_string(),
            resource_type,
            current_value,
            threshold,
            timestamp: Utc::now(),
            severity,
            message: format!(
                "{} usage {:.1}% exceeds {} threshold {:.0}%",
                resource_type.label(),
                current_value,
                level,
                threshold
            ),
        }
    }
}

/// Called for every alert. Must not block.
pub type AlertHandler = Arc<dyn Fn(&ResourceAlert) + Send + Sync>;

/// Breaches of `thresholds` (exclusive bounds). A critical breach suppresses
/// the warning for the same resource.
pub fn evaluate_thresholds(
    container_id: &str,
    usage: &ResourceUsage,
    thresholds: &AlertThresholds,
) -> Vec<ResourceAlert> {
    let checks = [
        (
            ResourceType::Cpu,
            usage.cpu_percent,
            thresholds.cpu_warning,
            thresholds.cpu_critical,
        ),
        (
            ResourceType::Memory,
            usage.memory_percent,
            thresholds.memory_warning,
            thresholds.memory_critical,
        ),
    ];

    checks
        .into_iter()
        .filter_map(|(kind, value, warning, critical)| {
            if value > critical {
                Some(ResourceAlert::new(container_id, kind, value, critical, AlertSeverity::Critical))
            } else if value > warning {
                Some(ResourceAlert::new(container_id, kind, value, warning, AlertSeverity::Warning))
            } else {
                None
            }
        })
        .collect()
}

pub fn usage_from_stats(stats: &RawStats) -> ResourceUsage {
    ResourceUsage {
        timestamp: Utc::now(),
        cpu_percent: stats.cpu_percent(),
        memory_bytes: stats.memory_usage,
        memory_percent: stats.memory_percent(),
        disk_bytes: stats.blkio_bytes,
        network_rx_bytes: stats.network_rx,
        network_tx_bytes: stats.network_tx,
        process_count: stats.pids,
        open_files: None,
    }
}

// =============================================================================
// Per-container monitor
// =============================================================================

/// Background sampler for one container
pub struct ResourceMonitor {
    container_id: String,
    history: Arc<Mutex<VecDeque<ResourceUsage>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Spawn the sampling loop. The first sample is taken immediately.
    pub fn start(
        container_id: &str,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
        history_limit: usize,
        thresholds: AlertThresholds,
        on_alert: AlertHandler,
    ) -> Self {
        let history = Arc::new(Mutex::new(VecDeque::with_capacity(history_limit.min(64))));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let id = container_id.to_string();
        let samples = history.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match runtime.container_stats(&id).await {
                    Ok(Some(stats)) => {
                        let usage = usage_from_stats(&stats);
                        let alerts = evaluate_thresholds(&id, &usage, &thresholds);
                        {
                            let mut samples = samples.lock();
                            if samples.len() >= history_limit {
                                samples.pop_front();
                            }
                            samples.push_back(usage);
                        }
                        for alert in &alerts {
                            on_alert(alert);
                        }
                    }
                    Ok(None) => {
                        debug!(container_id = %id, "Container gone, stopping monitor");
                        break;
                    }
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "Failed to sample container stats");
                    }
                }
            }
        });

        Self {
            container_id: container_id.to_string(),
            history,
            shutdown_tx,
            handle,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn current_usage(&self) -> Option<ResourceUsage> {
        self.history.lock().back().cloned()
    }

    /// Last `limit` samples, oldest first
    pub fn usage_history(&self, limit: usize) -> Vec<ResourceUsage> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(container_id = %self.container_id, error = %e, "Monitor task ended abnormally");
        }
    }
}

// =============================================================================
// Host probe
// =============================================================================

/// Host-wide load in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostLoad;
}

/// Host load from `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostLoad {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total > 0 {
            system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        HostLoad {
            cpu_percent: f64::from(system.global_cpu_usage()),
            memory_percent,
        }
    }
}

/// Critical alerts for host load above `limit`
pub fn system_alerts(load: HostLoad, limit: f64) -> Vec<ResourceAlert> {
    let mut alerts = Vec::new();
    if load.cpu_percent > limit {
        alerts.push(ResourceAlert::new(
            SYSTEM_CONTAINER_ID,
            ResourceType::Cpu,
            load.cpu_percent,
            limit,
            AlertSeverity::Critical,
        ));
    }
    if load.memory_percent > limit {
        alerts.push(ResourceAlert::new(
            SYSTEM_CONTAINER_ID,
            ResourceType::Memory,
            load.memory_percent,
            limit,
            AlertSeverity::Critical,
        ));
    }
    alerts
}

// =============================================================================
// Manager
// =============================================================================

/// Aggregate of current usage across all monitored containers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub active_containers: usize,
    pub sampled_containers: usize,
    pub total_cpu_percent: f64,
    pub total_memory_bytes: u64,
    pub average_cpu_percent: f64,
    pub average_memory_percent: f64,
    pub total_network_rx_bytes: u64,
    pub total_network_tx_bytes: u64,
    pub host: HostLoad,
    pub alerts_recorded: usize,
}

struct ManagerShared {
    config: ResourceConfig,
    alert_history: Mutex<VecDeque<ResourceAlert>>,
    handlers: RwLock<Vec<AlertHandler>>,
}

impl ManagerShared {
    fn dispatch(&self, alert: &ResourceAlert) {
        {
            let mut history = self.alert_history.lock();
            if history.len() >= self.config.alert_history_limit {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        match alert.severity {
            AlertSeverity::Warning => {
                warn!(container_id = %alert.container_id, "{}", alert.message)
            }
            AlertSeverity::Critical => {
                warn!(container_id = %alert.container_id, critical = true, "{}", alert.message)
            }
        }

        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(alert);
        }
    }
}

type SystemLoop = (watch::Sender<bool>, JoinHandle<()>);

/// Owns all container monitors and the host-level loop
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HostProbe>,
    monitors: RwLock<HashMap<String, ResourceMonitor>>,
    system_loop: Mutex<Option<SystemLoop>>,
}

impl ResourceManager {
    pub fn new(
        config: ResourceConfig,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HostProbe>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                config,
                alert_history: Mutex::new(VecDeque::new()),
                handlers: RwLock::new(Vec::new()),
            }),
            runtime,
            probe,
            monitors: RwLock::new(HashMap::new()),
            system_loop: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.shared.config
    }

    pub fn add_alert_handler(&self, handler: AlertHandler) {
        self.shared.handlers.write().push(handler);
    }

    /// Start the host-level loop (idempotent)
    pub fn start(&self) {
        let mut slot = self.system_loop.lock();
        if slot.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let shared = Arc::downgrade(&self.shared);
        let probe = self.probe.clone();
        let interval = self.shared.config.system_interval;
        let limit = self.shared.config.system_alert_percent;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                for alert in system_alerts(probe.sample(), limit) {
                    shared.dispatch(&alert);
                }
            }
            debug!("System resource loop stopped");
        });

        info!(interval_secs = interval.as_secs(), "System resource monitoring started");
        *slot = Some((tx, handle));
    }

    /// Start monitoring a container. No-op if it is already monitored.
    pub fn register_container(&self, container_id: &str) {
        let mut monitors = self.monitors.write();
        if monitors.contains_key(container_id) {
            return;
        }

        let shared: Weak<ManagerShared> = Arc::downgrade(&self.shared);
        let on_alert: AlertHandler = Arc::new(move |alert: &ResourceAlert| {
            if let Some(shared) = shared.upgrade() {
                shared.dispatch(alert);
            }
        });

        let config = &self.shared.config;
        let monitor = ResourceMonitor::start(
            container_id,
            self.runtime.clone(),
            config.sample_interval,
            config.history_limit,
            config.thresholds,
            on_alert,
        );
        monitors.insert(container_id.to_string(), monitor);
        debug!(container_id = %container_id, "Registered container for monitoring");
    }

    /// Stop and drop a container's monitor, returning its last sample
    pub async fn unregister_container(&self, container_id: &str) -> Option<ResourceUsage> {
        let monitor = self.monitors.write().remove(container_id)?;
        let last = monitor.current_usage();
        monitor.stop().await;
        debug!(container_id = %container_id, "Unregistered container from monitoring");
        last
    }

    pub fn active_count(&self) -> usize {
        self.monitors.read().len()
    }

    pub fn is_monitored(&self, container_id: &str) -> bool {
        self.monitors.read().contains_key(container_id)
    }

    /// Admission check: container ceiling first, then host CPU / memory
    pub fn check_system_capacity(&self) -> bool {
        let config = &self.shared.config;
        let active = self.active_count();
        if active >= config.max_containers {
            warn!(active, max = config.max_containers, "Container ceiling reached");
            return false;
        }
        self.check_host_capacity()
    }

    /// Host CPU / memory ceilings only. Callers that count their own
    /// reservations use this instead of the monitor count.
    pub fn check_host_capacity(&self) -> bool {
        let config = &self.shared.config;
        let load = self.probe.sample();
        if load.cpu_percent > config.max_cpu_percent {
            warn!(cpu = load.cpu_percent, max = config.max_cpu_percent, "Host CPU above admission ceiling");
            return false;
        }
        if load.memory_percent > config.max_memory_percent {
            warn!(
                memory = load.memory_percent,
                max = config.max_memory_percent,
                "Host memory above admission ceiling"
            );
            return false;
        }
        true
    }

    pub fn current_usage(&self, container_id: &str) -> Option<ResourceUsage> {
        self.monitors.read().get(container_id)?.current_usage()
    }

    pub fn usage_history(&self, container_id: &str, limit: usize) -> Vec<ResourceUsage> {
        self.monitors
            .read()
            .get(container_id)
            .map(|m| m.usage_history(limit))
            .unwrap_or_default()
    }

    /// Most recent `limit` alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<ResourceAlert> {
        self.shared
            .alert_history
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_usage_summary(&self) -> UsageSummary {
        let samples: Vec<ResourceUsage> = {
            let monitors = self.monitors.read();
            monitors.values().filter_map(|m| m.current_usage()).collect()
        };

        let mut summary = UsageSummary {
            active_containers: self.active_count(),
            sampled_containers: samples.len(),
            host: self.probe.sample(),
            alerts_recorded: self.shared.alert_history.lock().len(),
            ..Default::default()
        };

        let mut memory_percent_total = 0.0;
        for usage in &samples {
            summary.total_cpu_percent += usage.cpu_percent;
            summary.total_memory_bytes += usage.memory_bytes;
            summary.total_network_rx_bytes += usage.network_rx_bytes;
            summary.total_network_tx_bytes += usage.network_tx_bytes;
            memory_percent_total += usage.memory_percent;
        }
        if !samples.is_empty() {
            let n = samples.len() as f64;
            summary.average_cpu_percent = summary.total_cpu_percent / n;
            summary.average_memory_percent = memory_percent_total / n;
        }
        summary
    }

    /// Drop monitors whose loop has ended (container vanished)
    pub async fn cleanup_inactive_monitors(&self) -> usize {
        let finished: Vec<ResourceMonitor> = {
            let mut monitors = self.monitors.write();
            let ids: Vec<String> = monitors
                .iter()
                .filter(|(_, m)| !m.is_running())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| monitors.remove(id)).collect()
        };

        let count = finished.len();
        for monitor in finished {
            monitor.stop().await;
        }
        if count > 0 {
            info!(count, "Removed inactive resource monitors");
        }
        count
    }

    /// Stop the host loop and every container monitor
    pub async fn shutdown(&self) {
        let system = self.system_loop.lock().take();
        if let Some((tx, handle)) = system {
            let _ = tx.send(true);
            let _ = handle.await;
        }

        let monitors: Vec<ResourceMonitor> = self.monitors.write().drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.stop().await;
        }
        info!("Resource manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedProbe, RecordingRuntime};
    use crate::types::ContainerLaunchConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle() -> Arc<dyn HostProbe> {
        FixedProbe::idle()
    }

    fn usage(cpu: f64, memory: f64) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: cpu,
            memory_percent: memory,
            ..Default::default()
        }
    }

    fn fast_config() -> ResourceConfig {
        ResourceConfig {
            sample_interval: Duration::from_millis(10),
            system_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn running_container(runtime: &RecordingRuntime) -> String {
        runtime
            .create_container(&ContainerLaunchConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_threshold_levels() {
        let t = AlertThresholds::default();

        let critical = evaluate_thresholds("c", &usage(96.0, 10.0), &t);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].severity, AlertSeverity::Critical);
        assert_eq!(critical[0].resource_type, ResourceType::Cpu);
        assert_eq!(critical[0].threshold, 95.0);

        let warning = evaluate_thresholds("c", &usage(85.0, 10.0), &t);
        assert_eq!(warning.len(), 1);
        assert_eq!(warning[0].severity, AlertSeverity::Warning);

        assert!(evaluate_thresholds("c", &usage(50.0, 50.0), &t).is_empty());
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let t = AlertThresholds::default();
        assert!(evaluate_thresholds("c", &usage(80.0, 80.0), &t).is_empty());

        let at_critical = evaluate_thresholds("c", &usage(95.0, 0.0), &t);
        assert_eq!(at_critical[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_memory_alerts() {
        let alerts = evaluate_thresholds("c", &usage(96.0, 97.5), &AlertThresholds::default());
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].resource_type, ResourceType::Memory);
        assert!(alerts[1].message.contains("Memory usage 97.5%"));
    }

    #[test]
    fn test_system_alerts() {
        let quiet = HostLoad {
            cpu_percent: 50.0,
            memory_percent: 90.0,
        };
        assert!(system_alerts(quiet, 90.0).is_empty());

        let hot = HostLoad {
            cpu_percent: 99.0,
            memory_percent: 91.0,
        };
        let alerts = system_alerts(hot, 90.0);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.container_id == SYSTEM_CONTAINER_ID));
        assert!(alerts.iter().all(|a| a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn test_usage_from_stats() {
        let stats = RawStats {
            cpu_total: 300,
            precpu_total: 100,
            system_cpu: 2000,
            presystem_cpu: 1000,
            online_cpus: 2,
            memory_usage: 512,
            memory_limit: 1024,
            network_rx: 10,
            network_tx: 20,
            blkio_bytes: 4096,
            pids: 3,
        };
        let usage = usage_from_stats(&stats);
        assert!((usage.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(usage.memory_percent, 50.0);
        assert_eq!(usage.network_tx_bytes, 20);
        assert_eq!(usage.disk_bytes, 4096);
        assert_eq!(usage.process_count, 3);
        assert_eq!(usage.open_files, None);
    }

    #[tokio::test]
    async fn test_capacity_ceiling_ignores_host_load() {
        let runtime = RecordingRuntime::default();
        let config = ResourceConfig {
            max_containers: 2,
            ..fast_config()
        };
        let manager = ResourceManager::new(config, Arc::new(runtime.clone()), idle());

        assert!(manager.check_system_capacity());
        let a = running_container(&runtime).await;
        let b = running_container(&runtime).await;
        manager.register_container(&a);
        assert!(manager.check_system_capacity());
        manager.register_container(&b);
        assert!(!manager.check_system_capacity());

        manager.unregister_container(&a).await;
        assert!(manager.check_system_capacity());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_respects_host_ceilings() {
        let runtime = RecordingRuntime::default();
        let busy = Arc::new(FixedProbe(HostLoad {
            cpu_percent: 81.0,
            memory_percent: 10.0,
        }));
        let manager = ResourceManager::new(fast_config(), Arc::new(runtime.clone()), busy);
        assert!(!manager.check_system_capacity());

        let full = Arc::new(FixedProbe(HostLoad {
            cpu_percent: 10.0,
            memory_percent: 86.0,
        }));
        let manager = ResourceManager::new(fast_config(), Arc::new(runtime), full);
        assert!(!manager.check_system_capacity());
    }

    #[tokio::test]
    async fn test_monitor_samples_and_alerts() {
        let runtime = RecordingRuntime::default();
        runtime.set_stats(RawStats {
            cpu_total: 1960,
            precpu_total: 1000,
            system_cpu: 2000,
            presystem_cpu: 1000,
            online_cpus: 1,
            memory_usage: 100,
            memory_limit: 1000,
            ..Default::default()
        });
        let manager = ResourceManager::new(fast_config(), Arc::new(runtime.clone()), idle());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.add_alert_handler(Arc::new(move |alert: &ResourceAlert| {
            assert_eq!(alert.severity, AlertSeverity::Critical);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let id = running_container(&runtime).await;
        manager.register_container(&id);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let current = manager.current_usage(&id).expect("sampled");
        assert!((current.cpu_percent - 96.0).abs() < 1e-9);
        assert!(!manager.usage_history(&id, 1000).is_empty());
        assert_eq!(manager.usage_history(&id, 1).len(), 1);
        assert!(seen.load(Ordering::SeqCst) >= 1);

        let alerts = manager.recent_alerts(10);
        assert!(!alerts.is_empty());
        assert_eq!(alerts[0].container_id, id);

        let summary = manager.get_usage_summary();
        assert_eq!(summary.active_containers, 1);
        assert_eq!(summary.sampled_containers, 1);
        assert!((summary.average_memory_percent - 10.0).abs() < 1e-9);

        let last = manager.unregister_container(&id).await;
        assert!(last.is_some());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let runtime = RecordingRuntime::default();
        let config = ResourceConfig {
            history_limit: 3,
            ..fast_config()
        };
        let manager = ResourceManager::new(config, Arc::new(runtime.clone()), idle());
        let id = running_container(&runtime).await;
        manager.register_container(&id);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.usage_history(&id, 1000).len(), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_vanished_container_monitor_is_cleaned_up() {
        let runtime = RecordingRuntime::default();
        let manager = ResourceManager::new(fast_config(), Arc::new(runtime.clone()), idle());
        let id = running_container(&runtime).await;
        manager.register_container(&id);
        runtime.remove_container(&id, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(manager.cleanup_inactive_monitors().await, 1);
        assert!(!manager.is_monitored(&id));
    }

    #[tokio::test]
    async fn test_system_loop_raises_system_alerts() {
        let runtime = RecordingRuntime::default();
        let hot = Arc::new(FixedProbe(HostLoad {
            cpu_percent: 97.0,
            memory_percent: 20.0,
        }));
        let manager = ResourceManager::new(fast_config(), Arc::new(runtime), hot);
        manager.start();
        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown().await;

        let alerts = manager.recent_alerts(100);
        assert!(!alerts.is_empty());
        assert!(alerts
            .iter()
            .all(|a| a.container_id == SYSTEM_CONTAINER_ID && a.resource_type == ResourceType::Cpu));
    }

    #[tokio::test]
    async fn test_alert_history_is_bounded() {
        let runtime = RecordingRuntime::default();
        let config = ResourceConfig {
            alert_history_limit: 2,
            ..fast_config()
        };
        let manager = ResourceManager::new(config, Arc::new(runtime), idle());
        for value in [96.0, 97.0, 98.0] {
            for alert in evaluate_thresholds("c", &usage(value, 0.0), &AlertThresholds::default()) {
                manager.shared.dispatch(&alert);
            }
        }
        let alerts = manager.recent_alerts(10);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].current_value, 98.0);
    }
}
