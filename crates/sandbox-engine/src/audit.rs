//! Append-only, hash-chained audit log
//!
//! Records are newline-delimited JSON. Every file starts with a header
//! record carrying the chain value at the moment the file was opened, and
//! every event carries `checksum = sha256(canonical(event) + previous)`.
//! Re-walking a file and recomputing each checksum from the stored previous
//! one detects any edit, insertion or deletion.
//!
//! Writers are serialized through a single mutex and every record is flushed
//! before `record` returns.

use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::types::ResourceUsage;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Chain value before the first event ever written
pub const GENESIS_CHECKSUM: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const LOG_VERSION: &str = "1.0";
const FILE_PREFIX: &str = "audit-";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ContainerCreated,
    ContainerStarted,
    ContainerStopped,
    ContainerFailed,
    ContainerRemoved,
    SecurityViolation,
    ResourceLimitExceeded,
    PolicyApplied,
    ExecutionCompleted,
    AccessDenied,
    AuthFailed,
    ConfigChanged,
    SystemError,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ContainerCreated => "container_created",
            AuditEventType::ContainerStarted => "container_started",
            AuditEventType::ContainerStopped => "container_stopped",
            AuditEventType::ContainerFailed => "container_failed",
            AuditEventType::ContainerRemoved => "container_removed",
            AuditEventType::SecurityViolation => "security_violation",
            AuditEventType::ResourceLimitExceeded => "resource_limit_exceeded",
            AuditEventType::PolicyApplied => "policy_applied",
            AuditEventType::ExecutionCompleted => "execution_completed",
            AuditEventType::AccessDenied => "access_denied",
            AuditEventType::AuthFailed => "auth_failed",
            AuditEventType::ConfigChanged => "config_changed",
            AuditEventType::SystemError => "system_error",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub container_id: Option<String>,
    pub user_id: Option<String>,
    pub source_ip: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub security_context: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub checksum: String,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            container_id: None,
            user_id: None,
            source_ip: None,
            message: message.into(),
            details: BTreeMap::new(),
            resource_usage: None,
            security_context: None,
            checksum: String::new(),
        }
    }

    pub fn container(mut self, container_id: Option<&str>) -> Self {
        self.container_id = container_id.map(str::to_string);
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn source_ip(mut self, ip: Option<&str>) -> Self {
        self.source_ip = ip.map(str::to_string);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn usage(mut self, usage: Option<ResourceUsage>) -> Self {
        self.resource_usage = usage;
        self
    }

    pub fn security_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.security_context = Some(context);
        self
    }

    /// Length-prefixed fields in fixed order, then the previous checksum
    pub fn canonical_encoding(&self, previous_checksum: &str) -> String {
        let usage = self
            .resource_usage
            .as_ref()
            .map(canonical_usage)
            .unwrap_or_default();
        let context = self
            .security_context
            .as_ref()
            .map(|c| Value::Object(c.clone().into_iter().collect()).to_string())
            .unwrap_or_default();
        let details = Value::Object(self.details.clone().into_iter().collect()).to_string();
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);

        let fields: [&str; 12] = [
            &self.id,
            &timestamp,
            self.event_type.as_str(),
            self.severity.as_str(),
            self.container_id.as_deref().unwrap_or(""),
            self.user_id.as_deref().unwrap_or(""),
            self.source_ip.as_deref().unwrap_or(""),
            &self.message,
            &details,
            &usage,
            &context,
            previous_checksum,
        ];

        let mut out = String::new();
        for field in fields {
            out.push_str(&field.len().to_string());
            out.push(':');
            out.push_str(field);
            out.push('|');
        }
        out
    }

    pub fn compute_checksum(&self, previous_checksum: &str) -> String {
        let digest = Sha256::digest(self.canonical_encoding(previous_checksum).as_bytes());
        hex::encode(digest)
    }
}

/// Floats at fixed precision so a JSON round trip cannot change the hash
fn canonical_usage(usage: &ResourceUsage) -> String {
    format!(
        "{},{:.4},{},{:.4},{},{},{},{},{}",
        usage.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        usage.cpu_percent,
        usage.memory_bytes,
        usage.memory_percent,
        usage.disk_bytes,
        usage.network_rx_bytes,
        usage.network_tx_bytes,
        usage.process_count,
        usage.open_files.map(|n| n.to_string()).unwrap_or_default()
    )
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// First record of every log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogHeader {
    pub log_initialized: DateTime<Utc>,
    pub version: String,
    pub integrity_enabled: bool,
    pub previous_checksum: String,
}

/// Filters for `search_events`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub severity: Option<AuditSeverity>,
    pub container_id: Option<String>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.map_or(true, |t| event.event_type == t)
            && self.severity.map_or(true, |s| event.severity == s)
            && self
                .container_id
                .as_deref()
                .map_or(true, |c| event.container_id.as_deref() == Some(c))
            && self
                .user_id
                .as_deref()
                .map_or(true, |u| event.user_id.as_deref() == Some(u))
            && self.since.map_or(true, |t| event.timestamp >= t)
            && self.until.map_or(true, |t| event.timestamp <= t)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    /// 1-based line number in the file
    pub line: usize,
    pub event_id: Option<String>,
    pub reason: String,
}

/// Outcome of re-walking one log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub file: PathBuf,
    pub total_events: usize,
    pub verified_events: usize,
    pub failed_events: usize,
    pub failures: Vec<IntegrityFailure>,
    /// Chain value after the last event
    pub last_checksum: String,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.failed_events == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub events_written: u64,
    pub file_count: usize,
    pub total_bytes: u64,
    pub current_file: PathBuf,
    pub integrity_enabled: bool,
}

struct WriterState {
    path: PathBuf,
    file: File,
    size: u64,
    sequence: u64,
    previous_checksum: String,
}

pub struct AuditLogger {
    config: AuditConfig,
    state: Mutex<WriterState>,
    events_written: AtomicU64,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn file_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    rest.split('-').next()?.parse().ok()
}

/// Log files in `dir`, oldest first
fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| file_sequence(&path).map(|seq| (seq, path)))
        .collect();
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

enum Record {
    Header(AuditLogHeader),
    Event(Box<AuditEvent>),
    Malformed(String),
}

fn parse_record(line: &str) -> Record {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Record::Malformed(e.to_string()),
    };
    if value.get("log_initialized").is_some() {
        return match serde_json::from_value(value) {
            Ok(header) => Record::Header(header),
            Err(e) => Record::Malformed(e.to_string()),
        };
    }
    match serde_json::from_value(value) {
        Ok(event) => Record::Event(Box::new(event)),
        Err(e) => Record::Malformed(e.to_string()),
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, AuditError> {
    let file = File::open(path).map_err(io_error(path))?;
    BufReader::new(file)
        .lines()
        .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(path))
}

/// Chain value at the end of a file: last event checksum, else the header anchor
fn last_checksum_in(path: &Path) -> Result<Option<String>, AuditError> {
    let mut last = None;
    for line in read_lines(path)? {
        match parse_record(&line) {
            Record::Header(header) => last = Some(header.previous_checksum),
            Record::Event(event) => last = Some(event.checksum),
            Record::Malformed(reason) => {
                warn!(path = %path.display(), reason = %reason, "Skipping malformed audit record");
            }
        }
    }
    Ok(last)
}

impl AuditLogger {
    /// Open a fresh log file in `config.log_dir`, continuing the chain from
    /// the newest existing file
    pub fn new(config: AuditConfig) -> Result<Self, AuditError> {
        std::fs::create_dir_all(&config.log_dir).map_err(io_error(&config.log_dir))?;

        let existing = list_log_files(&config.log_dir)?;
        let (sequence, previous_checksum) = match existing.last() {
            Some(newest) => {
                let seq = file_sequence(newest).unwrap_or(0);
                let checksum = last_checksum_in(newest)?
                    .unwrap_or_else(|| GENESIS_CHECKSUM.to_string());
                (seq + 1, checksum)
            }
            None => (1, GENESIS_CHECKSUM.to_string()),
        };

        let state = open_log_file(&config, sequence, previous_checksum)?;
        info!(
            path = %state.path.display(),
            integrity = config.integrity_enabled,
            "Audit log opened"
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
            events_written: AtomicU64::new(0),
        })
    }

    pub fn current_file(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    /// Chain, append, flush. Returns the event id.
    pub fn record(&self, mut event: AuditEvent) -> Result<String, AuditError> {
        {
            let mut state = self.state.lock();
            if state.size > self.config.max_file_size {
                let next = open_log_file(
                    &self.config,
                    state.sequence + 1,
                    state.previous_checksum.clone(),
                )?;
                info!(from = %state.path.display(), to = %next.path.display(), "Rotating audit log");
                *state = next;
            }

            if self.config.integrity_enabled {
                event.checksum = event.compute_checksum(&state.previous_checksum);
            }

            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            let path = state.path.clone();
            state
                .file
                .write_all(line.as_bytes())
                .and_then(|_| state.file.flush())
                .map_err(io_error(&path))?;
            state.size += line.len() as u64;
            if self.config.integrity_enabled {
                state.previous_checksum = event.checksum.clone();
            }
        }
        self.events_written.fetch_add(1, Ordering::Relaxed);

        let container_id = event.container_id.as_deref().unwrap_or("-");
        match event.severity {
            AuditSeverity::Info => info!(
                target: "audit",
                event_type = %event.event_type,
                container_id = %container_id,
                "{}",
                event.message
            ),
            AuditSeverity::Warning => warn!(
                target: "audit",
                event_type = %event.event_type,
                container_id = %container_id,
                "{}",
                event.message
            ),
            AuditSeverity::Error | AuditSeverity::Critical => error!(
                target: "audit",
                event_type = %event.event_type,
                severity = event.severity.as_str(),
                container_id = %container_id,
                "{}",
                event.message
            ),
        }

        Ok(event.id)
    }

    /// Build and record an event
    #[allow(clippy::too_many_arguments)]
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        severity: AuditSeverity,
        message: &str,
        container_id: Option<&str>,
        user_id: Option<&str>,
        details: BTreeMap<String, Value>,
        resource_usage: Option<ResourceUsage>,
    ) -> Result<String, AuditError> {
        let mut event = AuditEvent::new(event_type, severity, message)
            .container(container_id)
            .usage(resource_usage);
        event.user_id = user_id.map(str::to_string);
        event.details = details;
        self.record(event)
    }

    pub fn log_container_created(
        &self,
        container_id: &str,
        user_id: &str,
        image: &str,
        policy: &str,
    ) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(
                AuditEventType::ContainerCreated,
                AuditSeverity::Info,
                format!("Container created from {}", image),
            )
            .container(Some(container_id))
            .user(user_id)
            .detail("image", image)
            .detail("policy", policy),
        )
    }

    pub fn log_container_started(&self, container_id: &str, user_id: &str) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(AuditEventType::ContainerStarted, AuditSeverity::Info, "Container started")
                .container(Some(container_id))
                .user(user_id),
        )
    }

    /// Info on exit code 0, warning otherwise
    pub fn log_container_stopped(
        &self,
        container_id: &str,
        user_id: &str,
        exit_code: i64,
        duration_ms: u64,
        usage: Option<ResourceUsage>,
    ) -> Result<String, AuditError> {
        let severity = if exit_code == 0 {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };
        self.record(
            AuditEvent::new(
                AuditEventType::ContainerStopped,
                severity,
                format!("Container exited with code {}", exit_code),
            )
            .container(Some(container_id))
            .user(user_id)
            .detail("exit_code", exit_code)
            .detail("duration_ms", duration_ms)
            .usage(usage),
        )
    }

    pub fn log_container_failed(
        &self,
        container_id: Option<&str>,
        user_id: &str,
        reason: &str,
        usage: Option<ResourceUsage>,
    ) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(
                AuditEventType::ContainerFailed,
                AuditSeverity::Error,
                format!("Execution failed: {}", reason),
            )
            .container(container_id)
            .user(user_id)
            .detail("error", reason)
            .usage(usage),
        )
    }

    pub fn log_security_violation(
        &self,
        container_id: Option<&str>,
        user_id: Option<&str>,
        violation: &str,
        context: BTreeMap<String, Value>,
    ) -> Result<String, AuditError> {
        let mut event = AuditEvent::new(
            AuditEventType::SecurityViolation,
            AuditSeverity::Critical,
            format!("Security violation: {}", violation),
        )
        .container(container_id)
        .security_context(context);
        event.user_id = user_id.map(str::to_string);
        self.record(event)
    }

    pub fn log_resource_limit_exceeded(
        &self,
        container_id: &str,
        resource: &str,
        current: f64,
        threshold: f64,
        severity: AuditSeverity,
    ) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(
                AuditEventType::ResourceLimitExceeded,
                severity,
                format!(
                    "{} usage {:.1}% exceeds threshold {:.0}%",
                    resource, current, threshold
                ),
            )
            .container(Some(container_id))
            .detail("resource", resource)
            .detail("current", round2(current))
            .detail("threshold", round2(threshold)),
        )
    }

    pub fn log_policy_applied(
        &self,
        request_id: &str,
        user_id: &str,
        policy: &str,
        image: &str,
        source_ip: Option<&str>,
    ) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(
                AuditEventType::PolicyApplied,
                AuditSeverity::Info,
                format!("Policy {} applied", policy),
            )
            .user(user_id)
            .source_ip(source_ip)
            .detail("request_id", request_id)
            .detail("policy", policy)
            .detail("image", image),
        )
    }

    pub fn log_access_denied(
        &self,
        user_id: &str,
        resource: &str,
        reason: &str,
        source_ip: Option<&str>,
    ) -> Result<String, AuditError> {
        self.record(
            AuditEvent::new(
                AuditEventType::AccessDenied,
                AuditSeverity::Warning,
                format!("Access denied to {}: {}", resource, reason),
            )
            .user(user_id)
            .source_ip(source_ip)
            .detail("resource", resource)
            .detail("reason", reason),
        )
    }

    /// Most recent `limit` matching events across all files, newest first
    pub fn search_events(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        search_log_dir(&self.config.log_dir, filter, limit)
    }

    /// Re-walk one file (default: the current one) and recompute every checksum
    pub fn verify_log_integrity(&self, file: Option<&Path>) -> Result<IntegrityReport, AuditError> {
        let path = match file {
            Some(p) => p.to_path_buf(),
            None => self.current_file(),
        };
        verify_log_file(&path)
    }

    /// Verify every file and the anchors linking consecutive files
    pub fn verify_all_logs(&self) -> Result<Vec<IntegrityReport>, AuditError> {
        verify_log_dir(&self.config.log_dir)
    }

    /// Delete files (other than the current one) not modified within `retention_days`
    pub fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize, AuditError> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let current = self.current_file();

        let mut removed = 0;
        for path in list_log_files(&self.config.log_dir)? {
            if path == current {
                continue;
            }
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(io_error(&path))?;
            if modified < cutoff {
                std::fs::remove_file(&path).map_err(io_error(&path))?;
                info!(path = %path.display(), "Removed expired audit log");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> Result<AuditStatistics, AuditError> {
        let files = list_log_files(&self.config.log_dir)?;
        let mut total_bytes = 0;
        for path in &files {
            total_bytes += std::fs::metadata(path).map_err(io_error(path))?.len();
        }
        Ok(AuditStatistics {
            events_written: self.events_written.load(Ordering::Relaxed),
            file_count: files.len(),
            total_bytes,
            current_file: self.current_file(),
            integrity_enabled: self.config.integrity_enabled,
        })
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }
}

fn open_log_file(
    config: &AuditConfig,
    sequence: u64,
    previous_checksum: String,
) -> Result<WriterState, AuditError> {
    let name = format!(
        "{}{:06}-{}{}",
        FILE_PREFIX,
        sequence,
        Utc::now().format("%Y%m%dT%H%M%S"),
        FILE_SUFFIX
    );
    let path = config.log_dir.join(name);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_error(&path))?;

    let header = AuditLogHeader {
        log_initialized: Utc::now(),
        version: LOG_VERSION.to_string(),
        integrity_enabled: config.integrity_enabled,
        previous_checksum: previous_checksum.clone(),
    };
    let mut line = serde_json::to_string(&header)?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .and_then(|_| file.flush())
        .map_err(io_error(&path))?;

    Ok(WriterState {
        path,
        file,
        size: line.len() as u64,
        sequence,
        previous_checksum,
    })
}

fn header_anchor(path: &Path) -> Result<Option<String>, AuditError> {
    Ok(read_lines(path)?.first().and_then(|line| match parse_record(line) {
        Record::Header(header) => Some(header.previous_checksum),
        _ => None,
    }))
}

/// Matching events from every log file in `dir`, newest first. Does not
/// open a writer, so it is safe to run against a live log directory.
pub fn search_log_dir(
    dir: &Path,
    filter: &AuditFilter,
    limit: usize,
) -> Result<Vec<AuditEvent>, AuditError> {
    let mut matches = Vec::new();
    for path in list_log_files(dir)? {
        for line in read_lines(&path)? {
            match parse_record(&line) {
                Record::Event(event) if filter.matches(&event) => matches.push(*event),
                Record::Malformed(reason) => {
                    debug!(path = %path.display(), reason = %reason, "Skipping malformed audit record");
                }
                _ => {}
            }
        }
    }
    matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matches.truncate(limit);
    Ok(matches)
}

/// Verify each file in `dir` and the header anchors between them
pub fn verify_log_dir(dir: &Path) -> Result<Vec<IntegrityReport>, AuditError> {
    let mut reports = Vec::new();
    let mut previous_tail: Option<String> = None;

    for path in list_log_files(dir)? {
        let mut report = verify_log_file(&path)?;
        if let Some(tail) = &previous_tail {
            let anchor = header_anchor(&path)?;
            if anchor.as_deref() != Some(tail.as_str()) {
                report.failed_events += 1;
                report.failures.insert(
                    0,
                    IntegrityFailure {
                        line: 1,
                        event_id: None,
                        reason: "header anchor does not match previous file".to_string(),
                    },
                );
            }
        }
        previous_tail = Some(report.last_checksum.clone());
        reports.push(report);
    }
    Ok(reports)
}

/// Recompute every checksum in one file from its header anchor
pub fn verify_log_file(path: &Path) -> Result<IntegrityReport, AuditError> {
    if !path.exists() {
        return Err(AuditError::MissingFile(path.to_path_buf()));
    }
    let mut report = IntegrityReport {
        file: path.to_path_buf(),
        total_events: 0,
        verified_events: 0,
        failed_events: 0,
        failures: Vec::new(),
        last_checksum: GENESIS_CHECKSUM.to_string(),
    };
    let mut previous = GENESIS_CHECKSUM.to_string();

    for (index, line) in read_lines(path)?.iter().enumerate() {
        let line_no = index + 1;
        match parse_record(line) {
            Record::Header(header) => {
                if index == 0 {
                    previous = header.previous_checksum;
                } else {
                    report.failed_events += 1;
                    report.failures.push(IntegrityFailure {
                        line: line_no,
                        event_id: None,
                        reason: "header record in the middle of the file".to_string(),
                    });
                }
            }
            Record::Event(event) => {
                report.total_events += 1;
                let expected = event.compute_checksum(&previous);
                if expected == event.checksum {
                    report.verified_events += 1;
                } else {
                    report.failed_events += 1;
                    report.failures.push(IntegrityFailure {
                        line: line_no,
                        event_id: Some(event.id.clone()),
                        reason: "checksum mismatch".to_string(),
                    });
                }
                previous = event.checksum;
            }
            Record::Malformed(reason) => {
                report.total_events += 1;
                report.failed_events += 1;
                report.failures.push(IntegrityFailure {
                    line: line_no,
                    event_id: None,
                    reason: format!("unparseable record: {}", reason),
                });
            }
        }
    }

    if report.failed_events > 0 {
        warn!(
            path = %path.display(),
            failed = report.failed_events,
            "SECURITY: Audit log integrity check failed"
        );
    }
    report.last_checksum = previous;
    Ok(report)
}
