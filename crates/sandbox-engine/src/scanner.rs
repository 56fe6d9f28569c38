//! Vulnerability scanning for runtime images
//!
//! Scanning is optional: the image manager is handed an `ImageScanner` at
//! construction and skips scanning when `is_available()` is false. Scan
//! failures are logged by the caller and never fail an image resolution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Vulnerability counts for one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl ScanReport {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }

    /// `max(0, 100 - 10*critical - 5*high)`
    pub fn security_score(&self) -> u32 {
        let penalty = self
            .critical
            .saturating_mul(10)
            .saturating_add(self.high.saturating_mul(5));
        100u32.saturating_sub(penalty)
    }
}

#[async_trait]
pub trait ImageScanner: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    async fn scan(&self, image: &str) -> anyhow::Result<ScanReport>;
}

/// Scanner used when no vulnerability tool is installed
pub struct NoopScanner;

#[async_trait]
impl ImageScanner for NoopScanner {
    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn scan(&self, _image: &str) -> anyhow::Result<ScanReport> {
        Ok(ScanReport::default())
    }
}

/// Runs `trivy image --format json`
pub struct TrivyScanner {
    binary: String,
    timeout: Duration,
}

impl TrivyScanner {
    pub fn new() -> Self {
        Self {
            binary: "trivy".to_string(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Some(scanner) if a trivy binary is on PATH
    pub fn detect() -> Option<Self> {
        let scanner = Self::new();
        if scanner.is_available() {
            Some(scanner)
        } else {
            None
        }
    }
}

impl Default for TrivyScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageScanner for TrivyScanner {
    fn name(&self) -> &str {
        "trivy"
    }

    fn is_available(&self) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.binary).is_file())
            })
            .unwrap_or(false)
    }

    async fn scan(&self, image: &str) -> anyhow::Result<ScanReport> {
        debug!(image = %image, "Running trivy scan");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(["image", "--format", "json", "--quiet", image])
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("trivy scan of {} timed out", image))??;

        if !output.status.success() {
            anyhow::bail!(
                "trivy exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_trivy_report(&output.stdout)
    }
}

#[derive(Deserialize)]
struct TrivyOutput {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity")]
    severity: String,
}

fn parse_trivy_report(raw: &[u8]) -> anyhow::Result<ScanReport> {
    let parsed: TrivyOutput = serde_json::from_slice(raw)?;
    let mut report = ScanReport::default();
    for vuln in parsed
        .results
        .iter()
        .filter_map(|r| r.vulnerabilities.as_ref())
        .flatten()
    {
        match vuln.severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => report.critical += 1,
            "HIGH" => report.high += 1,
            "MEDIUM" => report.medium += 1,
            "LOW" => report.low += 1,
            _ => {}
        }
    }
    Ok(report)
}
