//! Sandbox Engine
//!
//! Runs untrusted Python, Node.js and shell code inside Docker containers
//! shaped by named security policies:
//! - Validates images and commands against the selected policy before any
//!   container exists
//! - Builds and caches hardened runtime images, optionally scanning them
//! - Translates policies into container limits, capabilities and mounts
//! - Samples per-container and host resource usage, raising alerts
//! - Records every step in a hash-chained, rotating JSON-lines audit trail
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │ Execution    │──▶│ Policy engine    │   │                 │
//! │ request      │   │ Image manager    │──▶│ Docker daemon   │
//! └──────────────┘   │ Resource manager │   │                 │
//!                    └────────┬─────────┘   └─────────────────┘
//!                             ▼
//!                    ┌──────────────────┐
//!                    │ Audit trail      │
//!                    └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sandbox_engine::{ContainerExecutionEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = ContainerExecutionEngine::with_docker(EngineConfig::default()).await?;
//!
//!     let response = engine
//!         .execute_python_code("print(1 + 1)", &[], Some("hardened"), "alice")
//!         .await;
//!     println!("exit={} stdout={}", response.exit_code, response.stdout);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod image;
pub mod monitor;
pub mod policy;
pub mod runtime;
pub mod scanner;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::{
    AuditEvent, AuditEventType, AuditFilter, AuditLogger, AuditSeverity, IntegrityReport,
};
pub use config::{AlertThresholds, AuditConfig, EngineConfig, ImageConfig, ResourceConfig};
pub use docker::DockerRuntime;
pub use engine::{CleanupReport, ContainerExecutionEngine, ExecutionStatistics};
pub use error::{AuditError, EngineError, ErrorKind, ImageError, PolicyError, RuntimeError};
pub use image::{BuildContext, ImageInfo, ImageManager};
pub use monitor::{ResourceAlert, ResourceManager, ResourceMonitor, UsageSummary};
pub use policy::{ExecutionPolicy, NetworkPolicy, SecurityLevel, SecurityPolicyEngine};
pub use runtime::ContainerRuntime;
pub use scanner::{ImageScanner, NoopScanner, ScanReport, TrivyScanner};
pub use types::*;
