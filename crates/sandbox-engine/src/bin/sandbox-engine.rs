//! Sandbox Engine CLI
//!
//! Runs one piece of untrusted code in a policy-shaped container and prints
//! the execution response as JSON, or inspects the engine's audit trail.
//!
//! Usage:
//!   sandbox-engine run-python script.py --requirement requests
//!   sandbox-engine run-shell - < script.sh
//!   sandbox-engine exec --runtime shell -- ls -la /workspace
//!   sandbox-engine policies
//!   sandbox-engine verify-audit
//!   sandbox-engine search-audit --event-type container_failed --limit 20
//!
//! Environment:
//!   SANDBOX_CONFIG       JSON engine configuration file
//!   SANDBOX_POLICY_FILE  Custom policy file merged over the built-ins
//!   SANDBOX_AUDIT_DIR    Audit log directory
//!   SANDBOX_POLICY       Default policy name
//!   RUST_LOG             Log filter (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_engine::audit::{search_log_dir, verify_log_dir};
use sandbox_engine::{
    AuditEventType, AuditFilter, AuditSeverity, ContainerExecutionEngine, EngineConfig,
    ExecutionRequest, ExecutionResponse, RuntimeKind, SecurityPolicyEngine,
};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-engine")]
#[command(about = "Run untrusted code in policy-enforced containers")]
#[command(version)]
struct Args {
    /// JSON engine configuration file
    #[arg(short, long, env = "SANDBOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Custom policy file merged over the built-in policies
    #[arg(long, env = "SANDBOX_POLICY_FILE", global = true)]
    policy_file: Option<PathBuf>,

    /// Audit log directory
    #[arg(long, env = "SANDBOX_AUDIT_DIR", global = true)]
    audit_dir: Option<PathBuf>,

    /// Policy used when a command does not name one
    #[arg(long, env = "SANDBOX_POLICY", global = true)]
    policy: Option<String>,

    /// User recorded in the audit trail
    #[arg(long, default_value = "cli", global = true)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a Python script (`-` reads stdin)
    RunPython {
        file: PathBuf,
        /// pip requirement, repeatable
        #[arg(short, long = "requirement")]
        requirements: Vec<String>,
    },

    /// Run a shell script (`-` reads stdin)
    RunShell { file: PathBuf },

    /// Run a Node.js script (`-` reads stdin)
    RunNode {
        file: PathBuf,
        /// npm package, repeatable
        #[arg(short, long = "package")]
        packages: Vec<String>,
    },

    /// Run a raw command
    Exec {
        #[arg(short, long, default_value = "shell")]
        runtime: RuntimeKind,
        /// Base image override (must be allowed by the policy)
        #[arg(long)]
        image: Option<String>,
        /// Timeout in seconds, overriding the policy's
        #[arg(long)]
        timeout: Option<u64>,
        /// KEY=VALUE, repeatable
        #[arg(short, long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        /// Package baked into the runtime image, repeatable
        #[arg(long = "package")]
        packages: Vec<String>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// List registered policies
    Policies {
        /// Print the full policy definitions
        #[arg(long)]
        verbose: bool,
    },

    /// Verify the audit hash chain
    VerifyAudit,

    /// Search audit events, newest first
    SearchAudit {
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        container: Option<String>,
        /// Only events recorded for this user
        #[arg(long)]
        audit_user: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Show engine statistics
    Stats,

    /// Remove old images, expired audit logs and dead monitors
    Cleanup,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

/// Parse a snake_case enum value the way it is serialized
fn parse_enum<T: DeserializeOwned>(value: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unknown {}: {}", what, value))
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(path) = &args.policy_file {
        config.policy_file = Some(path.clone());
    }
    if let Some(dir) = &args.audit_dir {
        config.audit.log_dir = dir.clone();
    }
    if let Some(policy) = &args.policy {
        config.default_policy = policy.clone();
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    // Policy listing and audit inspection never touch the daemon or open an
    // audit writer
    match &args.command {
        Commands::Policies { verbose } => {
            let policies = SecurityPolicyEngine::from_config(&config)?;
            if *verbose {
                print_json(&policies.policy_definitions())?;
            } else {
                print_json(&policies.list_policies())?;
            }
            return Ok(());
        }
        Commands::VerifyAudit => {
            let reports = verify_log_dir(&config.audit.log_dir)?;
            let intact = reports.iter().all(|r| r.is_intact());
            print_json(&reports)?;
            if !intact {
                std::process::exit(1);
            }
            return Ok(());
        }
        Commands::SearchAudit {
            event_type,
            severity,
            container,
            audit_user,
            limit,
        } => {
            let filter = AuditFilter {
                event_type: event_type
                    .as_deref()
                    .map(|t| parse_enum::<AuditEventType>(t, "event type"))
                    .transpose()?,
                severity: severity
                    .as_deref()
                    .map(|s| parse_enum::<AuditSeverity>(s, "severity"))
                    .transpose()?,
                container_id: container.clone(),
                user_id: audit_user.clone(),
                ..Default::default()
            };
            print_json(&search_log_dir(&config.audit.log_dir, &filter, *limit)?)?;
            return Ok(());
        }
        _ => {}
    }

    info!("Sandbox engine {}", env!("CARGO_PKG_VERSION"));
    let engine = ContainerExecutionEngine::with_docker(config).await?;
    let policy = args.policy.as_deref();

    let response: Option<ExecutionResponse> = match args.command {
        Commands::RunPython { file, requirements } => {
            let code = read_source(&file)?;
            Some(
                engine
                    .execute_python_code(&code, &requirements, policy, &args.user)
                    .await,
            )
        }
        Commands::RunShell { file } => {
            let script = read_source(&file)?;
            Some(engine.execute_shell_script(&script, policy, &args.user).await)
        }
        Commands::RunNode { file, packages } => {
            let code = read_source(&file)?;
            Some(
                engine
                    .execute_node_code(&code, &packages, policy, &args.user)
                    .await,
            )
        }
        Commands::Exec {
            runtime,
            image,
            timeout,
            env,
            packages,
            command,
        } => {
            let mut request = ExecutionRequest::new(runtime, command)
                .user(&args.user)
                .packages(&packages);
            if let Some(policy) = policy {
                request = request.policy(policy);
            }
            if let Some(image) = &image {
                request = request.image(image);
            }
            if let Some(secs) = timeout {
                request = request.timeout(Duration::from_secs(secs));
            }
            for (key, value) in &env {
                request = request.env(key, value);
            }
            Some(engine.execute(request).await)
        }
        Commands::Stats => {
            print_json(&engine.get_execution_statistics())?;
            None
        }
        Commands::Cleanup => {
            print_json(&engine.cleanup_resources().await)?;
            None
        }
        Commands::Policies { .. } | Commands::VerifyAudit | Commands::SearchAudit { .. } => None,
    };

    engine.shutdown().await;

    if let Some(response) = response {
        print_json(&response)?;
        let code = if response.exit_code == 0 && !response.success {
            1
        } else {
            response.exit_code as i32
        };
        std::process::exit(code);
    }
    Ok(())
}
