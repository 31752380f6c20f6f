//! procgov
//!
//! Runs tool subprocesses under admission control and resource limits, and
//! inspects process health from the command line. All command output is JSON
//! on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procgov::observability::{init_metrics, init_tracing};
use procgov::runtime::process_manager::{ProcessKind, SpawnConfig};
use procgov::telemetry::monitor::ProcessMonitor;
use procgov::{BuildInfo, GovernorConfig, Governor};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "procgov")]
#[command(about = "Admission control and resource governance for tool subprocesses", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (overrides $PROCGOV_CONFIG and ./procgov.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under admission control and resource limits
    Run {
        /// Process kind: ai-assistant, test-runner-a, test-runner-b, other
        #[arg(long, default_value = "other")]
        kind: ProcessKind,

        /// Component requesting the slot
        #[arg(long, default_value = "cli")]
        component: String,

        /// Keep retrying while admission is denied
        #[arg(long)]
        retry: bool,

        /// Execution timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List zombie or defunct processes
    Zombies,

    /// Sample one process and score its health
    Health {
        pid: u32,
    },

    /// Print the effective configuration
    Limits,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GovernorConfig::load_from(Some(path), true)?,
        None => GovernorConfig::load()?,
    };

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    let build = BuildInfo::current();
    debug!("{} v{} ({})", build.name, build.version, build.target_os);

    match cli.command {
        Commands::Run {
            kind,
            component,
            retry,
            timeout_ms,
            command,
        } => {
            if let Some(timeout_ms) = timeout_ms {
                config.limits.execution_timeout_ms = timeout_ms;
            }
            let code = run(config, kind, component, retry, command).await?;
            std::process::exit(code);
        }
        Commands::Zombies => {
            let monitor = ProcessMonitor::new(config.monitor);
            let zombies = monitor.detect_zombie_processes().await?;
            print_json(&zombies)?;
        }
        Commands::Health { pid } => {
            let monitor = ProcessMonitor::new(config.monitor)
                .with_warn_thresholds(config.limits.cpu_warn_percent, config.limits.mem_warn_percent);
            let report = monitor.check_process(pid).await?;
            print_json(&report)?;
        }
        Commands::Limits => print_json(&config)?,
    }

    Ok(())
}

async fn run(
    config: GovernorConfig,
    kind: ProcessKind,
    component: String,
    retry: bool,
    command: Vec<String>,
) -> Result<i32> {
    let (program, args) = command.split_first().context("No command given")?;

    let governor = Governor::new(config)?;
    governor.admission().install_shutdown_hooks();
    let _cleanup = governor.admission().start_cleanup();

    let retry_options = if retry {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });
        Some(governor.config().retry.to_options().with_cancel(cancel))
    } else {
        None
    };

    let spawn = SpawnConfig::new(kind, program.clone()).args(args.iter().cloned());
    info!("Running {} as {} for {}", program, kind, component);

    let run = governor.run(&spawn, &component, retry_options).await?;
    print_json(&run)?;

    Ok(if run.result.success {
        0
    } else {
        run.result.exit_code.filter(|code| *code != 0).unwrap_or(1)
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
