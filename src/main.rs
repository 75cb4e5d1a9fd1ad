use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use meshprobe::agent::Agent;
use meshprobe::config::{AgentConfig, ControlConfig};
use meshprobe::control::ControlPlane;

/// Mesh TCP latency probing: control plane and agents.
#[derive(Parser)]
#[command(name = "meshprobe", about)]
struct Cli {
    /// Logging verbosity override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: dispatch, result intake and aggregation.
    Control {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run an agent: probe peers and report telemetry.
    Agent {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// Either role, started and stopped the same way.
enum Role {
    Control(ControlPlane),
    Agent(Agent),
}

impl Role {
    async fn start(&mut self) -> Result<()> {
        match self {
            Self::Control(control) => control.start().await,
            Self::Agent(agent) => agent.start().await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Control(control) => control.stop().await,
            Self::Agent(agent) => agent.stop().await,
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (role, level) = match cli.command {
        Command::Version => {
            println!("meshprobe {}", version::full());
            return Ok(());
        }
        Command::Control { config } => {
            let cfg = ControlConfig::load(&config)
                .with_context(|| format!("loading config from {}", config.display()))?;
            let level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
            (Role::Control(ControlPlane::new(cfg)), level)
        }
        Command::Agent { config } => {
            let cfg = AgentConfig::load(&config)
                .with_context(|| format!("loading config from {}", config.display()))?;
            let level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
            (Role::Agent(Agent::new(cfg)), level)
        }
    };

    init_tracing(&level)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting meshprobe",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(role))
}

async fn run(mut role: Role) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    if let Err(e) = role.start().await {
        // Release whatever did come up before reporting.
        let _ = role.stop().await;
        return Err(e);
    }

    let _ = shutdown_rx.await;

    role.stop().await?;

    tracing::info!("meshprobe stopped");

    Ok(())
}
