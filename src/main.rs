//! gateway-keeper - keeps exactly one gateway worker alive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gateway_keeper::config::GatewayConfig;
use gateway_keeper::environment::EnvironmentResolver;
use gateway_keeper::supervisor::{process, GatewaySupervisor};

#[derive(Parser)]
#[command(name = "gateway-keeper", version, about = "Gateway worker supervisor")]
struct Cli {
    /// Configuration file (defaults to config/gateway.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the runtime and worker installation
    Check,
    /// Print the command that would launch the gateway
    Command,
    /// Supervise the gateway until interrupted
    Run,
    /// Hold the gateway lock, optionally for the lifetime of a wrapped command
    #[cfg(unix)]
    Lock {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Worker to run while the lock is held (after `--`)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Report whether the gateway lock is held, stale or absent
    #[cfg(unix)]
    LockStatus {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::load_from(path)?,
        None => GatewayConfig::load()?,
    };

    match cli.command {
        Commands::Check => {
            let status = EnvironmentResolver::new(config).check().await;
            print_json(&status)?;
        }
        Commands::Command => {
            let (status, command) = EnvironmentResolver::new(config)
                .resolve_launch_command()
                .await;
            match command {
                Some(command) => print_json(&command)?,
                None => print_json(&status)?,
            }
        }
        Commands::Run => run(config).await?,
        #[cfg(unix)]
        Commands::Lock { path, command } => {
            let path = path.unwrap_or_else(|| config.lock_path());
            hold_lock(&path, &command, config.supervisor.stop_grace()).await?;
        }
        #[cfg(unix)]
        Commands::LockStatus { path } => {
            let path = path.unwrap_or_else(|| config.lock_path());
            println!("{}", gateway_keeper::lock::probe(&path).await.as_str());
        }
    }
    Ok(())
}

async fn run(config: GatewayConfig) -> Result<()> {
    let supervisor_config = config.supervisor.clone();
    let handle = GatewaySupervisor::spawn(EnvironmentResolver::new(config), supervisor_config);

    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            match &status.reason {
                Some(reason) => tracing::warn!("Gateway {}: {}", status.state, reason),
                None => tracing::info!(
                    "Gateway {} (pid {:?}, restarts {})",
                    status.state,
                    status.pid,
                    status.restart_count
                ),
            }
        }
    });

    handle.set_active(true).await;
    wait_for_shutdown_signal().await?;

    tracing::info!("Shutdown signal received, stopping gateway");
    handle.shutdown().await;
    Ok(())
}

/// Hold the lock until a termination signal, or until the wrapped command exits.
///
/// Exits with the command's status, or `128 + signal number` when signalled.
#[cfg(unix)]
async fn hold_lock(path: &Path, command: &[String], grace: Duration) -> Result<()> {
    use gateway_keeper::lock::{self, TerminationSignals};
    use std::os::unix::process::ExitStatusExt;

    // installed before the lock is visible, so an early SIGTERM still releases it
    let mut signals = TerminationSignals::install().context("Failed to install signal handlers")?;
    let lock = lock::acquire(path)
        .await
        .with_context(|| format!("Failed to acquire {}", path.display()))?;
    tracing::info!("Holding gateway lock at {}", path.display());

    let Some((program, args)) = command.split_first() else {
        signals
            .release_on(std::sync::Arc::new(lock))
            .await
            .context("Signal handler task failed")?;
        return Ok(());
    };

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    let exited = tokio::select! {
        status = child.wait() => Ok(status),
        signal = signals.recv() => Err(signal),
    };
    let code = match exited {
        Ok(status) => {
            let status = status.context("Failed to wait for wrapped command")?;
            tracing::info!("Wrapped command {}", status);
            status
                .code()
                .or_else(|| status.signal().map(|n| 128 + n))
                .unwrap_or(1)
        }
        Err(signal) => {
            tracing::info!("{} received, stopping wrapped command", signal);
            if let Err(e) = process::terminate(&mut child, grace).await {
                tracing::warn!("Failed to stop wrapped command: {}", e);
            }
            128 + signal as i32
        }
    };

    lock.release();
    std::process::exit(code);
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    let signal = gateway_keeper::lock::wait_for_termination()
        .await
        .context("Failed to install signal handlers")?;
    tracing::debug!("Received {}", signal);
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
