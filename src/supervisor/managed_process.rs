//! Managed Process - one spawned gateway worker with captured output
//!
//! The supervisor owns at most one of these at a time:
//! - stdout/stderr are pumped into the supervisor's bounded log
//! - stdin is closed; the worker takes no console input
//! - `supervise()` waits for exit or tears the child down on request

use anyhow::Result;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::output::{pump, SharedLog, StreamName};
use super::process;
use crate::environment::LaunchCommand;

/// How a supervised process ended.
#[derive(Debug)]
pub enum ProcessExit {
    /// Exited on its own.
    Exited(io::Result<ExitStatus>),
    /// Torn down because a stop was requested.
    Stopped(io::Result<ExitStatus>),
}

impl ProcessExit {
    pub fn was_requested(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    pub fn describe(&self) -> String {
        let status = match self {
            Self::Exited(s) | Self::Stopped(s) => s,
        };
        match status {
            Ok(status) => format!("exited with {}", status),
            Err(e) => format!("wait failed: {}", e),
        }
    }
}

pub struct ManagedProcess {
    child: Child,
    pub pid: u32,
}

impl ManagedProcess {
    /// Spawn `command` and start draining its output into `log`.
    pub fn spawn(command: &LaunchCommand, log: SharedLog) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Windows: 콘솔 창 숨김
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn '{}': {}",
                command.program.display(),
                e
            )
        })?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned gateway"))?;

        if let Some(stdout) = child.stdout.take() {
            pump(StreamName::Stdout, stdout, log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(StreamName::Stderr, stderr, log);
        }

        tracing::info!("Gateway started with PID {}", pid);
        Ok(Self { child, pid })
    }

    /// Wait for the process to exit, or tear it down once `stop` is cancelled.
    ///
    /// An already-cancelled token tears the process down immediately.
    pub async fn supervise(mut self, stop: &CancellationToken, grace: Duration) -> ProcessExit {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::info!("Stopping gateway (pid {})", self.pid);
                ProcessExit::Stopped(process::terminate(&mut self.child, grace).await)
            }
            status = self.child.wait() => ProcessExit::Exited(status),
        }
    }
}
