//! Gateway process supervisor.
//!
//! A single owner task holds the [`ProcessState`], the crash history and the
//! restart counter. Hosts talk to it through a [`GatewayHandle`]; every launch
//! attempt runs in its own task and reports back over a channel, tagged with
//! a generation number so that events from superseded attempts are ignored.

pub mod crash_history;
pub mod error;
pub mod managed_process;
pub mod output;
pub mod process;
pub mod state_machine;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::environment::{EnvironmentResolver, LaunchCommand};
use crash_history::CrashHistory;
use error::SupervisorError;
use managed_process::ManagedProcess;
use output::{LogBuffer, SharedLog};
use state_machine::{ProcessState, StateMachine};

/// Produces a fresh launch command for every attempt.
#[async_trait]
pub trait LaunchResolver: Send + Sync + 'static {
    async fn resolve(&self) -> Result<LaunchCommand, SupervisorError>;
}

#[async_trait]
impl LaunchResolver for EnvironmentResolver {
    async fn resolve(&self) -> Result<LaunchCommand, SupervisorError> {
        match self.resolve_launch_command().await {
            (_, Some(command)) => Ok(command),
            (status, None) => Err(SupervisorError::EnvironmentNotReady(status.message)),
        }
    }
}

/// Host-readable snapshot of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub state: &'static str,
    pub reason: Option<String>,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

impl GatewayStatus {
    fn from_state(state: &ProcessState, restart_count: u32) -> Self {
        Self {
            state: state.label(),
            reason: state.reason().map(str::to_string),
            pid: state.pid(),
            restart_count,
        }
    }
}

enum Command {
    SetActive(bool),
    Restart,
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Started { generation: u64, pid: u32 },
    LaunchFailed { generation: u64, error: SupervisorError },
    Exited { generation: u64, requested: bool, description: String },
}

/// The live launch attempt.
struct Attempt {
    generation: u64,
    stop: CancellationToken,
}

pub struct GatewaySupervisor {
    machine: StateMachine,
    crashes: CrashHistory,
    restart_count: u32,
    config: SupervisorConfig,
    resolver: Arc<dyn LaunchResolver>,
    log: SharedLog,
    status_tx: watch::Sender<GatewayStatus>,
    events_tx: mpsc::UnboundedSender<Event>,
    generation: u64,
    attempt: Option<Attempt>,
    /// Task of the latest attempt. The next attempt waits for it to finish.
    last_task: Option<JoinHandle<()>>,
}

impl GatewaySupervisor {
    /// Start the owner task. The gateway stays stopped until `set_active(true)`.
    pub fn spawn(resolver: impl LaunchResolver, config: SupervisorConfig) -> GatewayHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(GatewayStatus::from_state(&ProcessState::Stopped, 0));
        let log = LogBuffer::shared(config.log_budget_chars);

        let supervisor = Self {
            machine: StateMachine::new(),
            crashes: CrashHistory::new(config.crash_window(), config.crash_threshold),
            restart_count: 0,
            config,
            resolver: Arc::new(resolver),
            log: log.clone(),
            status_tx,
            events_tx,
            generation: 0,
            attempt: None,
            last_task: None,
        };
        tokio::spawn(supervisor.run(commands_rx, events_rx));

        GatewayHandle {
            commands: commands_tx,
            status: status_rx,
            log,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            let resume_at = self.machine.state().resume_at();
            tokio::select! {
                // 호스트 명령 우선: stop이 만료된 백오프보다 먼저 처리됨
                biased;
                command = commands.recv() => match command {
                    Some(Command::SetActive(true)) => self.activate(),
                    Some(Command::SetActive(false)) => self.deactivate().await,
                    Some(Command::Restart) => self.operator_restart().await,
                    Some(Command::Shutdown(done)) => {
                        self.deactivate().await;
                        self.drain().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.deactivate().await;
                        self.drain().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event).await,
                _ = sleep_until(resume_at) => self.on_backoff_elapsed(),
            }
        }
        tracing::debug!("Gateway supervisor exited");
    }

    fn activate(&mut self) {
        if self.machine.state().is_active() {
            tracing::debug!("Gateway already active ({})", self.machine.state());
            return;
        }
        self.crashes.prune(Instant::now());
        if self.crashes.is_tripped() {
            let reason = self.crash_loop_reason("crash loop still within window".to_string());
            self.transition(ProcessState::Failed { reason });
            return;
        }
        self.begin_start();
    }

    async fn deactivate(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.stop.cancel();
        }
        if *self.machine.state() != ProcessState::Stopped {
            self.note("stop requested").await;
            self.transition(ProcessState::Stopped);
        }
    }

    /// Explicit operator reset: forget crash history and start over.
    async fn operator_restart(&mut self) {
        self.crashes.clear();
        if let Some(attempt) = self.attempt.take() {
            attempt.stop.cancel();
        }
        self.note("restart requested").await;
        self.begin_start();
    }

    fn begin_start(&mut self) {
        self.generation += 1;
        let stop = CancellationToken::new();
        self.transition(ProcessState::Starting);

        let context = LaunchContext {
            generation: self.generation,
            resolver: self.resolver.clone(),
            log: self.log.clone(),
            events: self.events_tx.clone(),
            stop: stop.clone(),
            grace: self.config.stop_grace(),
        };
        let previous = self.last_task.take();
        self.last_task = Some(tokio::spawn(launch_attempt(context, previous)));
        self.attempt = Some(Attempt {
            generation: self.generation,
            stop,
        });
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Started { generation, pid } => {
                if self.is_current(generation) {
                    self.transition(ProcessState::Running { pid });
                }
            }
            Event::LaunchFailed { generation, error } => {
                if self.is_current(generation) {
                    self.on_crash(error).await;
                }
            }
            Event::Exited {
                generation,
                requested,
                description,
            } => {
                if !self.is_current(generation) {
                    tracing::debug!("Ignoring exit of superseded attempt {}", generation);
                } else if requested {
                    self.attempt = None;
                    self.transition(ProcessState::Stopped);
                } else {
                    self.on_crash(SupervisorError::UnexpectedExit(description)).await;
                }
            }
        }
    }

    async fn on_crash(&mut self, error: SupervisorError) {
        self.attempt = None;
        let now = Instant::now();
        self.crashes.record(now);
        self.restart_count += 1;
        tracing::warn!("{} (restart #{})", error, self.restart_count);

        if self.crashes.is_tripped() {
            let reason = self.crash_loop_reason(error.to_string());
            tracing::error!("{}; automatic restarts disabled", reason);
            self.note(&reason).await;
            self.transition(ProcessState::Failed { reason });
        } else {
            self.note(&format!("{}; restarting", error)).await;
            self.transition(ProcessState::Restarting {
                resume_at: now + self.config.restart_backoff(),
            });
        }
    }

    fn on_backoff_elapsed(&mut self) {
        if matches!(self.machine.state(), ProcessState::Restarting { .. }) {
            self.begin_start();
        }
    }

    /// Wait for the latest attempt, including its teardown, to finish.
    async fn drain(&mut self) {
        if let Some(task) = self.last_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Gateway launch task failed: {}", e);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attempt
            .as_ref()
            .map_or(false, |a| a.generation == generation)
    }

    fn crash_loop_reason(&self, last: String) -> String {
        SupervisorError::CrashLoop {
            crashes: self.crashes.len(),
            window_secs: self.crashes.window().as_secs(),
            last,
        }
        .to_string()
    }

    fn transition(&mut self, to: ProcessState) {
        if let Err(e) = self.machine.transition(to) {
            tracing::error!("{}", e);
            return;
        }
        self.status_tx.send_replace(GatewayStatus::from_state(
            self.machine.state(),
            self.restart_count,
        ));
    }

    /// Supervisor lifecycle line in the output log.
    async fn note(&self, message: &str) {
        self.log
            .lock()
            .await
            .push_line(&format!("[keeper] {}", message));
    }
}

// ─── Launch attempts ─────────────────────────────────────────

struct LaunchContext {
    generation: u64,
    resolver: Arc<dyn LaunchResolver>,
    log: SharedLog,
    events: mpsc::UnboundedSender<Event>,
    stop: CancellationToken,
    grace: Duration,
}

/// Resolve, spawn and wait for one worker process.
///
/// Runs only after `previous` has finished, so two workers never overlap.
async fn launch_attempt(ctx: LaunchContext, previous: Option<JoinHandle<()>>) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let resolved = tokio::select! {
        biased;
        _ = ctx.stop.cancelled() => return,
        resolved = ctx.resolver.resolve() => resolved,
    };
    let command = match resolved {
        Ok(command) => command,
        Err(error) => {
            let _ = ctx.events.send(Event::LaunchFailed {
                generation: ctx.generation,
                error,
            });
            return;
        }
    };
    if ctx.stop.is_cancelled() {
        return;
    }

    ctx.log
        .lock()
        .await
        .push_line(&format!("[keeper] launching: {}", command.argv().join(" ")));
    let process = match ManagedProcess::spawn(&command, ctx.log.clone()) {
        Ok(process) => process,
        Err(e) => {
            let _ = ctx.events.send(Event::LaunchFailed {
                generation: ctx.generation,
                error: SupervisorError::SpawnFailed(e.to_string()),
            });
            return;
        }
    };
    let _ = ctx.events.send(Event::Started {
        generation: ctx.generation,
        pid: process.pid,
    });

    let exit = process.supervise(&ctx.stop, ctx.grace).await;
    let description = exit.describe();
    ctx.log
        .lock()
        .await
        .push_line(&format!("[keeper] gateway {}", description));
    let _ = ctx.events.send(Event::Exited {
        generation: ctx.generation,
        requested: exit.was_requested(),
        description,
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

// ─── Host handle ─────────────────────────────────────────────

/// Cloneable host-side handle. Never returns errors: all failure is state.
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<GatewayStatus>,
    log: SharedLog,
}

impl GatewayHandle {
    pub async fn set_active(&self, active: bool) {
        self.send(Command::SetActive(active)).await;
    }

    /// Clear the crash-loop guard and (re)start the gateway.
    pub async fn restart(&self) {
        self.send(Command::Restart).await;
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&GatewayStatus) -> bool) -> GatewayStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(predicate).await {
            return status.clone();
        }
        self.status()
    }

    /// Snapshot of the captured worker output.
    pub async fn logs(&self) -> String {
        self.log.lock().await.snapshot()
    }

    /// Stop the gateway and wait for the supervisor to finish its teardown.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::warn!("Gateway supervisor is no longer running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unavailable;

    #[async_trait]
    impl LaunchResolver for Unavailable {
        async fn resolve(&self) -> Result<LaunchCommand, SupervisorError> {
            Err(SupervisorError::EnvironmentNotReady("node not found".into()))
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            restart_backoff_ms: 10,
            stop_grace_ms: 500,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn test_status_snapshot() {
        let status = GatewayStatus::from_state(&ProcessState::Running { pid: 9 }, 2);
        assert_eq!(status.state, "running");
        assert_eq!(status.pid, Some(9));
        assert_eq!(status.restart_count, 2);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["reason"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_starts_stopped() {
        let handle = GatewaySupervisor::spawn(Unavailable, fast_config());
        assert_eq!(handle.status().state, "stopped");
        assert!(handle.logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_environment_counts_as_crash() {
        let handle = GatewaySupervisor::spawn(Unavailable, fast_config());
        handle.set_active(true).await;
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == "failed"),
        )
        .await
        .unwrap();
        assert_eq!(status.restart_count, 3);
        let reason = status.reason.unwrap();
        assert!(reason.contains("crashed 3 times"), "{}", reason);
        assert!(reason.contains("node not found"), "{}", reason);
        assert!(handle.logs().await.contains("[keeper]"));
    }

    #[tokio::test]
    async fn test_deactivate_from_failed() {
        let handle = GatewaySupervisor::spawn(Unavailable, fast_config());
        handle.set_active(true).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == "failed"),
        )
        .await
        .unwrap();

        handle.set_active(false).await;
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == "stopped"),
        )
        .await
        .unwrap();
        assert!(status.reason.is_none());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_lines_are_written_before_the_transition() {
        let config = SupervisorConfig {
            restart_backoff_ms: 60_000,
            ..fast_config()
        };
        let handle = GatewaySupervisor::spawn(Unavailable, config);
        handle.set_active(true).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == "restarting"),
        )
        .await
        .unwrap();

        // a busy log delays the transition instead of reordering the line
        let mut guard = handle.log.lock().await;
        handle.set_active(false).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status().state, "restarting");
        guard.push_line("worker output");
        drop(guard);

        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == "stopped"),
        )
        .await
        .unwrap();
        let logs = handle.logs().await;
        assert!(
            logs.ends_with("worker output\n[keeper] stop requested\n"),
            "{}",
            logs
        );
    }
}
