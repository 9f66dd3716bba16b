//! Supervisor end-to-end tests with real `sh` workers.
#![cfg(unix)]

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_keeper::config::{GatewayConfig, SupervisorConfig};
use gateway_keeper::environment::{EnvironmentResolver, LaunchCommand};
use gateway_keeper::supervisor::error::SupervisorError;
use gateway_keeper::supervisor::{GatewayHandle, GatewayStatus, GatewaySupervisor, LaunchResolver};

const WAIT: Duration = Duration::from_secs(10);

/// Launches `sh -c <script>` with `MARKER` pointing at a per-test file.
struct ScriptResolver {
    script: String,
    marker: PathBuf,
    delay: Duration,
    resolves: Arc<AtomicUsize>,
}

impl ScriptResolver {
    fn new(dir: &Path, script: &str) -> Self {
        Self {
            script: script.to_string(),
            marker: dir.join("spawns"),
            delay: Duration::ZERO,
            resolves: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl LaunchResolver for ScriptResolver {
    async fn resolve(&self) -> Result<LaunchCommand, SupervisorError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(LaunchCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), self.script.clone()],
            working_dir: self.marker.parent().unwrap().to_path_buf(),
            env: vec![(
                "MARKER".to_string(),
                self.marker.to_string_lossy().into_owned(),
            )],
        })
    }
}

fn fast_config(backoff_ms: u64) -> SupervisorConfig {
    SupervisorConfig {
        restart_backoff_ms: backoff_ms,
        stop_grace_ms: 500,
        ..SupervisorConfig::default()
    }
}

/// Number of times a worker started, one line per spawn.
fn spawn_count(marker: &Path) -> usize {
    std::fs::read_to_string(marker)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

async fn wait_for(
    handle: &GatewayHandle,
    predicate: impl FnMut(&GatewayStatus) -> bool,
) -> GatewayStatus {
    tokio::time::timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for gateway status")
}

/// Spawn markers are written by the worker itself, after the pid is observed.
async fn wait_for_spawns(marker: &Path, expected: usize) {
    for _ in 0..100 {
        if spawn_count(marker) >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(spawn_count(marker), expected);
}

async fn wait_for_logs(handle: &GatewayHandle, needle: &str) -> String {
    for _ in 0..100 {
        let logs = handle.logs().await;
        if logs.contains(needle) {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{:?} never appeared in logs: {:?}", needle, handle.logs().await);
}

#[tokio::test]
async fn test_crash_loop_disables_restarts_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(dir.path(), r#"echo spawn >> "$MARKER"; exit 1"#);
    let marker = resolver.marker.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    let status = wait_for(&handle, |s| s.state == "failed").await;
    assert_eq!(status.restart_count, 3);
    assert!(status.reason.unwrap().contains("crashed 3 times within 120s"));
    assert_eq!(spawn_count(&marker), 3);

    // no further spawns while failed, and activation honours the guard
    handle.set_active(true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.status().state, "failed");
    assert_eq!(spawn_count(&marker), 3);

    // explicit reset clears the history and starts again
    handle.restart().await;
    let status = wait_for(&handle, |s| s.state == "failed" && s.restart_count == 6).await;
    assert_eq!(status.restart_count, 6);
    assert_eq!(spawn_count(&marker), 6);

    handle.shutdown().await;
    assert_eq!(handle.status().state, "stopped");
}

#[tokio::test]
async fn test_fewer_crashes_keep_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(
        dir.path(),
        r#"n=$(wc -l < "$MARKER"); echo spawn >> "$MARKER"; [ $n -lt 2 ] && exit 1; exec sleep 30"#,
    );
    std::fs::write(&resolver.marker, "").unwrap();
    let marker = resolver.marker.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    let status = wait_for(&handle, |s| s.state == "running" && s.restart_count == 2).await;
    assert!(status.pid.is_some());
    assert!(status.reason.is_none());
    wait_for_spawns(&marker, 3).await;

    handle.shutdown().await;
    assert_eq!(handle.status().state, "stopped");
}

#[tokio::test]
async fn test_stop_during_backoff_prevents_respawn() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(dir.path(), r#"echo spawn >> "$MARKER"; exit 1"#);
    let marker = resolver.marker.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(500));

    handle.set_active(true).await;
    wait_for(&handle, |s| s.state == "restarting").await;
    handle.set_active(false).await;
    wait_for(&handle, |s| s.state == "stopped").await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(handle.status().state, "stopped");
    assert_eq!(spawn_count(&marker), 1);
}

#[tokio::test]
async fn test_stop_during_resolution_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let mut resolver = ScriptResolver::new(dir.path(), r#"echo spawn >> "$MARKER"; exec sleep 30"#);
    resolver.delay = Duration::from_millis(500);
    let marker = resolver.marker.clone();
    let resolves = resolver.resolves.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    wait_for(&handle, |s| s.state == "starting").await;
    handle.set_active(false).await;
    wait_for(&handle, |s| s.state == "stopped").await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(resolves.load(Ordering::SeqCst), 1);
    assert!(!marker.exists());
    assert_eq!(handle.status().state, "stopped");
}

#[tokio::test]
async fn test_output_is_captured() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(
        dir.path(),
        "echo hello-from-stdout; echo hello-from-stderr >&2; exec sleep 30",
    );
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    wait_for(&handle, |s| s.state == "running").await;
    wait_for_logs(&handle, "hello-from-stdout\n").await;
    let logs = wait_for_logs(&handle, "hello-from-stderr\n").await;
    assert!(logs.contains("[keeper] launching: sh -c"));

    handle.shutdown().await;
    assert!(handle.logs().await.contains("[keeper] stop requested"));
}

#[tokio::test]
async fn test_stop_terminates_worker() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(dir.path(), "exec sleep 30");
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    let status = wait_for(&handle, |s| s.state == "running").await;
    let pid = Pid::from_raw(status.pid.unwrap() as i32);
    assert!(kill(pid, None::<Signal>).is_ok());

    handle.shutdown().await;
    assert!(kill(pid, None::<Signal>).is_err(), "worker still alive after shutdown");
}

/// Wraps [`ScriptResolver`] and announces every finished resolution.
struct AnnouncingResolver {
    inner: ScriptResolver,
    resolved: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl LaunchResolver for AnnouncingResolver {
    async fn resolve(&self) -> Result<LaunchCommand, SupervisorError> {
        let command = self.inner.resolve().await;
        self.resolved.notify_one();
        command
    }
}

#[tokio::test]
async fn test_stop_racing_spawn_leaves_no_worker() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let inner = ScriptResolver::new(dir.path(), r#"echo $$ >> "$MARKER"; exec sleep 30"#);
    let marker = inner.marker.clone();
    let resolved = Arc::new(tokio::sync::Notify::new());
    let resolver = AnnouncingResolver {
        inner,
        resolved: resolved.clone(),
    };
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    // stop lands between resolution and the owner seeing the pid
    for round in 0..10u64 {
        handle.set_active(true).await;
        resolved.notified().await;
        if round % 2 == 1 {
            tokio::time::sleep(Duration::from_millis(round)).await;
        }
        handle.set_active(false).await;
        let status = wait_for(&handle, |s| s.state == "stopped").await;
        assert!(status.pid.is_none());
    }
    handle.shutdown().await;

    let pids: Vec<i32> = std::fs::read_to_string(&marker)
        .unwrap_or_default()
        .lines()
        .map(|l| l.trim().parse().unwrap())
        .collect();
    for pid in pids {
        assert!(
            kill(Pid::from_raw(pid), None::<Signal>).is_err(),
            "worker {} survived a stop",
            pid
        );
    }
    assert_eq!(handle.status().state, "stopped");
    assert_eq!(handle.status().restart_count, 0);
}

#[tokio::test]
async fn test_restart_replaces_running_worker() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(dir.path(), r#"echo spawn >> "$MARKER"; exec sleep 30"#);
    let marker = resolver.marker.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    let first = wait_for(&handle, |s| s.state == "running").await;
    handle.restart().await;
    let second = wait_for(&handle, |s| s.state == "running" && s.pid != first.pid).await;

    // the operator restart is not a crash
    assert_eq!(second.restart_count, 0);
    wait_for_spawns(&marker, 2).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_output_does_not_harm_worker() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ScriptResolver::new(
        dir.path(),
        r#"printf '\377\n'; sleep 0.3; echo hello; echo alive > "$MARKER"; exec sleep 30"#,
    );
    let marker = resolver.marker.clone();
    let handle = GatewaySupervisor::spawn(resolver, fast_config(10));

    handle.set_active(true).await;
    wait_for(&handle, |s| s.state == "running").await;
    let logs = wait_for_logs(&handle, "hello\n").await;
    assert!(logs.contains("\u{FFFD}\n"), "{:?}", logs);
    assert!(!logs.contains("stream error"), "{:?}", logs);
    wait_for_spawns(&marker, 1).await;

    let status = handle.status();
    assert_eq!(status.state, "running");
    assert_eq!(status.restart_count, 0);
    handle.shutdown().await;
}

// ─── Real environment resolver ───────────────────────────────

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_launches_resolved_global_worker() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let project = dir.path().join("project");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&project).unwrap();
    write_script(&bin.join("fake-node"), "echo v22.4.1");
    write_script(
        &bin.join("fake-gatewayd"),
        r#"if [ "$1" = "--version" ]; then echo "fake-gatewayd 1.4.0"; exit 0; fi
echo "args: $*"
echo "root: $GATEWAY_PROJECT_ROOT"
exec sleep 30"#,
    );

    let config = GatewayConfig {
        runtime_binary: "fake-node".to_string(),
        worker_binary: "fake-gatewayd".to_string(),
        host_version: "1.4.2".to_string(),
        extra_bin_dirs: vec![bin],
        project_root: project.clone(),
        package_manager_home: Some(dir.path().join("pnpm")),
        port: Some(4555),
        supervisor: fast_config(10),
        ..GatewayConfig::default()
    };
    let supervisor_config = config.supervisor.clone();
    let handle = GatewaySupervisor::spawn(EnvironmentResolver::new(config), supervisor_config);

    handle.set_active(true).await;
    wait_for(&handle, |s| s.state == "running").await;
    wait_for_logs(&handle, "args: gateway --port 4555\n").await;
    wait_for_logs(&handle, &format!("root: {}\n", project.display())).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_worker_trips_guard() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("fake-node"), "echo v22.4.1");
    write_script(&bin.join("fake-gatewayd"), "echo 2.0.0");

    let config = GatewayConfig {
        runtime_binary: "fake-node".to_string(),
        worker_binary: "fake-gatewayd".to_string(),
        host_version: "3.1.0".to_string(),
        extra_bin_dirs: vec![bin],
        project_root: dir.path().to_path_buf(),
        supervisor: fast_config(10),
        ..GatewayConfig::default()
    };
    let supervisor_config = config.supervisor.clone();
    let handle = GatewaySupervisor::spawn(EnvironmentResolver::new(config), supervisor_config);

    handle.set_active(true).await;
    let status = wait_for(&handle, |s| s.state == "failed").await;
    let reason = status.reason.unwrap();
    assert!(reason.contains("environment not ready"), "{}", reason);
    assert!(status.pid.is_none());
}
