//! Gateway environment resolver: decides whether the worker may be launched.
//!
//! ## 탐색 흐름
//! 1. 검색 경로에서 `min_runtime_version` 이상의 Node.js 런타임 탐색
//! 2. 워커 탐색: 전역 바이너리 우선, 그다음 로컬 엔트리포인트
//! 3. 워커 버전 확인 (`--version` 또는 `package.json`)
//! 4. 호스트가 요구하는 버전과 비교
//!
//! Only an `Ok` status produces a [`LaunchCommand`]. Nothing here is cached:
//! every check and every launch attempt resolves from scratch.

pub mod version;

pub use version::SemVer;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{home_dir, GatewayConfig};
use crate::utils::apply_creation_flags;

/// Environment variable telling the worker where its project lives.
pub const PROJECT_ROOT_ENV: &str = "GATEWAY_PROJECT_ROOT";

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

// ── Status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnvironmentKind {
    Checking,
    Ok,
    MissingRuntime,
    MissingWorker,
    /// `found` is `None` when the worker version could not be read.
    Incompatible {
        found: Option<SemVer>,
        required: SemVer,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSource {
    Global,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentStatus {
    #[serde(flatten)]
    pub kind: EnvironmentKind,
    pub runtime_version: Option<SemVer>,
    pub worker_version: Option<SemVer>,
    pub required_version: Option<SemVer>,
    pub worker_source: Option<WorkerSource>,
    pub message: String,
}

impl EnvironmentStatus {
    pub fn checking() -> Self {
        Self::with_kind(EnvironmentKind::Checking, "Checking gateway environment...")
    }

    fn with_kind(kind: EnvironmentKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            runtime_version: None,
            worker_version: None,
            required_version: None,
            worker_source: None,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_kind(
            EnvironmentKind::Error {
                reason: message.clone(),
            },
            message,
        )
    }

    pub fn is_ok(&self) -> bool {
        self.kind == EnvironmentKind::Ok
    }
}

// ── Launch command ──────────────────────────────────────────────

/// Everything needed to spawn one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

// ── Discovery results ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct Runtime {
    path: PathBuf,
    version: SemVer,
}

#[derive(Debug, Clone)]
enum WorkerInstall {
    Global { binary: PathBuf },
    Local { entrypoint: PathBuf, manifest: PathBuf },
}

impl WorkerInstall {
    fn source(&self) -> WorkerSource {
        match self {
            Self::Global { .. } => WorkerSource::Global,
            Self::Local { .. } => WorkerSource::Local,
        }
    }
}

/// Ways of locating the worker, tried in order. First hit wins.
#[derive(Debug, Clone, Copy)]
enum WorkerStrategy {
    GlobalBinary,
    LocalEntrypoint,
}

const WORKER_STRATEGIES: [WorkerStrategy; 2] =
    [WorkerStrategy::GlobalBinary, WorkerStrategy::LocalEntrypoint];

impl WorkerStrategy {
    fn locate(&self, resolver: &EnvironmentResolver, dirs: &[PathBuf]) -> Option<WorkerInstall> {
        match self {
            Self::GlobalBinary => find_executable(&resolver.config.worker_binary, dirs)
                .map(|binary| WorkerInstall::Global { binary }),
            Self::LocalEntrypoint => {
                let root = resolver.project_root();
                let entrypoint = root.join(&resolver.config.local_entrypoint);
                entrypoint.is_file().then(|| WorkerInstall::Local {
                    entrypoint,
                    manifest: root.join("package.json"),
                })
            }
        }
    }
}

// ── Resolver ────────────────────────────────────────────────────

pub struct EnvironmentResolver {
    config: GatewayConfig,
}

impl EnvironmentResolver {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Absolute project root (relative paths resolve against the cwd).
    pub fn project_root(&self) -> PathBuf {
        let root = &self.config.project_root;
        if root.is_absolute() {
            return root.clone();
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(root))
            .unwrap_or_else(|_| root.clone())
    }

    /// Ordered, de-duplicated directories searched for the runtime and worker.
    ///
    /// Configured extras, the package-manager home, well-known install
    /// locations and version-manager directories come before `PATH`.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.config.extra_bin_dirs.clone();
        if let Some(pm_home) = self.config.package_manager_home() {
            dirs.push(pm_home);
        }
        dirs.extend(preferred_dirs());
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        let mut seen = std::collections::HashSet::new();
        dirs.retain(|d| !d.as_os_str().is_empty() && seen.insert(d.clone()));
        dirs
    }

    pub async fn check(&self) -> EnvironmentStatus {
        self.resolve().await.0
    }

    /// Resolve the environment and, when it is `Ok`, the exact launch command.
    pub async fn resolve_launch_command(&self) -> (EnvironmentStatus, Option<LaunchCommand>) {
        let (status, resolved) = self.resolve().await;
        let command = resolved.map(|(runtime, install)| {
            let dirs = self.search_dirs();
            self.build_launch_command(&runtime, &install, &dirs)
        });
        (status, command)
    }

    async fn resolve(&self) -> (EnvironmentStatus, Option<(Runtime, WorkerInstall)>) {
        let Some(min_runtime) = SemVer::parse(&self.config.min_runtime_version) else {
            return (
                EnvironmentStatus::error(format!(
                    "Invalid min_runtime_version '{}'",
                    self.config.min_runtime_version
                )),
                None,
            );
        };
        let Some(host) = SemVer::parse(&self.config.host_version) else {
            return (
                EnvironmentStatus::error(format!(
                    "Host version '{}' is not a valid version",
                    self.config.host_version
                )),
                None,
            );
        };
        let required = SemVer::required_for_host(host);
        let dirs = self.search_dirs();

        // 1. 런타임
        let runtime = match find_runtime(&self.config.runtime_binary, min_runtime, &dirs).await {
            Ok(r) => r,
            Err(message) => {
                let mut status = EnvironmentStatus::with_kind(EnvironmentKind::MissingRuntime, message);
                status.required_version = Some(required);
                return (status, None);
            }
        };
        tracing::debug!("Runtime {} at {}", runtime.version, runtime.path.display());

        // 2. 워커
        let Some(install) = WORKER_STRATEGIES
            .iter()
            .find_map(|strategy| strategy.locate(self, &dirs))
        else {
            let mut status = EnvironmentStatus::with_kind(
                EnvironmentKind::MissingWorker,
                format!(
                    "Gateway worker not found: no '{}' on the search path and no entrypoint at {}",
                    self.config.worker_binary,
                    self.project_root().join(&self.config.local_entrypoint).display()
                ),
            );
            status.runtime_version = Some(runtime.version);
            status.required_version = Some(required);
            return (status, None);
        };

        // 3. 워커 버전 (실제 실행과 같은 PATH로 확인)
        let path_env = augmented_path(&runtime, &dirs);
        let found = match worker_version(&install, &path_env).await {
            Ok(v) => v,
            Err(message) => {
                let mut status = EnvironmentStatus::error(message);
                status.runtime_version = Some(runtime.version);
                status.required_version = Some(required);
                status.worker_source = Some(install.source());
                return (status, None);
            }
        };

        // 4-5. 호환성 검사
        let compatible = found.map_or(false, |v| v.is_compatible_with(&required));
        let mut status = if compatible {
            EnvironmentStatus::with_kind(
                EnvironmentKind::Ok,
                format!(
                    "Node {} and gateway {} ({}) are ready",
                    runtime.version,
                    display_version(found),
                    source_label(install.source())
                ),
            )
        } else {
            EnvironmentStatus::with_kind(
                EnvironmentKind::Incompatible { found, required },
                format!(
                    "Gateway {} is incompatible with this app; version {}.x (>= {}) is required",
                    display_version(found),
                    required.major,
                    required
                ),
            )
        };
        status.runtime_version = Some(runtime.version);
        status.worker_version = found;
        status.required_version = Some(required);
        status.worker_source = Some(install.source());

        if compatible {
            tracing::debug!("{}", status.message);
            (status, Some((runtime, install)))
        } else {
            tracing::warn!("{}", status.message);
            (status, None)
        }
    }

    fn build_launch_command(
        &self,
        runtime: &Runtime,
        install: &WorkerInstall,
        dirs: &[PathBuf],
    ) -> LaunchCommand {
        let port = self.config.gateway_port().to_string();
        let project_root = self.project_root();

        let (program, mut args) = match install {
            WorkerInstall::Global { binary } => (binary.clone(), Vec::new()),
            WorkerInstall::Local { entrypoint, .. } => (
                runtime.path.clone(),
                vec![entrypoint.to_string_lossy().into_owned()],
            ),
        };
        args.extend(["gateway".to_string(), "--port".to_string(), port]);

        let working_dir = if project_root.is_dir() {
            project_root.clone()
        } else {
            program
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| project_root.clone())
        };

        let mut env = vec![("PATH".to_string(), augmented_path(runtime, dirs))];
        if let Some(pm_home) = self.config.package_manager_home() {
            env.push(("PNPM_HOME".to_string(), pm_home.to_string_lossy().into_owned()));
        }
        env.push((
            PROJECT_ROOT_ENV.to_string(),
            project_root.to_string_lossy().into_owned(),
        ));

        LaunchCommand {
            program,
            args,
            working_dir,
            env,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Internal: discovery helpers
// ═══════════════════════════════════════════════════════════════

/// Well-known install locations, newest version-manager installs first.
fn preferred_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let home = home_dir();

    if let Some(home) = &home {
        dirs.push(home.join(".local").join("bin"));
        dirs.push(home.join(".volta").join("bin"));
    }

    #[cfg(not(target_os = "windows"))]
    {
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
    }

    if let Some(home) = &home {
        let patterns = [
            home.join(".nvm/versions/node/*/bin"),
            home.join(".local/share/fnm/node-versions/*/installation/bin"),
        ];
        for pattern in patterns {
            dirs.extend(glob_dirs(&pattern.to_string_lossy()));
        }
    }

    dirs
}

fn glob_dirs(pattern: &str) -> Vec<PathBuf> {
    let Ok(paths) = glob::glob(pattern) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = paths.flatten().filter(|p| p.is_dir()).collect();
    found.sort_by_key(|p| std::cmp::Reverse(SemVer::find_in(&p.to_string_lossy())));
    found
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec![format!("{}.exe", name), format!("{}.cmd", name)]
    } else {
        vec![name.to_string()]
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn find_executable(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = executable_names(name);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| is_executable(candidate))
}

async fn find_runtime(name: &str, min: SemVer, dirs: &[PathBuf]) -> Result<Runtime, String> {
    let names = executable_names(name);
    let candidates: Vec<PathBuf> = dirs
        .iter()
        .flat_map(|d| names.iter().map(move |n| d.join(n)))
        .filter(|candidate| is_executable(candidate))
        .collect();
    let mut rejected = Vec::new();

    for candidate in candidates {
        let version = match read_version_output(&candidate, None).await {
            Ok(out) => SemVer::parse(&out).or_else(|| SemVer::find_in(&out)),
            Err(e) => {
                tracing::debug!("Skipping runtime candidate: {}", e);
                continue;
            }
        };
        match version {
            Some(v) if v >= min => {
                return Ok(Runtime {
                    path: candidate,
                    version: v,
                })
            }
            Some(v) => {
                tracing::debug!("{} → {} (>= {} required, skipped)", candidate.display(), v, min);
                rejected.push(format!("{} {} (too old)", candidate.display(), v));
            }
            None => rejected.push(format!("{} (unknown version)", candidate.display())),
        }
    }

    let searched = dirs
        .iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let mut message = format!("{} >= {} not found (searched: {})", name, min, searched);
    if !rejected.is_empty() {
        message.push_str(&format!("; rejected: {}", rejected.join(", ")));
    }
    Err(message)
}

/// A global worker is usually a `#!/usr/bin/env node` script, so it needs
/// `path_env` to find the runtime.
async fn worker_version(install: &WorkerInstall, path_env: &str) -> Result<Option<SemVer>, String> {
    match install {
        WorkerInstall::Global { binary } => {
            let out = read_version_output(binary, Some(path_env)).await?;
            Ok(SemVer::find_in(&out))
        }
        WorkerInstall::Local { manifest, .. } => {
            let content = std::fs::read_to_string(manifest).map_err(|e| {
                format!("Failed to read worker manifest {}: {}", manifest.display(), e)
            })?;
            let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
                format!("Failed to parse worker manifest {}: {}", manifest.display(), e)
            })?;
            Ok(value
                .get("version")
                .and_then(|v| v.as_str())
                .and_then(SemVer::parse))
        }
    }
}

/// `<program> --version`, trimmed stdout.
async fn read_version_output(program: &Path, path_env: Option<&str>) -> Result<String, String> {
    let mut cmd = Command::new(program);
    if let Some(path_env) = path_env {
        cmd.env("PATH", path_env);
    }
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    apply_creation_flags(&mut cmd);

    match tokio::time::timeout(VERSION_TIMEOUT, cmd.output()).await {
        Err(_) => Err(format!("{} --version timed out", program.display())),
        Ok(Err(e)) => Err(format!("Failed to run {} --version: {}", program.display(), e)),
        Ok(Ok(output)) if !output.status.success() => Err(format!(
            "{} --version exited with {}",
            program.display(),
            output.status
        )),
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
    }
}

/// Runtime dir first so the worker's own `node` lookups hit the same runtime.
fn augmented_path(runtime: &Runtime, dirs: &[PathBuf]) -> String {
    let mut entries: Vec<PathBuf> = Vec::new();
    if let Some(dir) = runtime.path.parent() {
        entries.push(dir.to_path_buf());
    }
    for dir in dirs {
        if !entries.contains(dir) {
            entries.push(dir.clone());
        }
    }
    match std::env::join_paths(&entries) {
        Ok(joined) => joined.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!("Could not build PATH ({}), inheriting", e);
            std::env::var("PATH").unwrap_or_default()
        }
    }
}

fn display_version(v: Option<SemVer>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string())
}

fn source_label(source: WorkerSource) -> &'static str {
    match source {
        WorkerSource::Global => "global",
        WorkerSource::Local => "local",
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
