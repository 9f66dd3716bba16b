use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port handed to the worker when nothing else is configured.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Environment variable that points at an alternative config file.
pub const CONFIG_ENV_VAR: &str = "GATEWAY_KEEPER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Rendezvous socket used as the single-instance lock.
    pub lock_path: Option<PathBuf>,
    /// Launch port; persisted worker settings take precedence.
    pub port: Option<u16>,
    /// Worker-owned JSON settings file (`{"gateway": {"port": N}}`).
    pub settings_path: Option<PathBuf>,
    /// Directory containing the worker sources and its `package.json`.
    pub project_root: PathBuf,
    /// Name of the globally installed worker executable.
    pub worker_binary: String,
    /// Local entrypoint, relative to `project_root`.
    pub local_entrypoint: PathBuf,
    /// Name of the runtime executable (`node`).
    pub runtime_binary: String,
    pub min_runtime_version: String,
    /// Version of the host application; the worker must match its major.
    pub host_version: String,
    /// Searched before the well-known directories and `PATH`.
    pub extra_bin_dirs: Vec<PathBuf>,
    pub package_manager_home: Option<PathBuf>,
    pub supervisor: SupervisorConfig,
}

/// Restart policy and log sizing for the process supervisor.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub crash_window_secs: u64,
    pub crash_threshold: usize,
    pub restart_backoff_ms: u64,
    pub stop_grace_ms: u64,
    pub log_budget_chars: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lock_path: None,
            port: None,
            settings_path: None,
            project_root: PathBuf::from("gateway"),
            worker_binary: "gatewayd".to_string(),
            local_entrypoint: PathBuf::from("dist").join("index.js"),
            runtime_binary: "node".to_string(),
            min_runtime_version: "22.0.0".to_string(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            extra_bin_dirs: Vec::new(),
            package_manager_home: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            crash_window_secs: 120,
            crash_threshold: 3,
            restart_backoff_ms: 750,
            stop_grace_ms: 1000,
            log_budget_chars: 20_000,
        }
    }
}

impl SupervisorConfig {
    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl GatewayConfig {
    /// Load from `$GATEWAY_KEEPER_CONFIG` or `config/gateway.toml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&s)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_path.clone().unwrap_or_else(default_lock_path)
    }

    /// Persisted worker settings, then `port`, then [`DEFAULT_GATEWAY_PORT`].
    pub fn gateway_port(&self) -> u16 {
        self.settings_path
            .as_deref()
            .and_then(read_persisted_port)
            .or(self.port)
            .unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    /// Configured value, then `$PNPM_HOME`, then the platform default location.
    pub fn package_manager_home(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.package_manager_home {
            return Some(dir.clone());
        }
        if let Some(dir) = std::env::var_os("PNPM_HOME") {
            return Some(PathBuf::from(dir));
        }
        let home = home_dir()?;
        if cfg!(target_os = "macos") {
            Some(home.join("Library").join("pnpm"))
        } else if cfg!(target_os = "windows") {
            std::env::var_os("LOCALAPPDATA").map(|d| PathBuf::from(d).join("pnpm"))
        } else {
            Some(home.join(".local").join("share").join("pnpm"))
        }
    }
}

pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir()
        .join("gateway-keeper")
        .join("gateway.lock")
}

pub fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var_os(var).map(PathBuf::from)
}

fn read_persisted_port(path: &Path) -> Option<u16> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("No persisted settings at {}: {}", path.display(), e);
            return None;
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring malformed settings {}: {}", path.display(), e);
            return None;
        }
    };
    value
        .get("gateway")
        .and_then(|g| g.get("port"))
        .and_then(|p| p.as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
}
