//! Single-instance gateway lock.
//!
//! The lock is a listening Unix domain socket. A live holder answers
//! connections on it; a holder that crashed leaves only the socket file
//! behind, which the next `acquire` detects with a connect probe and reclaims.
//! No separate reaper or pid file is needed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{self, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for the liveness probe against an occupied path.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("failed to listen on {}: {source}", .path.display())]
    ListenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gateway already running (lock held at {})", .path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("failed to remove stale lock {}: {source}", .path.display())]
    StaleCleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to probe lock {}: {source}", .path.display())]
    ConnectFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ListenFailed { .. } => "LISTEN_FAILED",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::StaleCleanupFailed { .. } => "STALE_CLEANUP_FAILED",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
        }
    }
}

/// What currently occupies a lock path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    /// A live process is listening.
    Held,
    /// Something is on disk but nobody answers.
    Stale,
    Absent,
}

impl LockProbe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Stale => "stale",
            Self::Absent => "absent",
        }
    }
}

/// A held gateway lock. Released on [`GatewayLock::release`] or drop.
#[derive(Debug)]
pub struct GatewayLock {
    path: PathBuf,
    /// `None` once released. Cancelling the token closes the listener.
    listener: Mutex<Option<CancellationToken>>,
}

impl GatewayLock {
    fn hold(path: PathBuf, listener: UnixListener) -> Self {
        let token = CancellationToken::new();
        tokio::spawn(serve_probes(listener, token.clone()));
        tracing::info!("Gateway lock acquired: {}", path.display());
        Self {
            path,
            listener: Mutex::new(Some(token)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.listener
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Close the endpoint and remove the socket file.
    ///
    /// Idempotent and bounded: safe to call from a termination handler.
    /// Removal errors are swallowed.
    pub fn release(&self) {
        let token = match self.listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(token) = token else {
            return;
        };
        token.cancel();
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Gateway lock released: {}", self.path.display()),
            Err(e) => tracing::debug!("Lock path {} not removed: {}", self.path.display(), e),
        }
    }
}

impl Drop for GatewayLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire the gateway lock at `path`.
///
/// A stale remnant is removed and the bind retried exactly once; a second
/// failure is reported rather than looping.
pub async fn acquire(path: impl AsRef<Path>) -> Result<GatewayLock, LockError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::debug!("Could not create {}: {}", parent.display(), e);
            }
        }
    }

    match UnixListener::bind(&path) {
        Ok(listener) => return Ok(GatewayLock::hold(path, listener)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(source) => return Err(LockError::ListenFailed { path, source }),
    }

    match tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(&path)).await {
        Ok(Ok(_stream)) => return Err(LockError::AlreadyRunning { path }),
        Ok(Err(e)) if is_stale_connect_error(&e) => {}
        Ok(Err(source)) => return Err(LockError::ConnectFailed { path, source }),
        Err(_) => {
            return Err(LockError::ConnectFailed {
                path,
                source: io::Error::new(io::ErrorKind::TimedOut, "lock probe timed out"),
            })
        }
    }

    tracing::warn!("Removing stale gateway lock {}", path.display());
    if let Err(source) = remove_stale(&path) {
        return Err(LockError::StaleCleanupFailed { path, source });
    }

    match UnixListener::bind(&path) {
        Ok(listener) => Ok(GatewayLock::hold(path, listener)),
        Err(source) => Err(LockError::ListenFailed { path, source }),
    }
}

/// Classify a lock path without touching it.
pub async fn probe(path: impl AsRef<Path>) -> LockProbe {
    let path = path.as_ref();
    if std::fs::symlink_metadata(path).is_err() {
        return LockProbe::Absent;
    }
    match tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(_)) => LockProbe::Held,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => LockProbe::Absent,
        _ => LockProbe::Stale,
    }
}

/// Wait for the first interrupt, terminate or hangup signal.
pub async fn wait_for_termination() -> io::Result<Signal> {
    Ok(TerminationSignals::install()?.recv().await)
}

/// Interrupt, terminate and hangup handlers, installed up front.
pub struct TerminationSignals {
    interrupt: unix::Signal,
    terminate: unix::Signal,
    hangup: unix::Signal,
}

impl TerminationSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: unix::signal(SignalKind::interrupt())?,
            terminate: unix::signal(SignalKind::terminate())?,
            hangup: unix::signal(SignalKind::hangup())?,
        })
    }

    /// Release `lock` and exit with `128 + signal number` on the first signal.
    ///
    /// Install before acquiring so a signal that arrives right after the
    /// bind is not lost.
    pub fn release_on(mut self, lock: Arc<GatewayLock>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let signal = self.recv().await;
            tracing::info!("{} received, releasing gateway lock", signal);
            lock.release();
            std::process::exit(128 + signal as i32);
        })
    }

    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::SIGINT,
            _ = self.terminate.recv() => Signal::SIGTERM,
            _ = self.hangup.recv() => Signal::SIGHUP,
        }
    }
}

/// Accept and immediately drop connections so probes never queue up.
async fn serve_probes(listener: UnixListener, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => drop(stream),
                Err(e) => {
                    tracing::warn!("Lock listener accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

fn is_stale_connect_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

fn remove_stale(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        ));
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
