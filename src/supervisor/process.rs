use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// Ask the child to exit: SIGTERM on unix, a hard kill elsewhere.
pub fn request_termination(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        // 이미 회수됨
        let Some(pid) = child.id() else {
            return Ok(());
        };
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }
    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

/// `grace` 동안 정상 종료를 기다린 뒤 강제 종료
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();
    if let Err(e) = request_termination(child) {
        tracing::warn!("Failed to signal gateway (pid {:?}): {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                "Gateway (pid {:?}) did not exit within {:?}, killing",
                pid,
                grace
            );
            child.kill().await?;
            child.wait().await
        }
    }
}
