//! Supervisor 전용 에러 타입. 호스트에 `Err`로 전달되지 않고
//! 로그 라인과 `Failed` 상태의 reason으로만 남습니다.

/// 실행 시도 또는 실행 중인 게이트웨이가 실패한 이유
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("environment not ready: {0}")]
    EnvironmentNotReady(String),

    #[error("failed to spawn gateway: {0}")]
    SpawnFailed(String),

    #[error("gateway {0}")]
    UnexpectedExit(String),

    #[error("gateway crashed {crashes} times within {window_secs}s (last: {last})")]
    CrashLoop {
        crashes: usize,
        window_secs: u64,
        last: String,
    },
}

impl SupervisorError {
    /// 호스트 표시용 JSON 에러 페이로드
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EnvironmentNotReady(_) => "ENVIRONMENT_NOT_READY",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::UnexpectedExit(_) => "UNEXPECTED_EXIT",
            Self::CrashLoop { .. } => "CRASH_LOOP",
        }
    }
}
