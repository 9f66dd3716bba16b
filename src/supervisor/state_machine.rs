use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// 감독 중인 게이트웨이의 생명주기.
///
/// 활성 의도는 variant 자체로 표현됩니다: `Starting`, `Running`,
/// `Restarting`은 호스트가 게이트웨이 실행을 원하는 상태입니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running { pid: u32 },
    /// 재시작 백오프 대기 중
    Restarting { resume_at: Instant },
    /// 크래시 루프 감지. 명시적 restart 필요
    Failed { reason: String },
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Restarting { .. } => "restarting",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn resume_at(&self) -> Option<Instant> {
        match self {
            Self::Restarting { resume_at } => Some(*resume_at),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running { .. } | Self::Restarting { .. }
        )
    }

    pub fn can_transition(&self, to: &ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Stopped, Failed { .. })
                | (Starting, Starting)
                | (Starting, Running { .. })
                | (Starting, Restarting { .. })
                | (Starting, Failed { .. })
                | (Starting, Stopped)
                | (Running { .. }, Starting)
                | (Running { .. }, Restarting { .. })
                | (Running { .. }, Failed { .. })
                | (Running { .. }, Stopped)
                | (Restarting { .. }, Starting)
                | (Restarting { .. }, Stopped)
                | (Failed { .. }, Starting)
                | (Failed { .. }, Failed { .. })
                | (Failed { .. }, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid } => write!(f, "running (pid {})", pid),
            Self::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(ProcessState, ProcessState),
}

#[derive(Debug)]
pub struct StateMachine {
    state: ProcessState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ProcessState::Stopped,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn transition(&mut self, to: ProcessState) -> Result<(), TransitionError> {
        if self.state.can_transition(&to) {
            tracing::info!("Gateway state: {} -> {}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state.clone(), to))
        }
    }
}
