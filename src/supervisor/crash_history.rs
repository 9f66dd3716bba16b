use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 슬라이딩 윈도우 안의 크래시 시각.
///
/// 기록할 때마다 정리되므로 가장 최근 크래시로부터 `window` 이내의
/// 크래시만 임계값에 포함됩니다.
#[derive(Debug, Clone)]
pub struct CrashHistory {
    crashes: VecDeque<Instant>,
    window: Duration,
    threshold: usize,
}

impl CrashHistory {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            crashes: VecDeque::with_capacity(threshold),
            window,
            threshold,
        }
    }

    /// Record a crash at `at` and drop everything outside the window.
    pub fn record(&mut self, at: Instant) {
        self.crashes.push_back(at);
        self.prune(at);
    }

    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }

    /// 남은 크래시가 임계값에 도달했는지 여부. 먼저 `prune`을 호출할 것.
    pub fn is_tripped(&self) -> bool {
        self.threshold > 0 && self.crashes.len() >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn clear(&mut self) {
        self.crashes.clear();
    }
}
