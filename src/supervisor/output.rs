//! Worker output capture.
//!
//! stdout and stderr are drained by independent tasks into one bounded
//! [`LogBuffer`], so a full pipe never stalls the worker even when nobody
//! reads the log.

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default character budget of the output log.
pub const DEFAULT_LOG_BUDGET: usize = 20_000;

pub type SharedLog = Arc<Mutex<LogBuffer>>;

// ─── Log Buffer ──────────────────────────────────────────────

/// Text buffer that keeps at most `budget` characters, dropping the oldest.
#[derive(Debug)]
pub struct LogBuffer {
    text: String,
    /// Character (not byte) count of `text`.
    chars: usize,
    budget: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_LOG_BUDGET)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            budget,
        }
    }

    pub fn shared(budget: usize) -> SharedLog {
        Arc::new(Mutex::new(Self::with_budget(budget)))
    }

    pub fn push(&mut self, s: &str) {
        self.text.push_str(s);
        self.chars += s.chars().count();
        if self.chars > self.budget {
            let excess = self.chars - self.budget;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars -= excess;
        }
    }

    /// Append `line` followed by a newline.
    pub fn push_line(&mut self, line: &str) {
        self.push(line);
        self.push("\n");
    }

    pub fn snapshot(&self) -> String {
        self.text.clone()
    }

    pub fn char_len(&self) -> usize {
        self.chars
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Stream pumps ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Drain `reader` line by line into `log` until EOF.
///
/// Bytes that are not valid UTF-8 are kept lossily; only a read error is
/// recorded as one diagnostic line, and it ends this stream only.
pub fn pump<R>(name: StreamName, reader: R, log: SharedLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(trim_line_end(&buf));
                    log.lock().await.push_line(&line);
                }
                Err(e) => {
                    tracing::warn!("Gateway {} read failed: {}", name, e);
                    log.lock()
                        .await
                        .push_line(&format!("[keeper] {} stream error: {}", name, e));
                    break;
                }
            }
        }
    })
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ─── Tests ───────────────────────────────────────────────────
