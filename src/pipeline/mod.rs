//! The three processing pipelines and their shared plumbing.
//!
//! Each pipeline pairs a producer (a store query feeding an in-memory
//! batch) with a single-concurrency processor. Producers are rate
//! limited; pipelines signal each other through dispatchers when new
//! downstream work exists.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub mod analyzer;
pub mod crf_search;
pub mod encoder;

pub use analyzer::AnalyzerPipeline;
pub use crf_search::CrfSearchPipeline;
pub use encoder::EncoderPipeline;

/// How long an idle producer sleeps before re-polling the store, absent a
/// dispatch signal.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-stage retry budget before a recoverable failure stops being rolled
/// back for another attempt.
pub const STAGE_RETRY_BUDGET: i64 = 3;

/// Admits at most `allowed` messages per interval window.
#[derive(Debug)]
pub struct RateLimiter {
    allowed: u32,
    interval: Duration,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(allowed: u32, interval: Duration) -> Self {
        Self {
            allowed: allowed.max(1),
            interval,
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Waits until the current window has room for one more message.
    pub async fn admit(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.interval {
            self.window_start = now;
            self.used = 0;
        }
        if self.used >= self.allowed {
            let reopen = self.window_start + self.interval;
            tokio::time::sleep_until(reopen).await;
            self.window_start = Instant::now();
            self.used = 0;
        }
        self.used += 1;
    }
}

/// Wakes a producer when upstream has put new work in the store.
#[derive(Clone, Default)]
pub struct Dispatcher {
    notify: Arc<Notify>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_available(&self) {
        self.notify.notify_one();
    }

    /// Waits for a dispatch signal, or until the idle poll interval
    /// elapses. The producer re-queries the store either way.
    pub async fn wait(&self) {
        let _ = tokio::time::timeout(IDLE_POLL_INTERVAL, self.notify.notified()).await;
    }
}

/// The last N lines of subprocess output, kept for failure records.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            text.push_str(line);
        }
        text
    }
}
