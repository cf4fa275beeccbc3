//! Sliding-window throughput estimate fed by ACK progress and chunk receipt.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    min_span: Duration,
    samples: VecDeque<(Instant, u64)>,
    last_rate: f64,
}

impl ThroughputMeter {
    pub fn new(window: Duration, min_span: Duration) -> Self {
        Self {
            window,
            min_span,
            samples: VecDeque::new(),
            last_rate: 0.0,
        }
    }

    pub fn record(&mut self, now: Instant, bytes: u64) {
        if bytes > 0 {
            self.samples.push_back((now, bytes));
        }
    }

    /// Prune samples older than the window and return bytes per second over what remains.
    pub fn sample(&mut self, now: Instant) -> f64 {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let Some(&(first, _)) = self.samples.front() else {
            self.last_rate = 0.0;
            return 0.0;
        };
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        let span = now.saturating_duration_since(first).max(self.min_span);
        self.last_rate = total as f64 / span.as_secs_f64();
        self.last_rate
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_rate = 0.0;
    }

    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }
}
