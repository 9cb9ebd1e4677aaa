use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::supervisor::LinkErrorCode;

/// Link health counters. Written by the supervisor and the rate sampler only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionStats {
    pub msg_rate: u32,
    /// Frames that decoded structurally. Accumulates across reconnects.
    pub msgs_received: u64,
    pub last_msg_time: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub last_error: Option<LinkErrorCode>,
    pub frames_malformed: u64,
    pub sections_rejected: u64,
    pub last_latency_ms: Option<i64>,
    /// Mirrored from the dispatcher when the view is published.
    pub commands_sent: u64,
    pub commands_dropped: u64,
}

/// Rolling inbound message counter, sampled once per window.
#[derive(Debug, Clone)]
pub struct RateSampler {
    window: Duration,
    window_start: Instant,
    count: u64,
}

impl RateSampler {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            count: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn pending(&self) -> u64 {
        self.count
    }

    /// Closes the current window and returns its rate in messages/second.
    /// Divides by the time actually elapsed, so a late tick does not inflate
    /// the figure.
    pub fn sample(&mut self, now: Instant) -> Option<u32> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.is_zero() {
            return None;
        }
        let rate = (self.count as f64 / elapsed.as_secs_f64()).round();
        self.count = 0;
        self.window_start = now;
        Some(rate.min(u32::MAX as f64) as u32)
    }
}
