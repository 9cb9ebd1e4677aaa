use std::time::Duration;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Maps the 1-based number of the reconnect attempt about to be scheduled to
/// the delay before it. Pure, so the supervisor never depends on timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed(delay) => *delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let doublings = attempt.saturating_sub(1).min(16);
                let delay = initial.saturating_mul(1u32 << doublings);
                if delay > *max {
                    *max
                } else {
                    delay
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconnectPolicy::Fixed(_) => "fixed",
            ReconnectPolicy::Exponential { .. } => "exponential",
        }
    }
}
