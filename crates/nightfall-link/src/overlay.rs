use std::time::{Duration, Instant};

use tracing::debug;

/// Single-slot prediction for `state.autonomous`.
#[derive(Debug, Clone, Default)]
pub struct OptimisticOverlay {
    predicted: Option<bool>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl OptimisticOverlay {
    /// `timeout` of `None` keeps an unconfirmed prediction indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            predicted: None,
            deadline: None,
            timeout,
        }
    }

    pub fn predicted(&self) -> Option<bool> {
        self.predicted
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Overwrites any earlier prediction and restarts its timeout.
    pub fn set_prediction(&mut self, value: bool, now: Instant) {
        self.predicted = Some(value);
        self.deadline = self.timeout.map(|timeout| now + timeout);
    }

    pub fn effective(&self, confirmed: bool) -> bool {
        self.predicted.unwrap_or(confirmed)
    }

    /// Clears the prediction once telemetry agrees with it.
    pub fn reconcile(&mut self, confirmed: bool) -> bool {
        if self.predicted == Some(confirmed) {
            debug!(value = confirmed, "prediction_reconciled");
            self.clear();
            return true;
        }
        false
    }

    /// Drops an unconfirmed prediction past its deadline and returns it.
    pub fn expire(&mut self, now: Instant) -> Option<bool> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                let stale = self.predicted.take();
                self.deadline = None;
                stale
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.predicted = None;
        self.deadline = None;
    }
}
