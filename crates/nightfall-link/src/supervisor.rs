use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::backoff::ReconnectPolicy;
use crate::stats::ConnectionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Error => "error",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic failure codes surfaced to the operator. Transport details only go
/// to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkErrorCode {
    #[serde(rename = "connection_failed")]
    ConnectFailed,
    #[serde(rename = "transport_failed")]
    TransportFailed,
}

impl LinkErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkErrorCode::ConnectFailed => "connection_failed",
            LinkErrorCode::TransportFailed => "transport_failed",
        }
    }
}

impl fmt::Display for LinkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effects the owner of the socket must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Open,
    Close,
    ScheduleReconnect(Duration),
    CancelReconnect,
}

/// Link lifecycle state machine. Holds no socket and no timer; it decides and
/// the caller executes the returned [`Directive`]s, feeding the outcomes back.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    policy: ReconnectPolicy,
    status: LinkStatus,
    stats: ConnectionStats,
    reconnect_pending: bool,
    shut_down: bool,
    transitions: Vec<(LinkStatus, LinkStatus)>,
}

impl ConnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            status: LinkStatus::Disconnected,
            stats: ConnectionStats::default(),
            reconnect_pending: false,
            shut_down: false,
            transitions: Vec::new(),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Status changes since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<(LinkStatus, LinkStatus)> {
        std::mem::take(&mut self.transitions)
    }

    /// Idempotent: ignored while a link is open or being opened, and while a
    /// reconnect timer is pending (the timer is neither duplicated nor
    /// cancelled).
    pub fn connect(&mut self) -> Vec<Directive> {
        if self.shut_down {
            debug!("link_connect_ignored: shut down");
            return Vec::new();
        }
        if self.reconnect_pending {
            debug!("link_connect_ignored: reconnect pending");
            return Vec::new();
        }
        match self.status {
            LinkStatus::Disconnected => {
                self.transition(LinkStatus::Connecting);
                vec![Directive::Open]
            }
            LinkStatus::Connecting | LinkStatus::Connected | LinkStatus::Error => Vec::new(),
        }
    }

    pub fn on_open(&mut self, now: DateTime<Utc>) -> Vec<Directive> {
        if self.status != LinkStatus::Connecting || self.shut_down {
            return vec![Directive::Close];
        }
        self.stats.reconnect_attempts = 0;
        self.stats.connected_since = Some(now);
        self.stats.last_error = None;
        self.transition(LinkStatus::Connected);
        Vec::new()
    }

    pub fn on_error(&mut self, code: LinkErrorCode) -> Vec<Directive> {
        match self.status {
            LinkStatus::Connecting | LinkStatus::Connected => {
                self.stats.last_error = Some(code);
                self.transition(LinkStatus::Error);
                vec![Directive::Close]
            }
            LinkStatus::Disconnected | LinkStatus::Error => Vec::new(),
        }
    }

    /// Handles closure, graceful or forced. Schedules exactly one reconnect
    /// unless one is already pending or the link is shutting down.
    pub fn on_close(&mut self) -> Vec<Directive> {
        if self.status == LinkStatus::Disconnected {
            return Vec::new();
        }
        self.stats.connected_since = None;
        self.transition(LinkStatus::Disconnected);
        if self.shut_down || self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = true;
        let delay = self
            .policy
            .delay_for(self.stats.reconnect_attempts.saturating_add(1));
        vec![Directive::ScheduleReconnect(delay)]
    }

    pub fn on_reconnect_due(&mut self) -> Vec<Directive> {
        if !self.reconnect_pending || self.shut_down {
            return Vec::new();
        }
        self.reconnect_pending = false;
        if self.status != LinkStatus::Disconnected {
            return Vec::new();
        }
        self.stats.reconnect_attempts = self.stats.reconnect_attempts.saturating_add(1);
        info!(
            attempt = self.stats.reconnect_attempts,
            "link_reconnect_attempt"
        );
        self.transition(LinkStatus::Connecting);
        vec![Directive::Open]
    }

    /// Session end: cancels the pending timer and closes without reconnecting.
    pub fn shutdown(&mut self) -> Vec<Directive> {
        if self.shut_down {
            return Vec::new();
        }
        self.shut_down = true;
        let mut directives = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            directives.push(Directive::CancelReconnect);
        }
        if self.status != LinkStatus::Disconnected {
            directives.push(Directive::Close);
        }
        directives
    }

    pub fn record_frame(&mut self, now: DateTime<Utc>) {
        self.stats.msgs_received = self.stats.msgs_received.saturating_add(1);
        self.stats.last_msg_time = Some(now);
    }

    pub fn record_malformed(&mut self) {
        self.stats.frames_malformed = self.stats.frames_malformed.saturating_add(1);
    }

    pub fn record_rejected_sections(&mut self, count: usize) {
        self.stats.sections_rejected = self.stats.sections_rejected.saturating_add(count as u64);
    }

    pub fn record_latency(&mut self, latency_ms: i64) {
        self.stats.last_latency_ms = Some(latency_ms);
    }

    pub fn record_rate(&mut self, rate: u32) {
        self.stats.msg_rate = rate;
    }

    fn transition(&mut self, next: LinkStatus) {
        if self.status == next {
            return;
        }
        info!(from = %self.status, to = %next, "link_status");
        self.transitions.push((self.status, next));
        self.status = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(ReconnectPolicy::Fixed(Duration::from_millis(2500)))
    }

    fn visited(supervisor: &mut ConnectionSupervisor) -> Vec<LinkStatus> {
        supervisor
            .take_transitions()
            .into_iter()
            .map(|(_, to)| to)
            .collect()
    }

    #[test]
    fn scripted_session_visits_each_status_once() {
        let mut sup = supervisor();
        assert_eq!(sup.connect(), vec![Directive::Open]);
        assert!(sup.on_open(Utc::now()).is_empty());
        sup.record_frame(Utc::now());
        assert_eq!(sup.on_error(LinkErrorCode::TransportFailed), vec![Directive::Close]);
        assert_eq!(
            sup.on_close(),
            vec![Directive::ScheduleReconnect(Duration::from_millis(2500))]
        );
        assert!(sup.on_close().is_empty());

        assert_eq!(
            visited(&mut sup),
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Error,
                LinkStatus::Disconnected,
            ]
        );
        assert_eq!(sup.stats().msgs_received, 1);
        assert_eq!(sup.stats().last_error, Some(LinkErrorCode::TransportFailed));
        assert!(sup.stats().connected_since.is_none());
    }

    #[test]
    fn connect_is_idempotent_while_open_or_opening() {
        let mut sup = supervisor();
        assert_eq!(sup.connect(), vec![Directive::Open]);
        assert!(sup.connect().is_empty());
        sup.on_open(Utc::now());
        assert!(sup.connect().is_empty());
        assert_eq!(sup.status(), LinkStatus::Connected);
    }

    #[test]
    fn pending_reconnect_is_single_flight() {
        let mut sup = supervisor();
        sup.connect();
        sup.on_error(LinkErrorCode::ConnectFailed);
        let scheduled = sup.on_close();
        assert_eq!(scheduled.len(), 1);
        assert!(sup.reconnect_pending());

        assert!(sup.connect().is_empty());
        assert!(sup.connect().is_empty());
        assert!(sup.reconnect_pending());
        assert_eq!(sup.status(), LinkStatus::Disconnected);

        assert_eq!(sup.on_reconnect_due(), vec![Directive::Open]);
        assert!(sup.on_reconnect_due().is_empty());
        assert_eq!(sup.stats().reconnect_attempts, 1);
        assert_eq!(sup.status(), LinkStatus::Connecting);
    }

    #[test]
    fn attempts_accumulate_until_a_successful_open() {
        let mut sup = supervisor();
        sup.connect();
        for expected in 1..=3 {
            sup.on_error(LinkErrorCode::ConnectFailed);
            sup.on_close();
            sup.on_reconnect_due();
            assert_eq!(sup.stats().reconnect_attempts, expected);
        }
        sup.on_open(Utc::now());
        assert_eq!(sup.stats().reconnect_attempts, 0);
        assert!(sup.stats().last_error.is_none());
        assert!(sup.stats().connected_since.is_some());
    }

    #[test]
    fn growing_policy_changes_delay_not_transitions() {
        let mut sup = ConnectionSupervisor::new(ReconnectPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        });
        sup.connect();
        let mut delays = Vec::new();
        for _ in 0..4 {
            sup.on_error(LinkErrorCode::ConnectFailed);
            match sup.on_close().as_slice() {
                [Directive::ScheduleReconnect(delay)] => delays.push(*delay),
                other => panic!("unexpected directives: {other:?}"),
            }
            sup.on_reconnect_due();
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn shutdown_cancels_timer_and_suppresses_reconnect() {
        let mut sup = supervisor();
        sup.connect();
        sup.on_open(Utc::now());
        assert_eq!(sup.shutdown(), vec![Directive::Close]);
        assert!(sup.on_close().is_empty());
        assert_eq!(sup.status(), LinkStatus::Disconnected);
        assert!(!sup.reconnect_pending());
        assert!(sup.connect().is_empty());

        let mut sup = supervisor();
        sup.connect();
        sup.on_error(LinkErrorCode::ConnectFailed);
        sup.on_close();
        assert_eq!(sup.shutdown(), vec![Directive::CancelReconnect]);
        assert!(sup.on_reconnect_due().is_empty());
    }

    #[test]
    fn stray_open_after_shutdown_is_closed() {
        let mut sup = supervisor();
        sup.connect();
        sup.shutdown();
        assert_eq!(sup.on_open(Utc::now()), vec![Directive::Close]);
    }

    #[test]
    fn graceful_close_from_connected_schedules_reconnect() {
        let mut sup = supervisor();
        sup.connect();
        sup.on_open(Utc::now());
        let directives = sup.on_close();
        assert_eq!(
            directives,
            vec![Directive::ScheduleReconnect(Duration::from_millis(2500))]
        );
        assert!(sup.stats().last_error.is_none());
    }
}
