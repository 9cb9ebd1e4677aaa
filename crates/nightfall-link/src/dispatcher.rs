use nightfall_core::{encode_record, CommandRecord, FrameError, DEFAULT_MAX_FRAME_BYTES};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::supervisor::LinkStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("link is {0}, command dropped")]
    NotConnected(LinkStatus),
    #[error(transparent)]
    Encode(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Turns command records into wire frames. Never queues or retries: a command
/// issued while the link is not open is dropped on the spot.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    max_frame_bytes: usize,
    stats: DispatchStats,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl CommandDispatcher {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// `{type: command_type, ...payload}`.
    pub fn send(
        &mut self,
        status: LinkStatus,
        command_type: &str,
        payload: Map<String, Value>,
    ) -> Result<String, DispatchError> {
        self.prepare(status, &CommandRecord::new(command_type, payload))
    }

    /// `{type: "ui_cmd", cmd, ...payload}`.
    pub fn send_ui_cmd(
        &mut self,
        status: LinkStatus,
        cmd: &str,
        payload: Map<String, Value>,
    ) -> Result<String, DispatchError> {
        self.prepare(status, &CommandRecord::ui_cmd(cmd, payload))
    }

    /// Checks the precondition and encodes. The caller writes the frame and
    /// then reports the outcome with [`mark_sent`](Self::mark_sent) or
    /// [`mark_dropped`](Self::mark_dropped).
    pub fn prepare(
        &mut self,
        status: LinkStatus,
        record: &CommandRecord,
    ) -> Result<String, DispatchError> {
        if status != LinkStatus::Connected {
            self.mark_dropped();
            warn!(
                status = %status,
                command_type = record.command_type(),
                cmd = record.cmd().unwrap_or_default(),
                "command_dropped"
            );
            return Err(DispatchError::NotConnected(status));
        }
        encode_record(record, self.max_frame_bytes).map_err(|err| {
            self.mark_dropped();
            warn!(
                command_type = record.command_type(),
                error = %err,
                "command_encode_failed"
            );
            DispatchError::from(err)
        })
    }

    pub fn mark_sent(&mut self) {
        self.stats.sent = self.stats.sent.saturating_add(1);
    }

    pub fn mark_dropped(&mut self) {
        self.stats.dropped = self.stats.dropped.saturating_add(1);
    }
}
