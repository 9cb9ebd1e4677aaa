use chrono::{DateTime, Utc};
use nightfall_core::{TelemetryFragment, TelemetrySnapshot};

/// Sole writer of the canonical snapshot.
#[derive(Debug, Clone, Default)]
pub struct TelemetryReconciler {
    snapshot: TelemetrySnapshot,
    revision: u64,
}

impl TelemetryReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Bumped once per applied fragment.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replaces every section the fragment names and leaves the rest alone.
    /// Returns false, touching nothing, when no section is named.
    pub fn apply_fragment(&mut self, fragment: TelemetryFragment, received_at: DateTime<Utc>) -> bool {
        if fragment.is_empty() {
            return false;
        }
        let TelemetryFragment {
            sensors,
            motors,
            state,
            network,
            control,
            timing,
            server_clients,
        } = fragment;
        let snapshot = &mut self.snapshot;
        if let Some(sensors) = sensors {
            snapshot.sensors = sensors;
        }
        if let Some(motors) = motors {
            snapshot.motors = motors;
        }
        if let Some(state) = state {
            snapshot.state = state;
        }
        if let Some(network) = network {
            snapshot.network = network;
        }
        if let Some(control) = control {
            snapshot.control = control;
        }
        if let Some(timing) = timing {
            snapshot.timing = timing;
        }
        if let Some(server_clients) = server_clients {
            snapshot.server_clients = server_clients;
        }
        snapshot.last_update = Some(received_at);
        self.revision += 1;
        true
    }
}
