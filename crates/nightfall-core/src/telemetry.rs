use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Distance and gas readings. Units are cm / cm / ppm by convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Sensors {
    pub front_dist: f64,
    pub rear_dist: f64,
    pub gas: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Motors {
    pub front_left: i32,
    pub front_right: i32,
    pub rear_left: i32,
    pub rear_right: i32,
}

/// FSM and navigation labels are opaque; new firmware labels pass through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    pub fsm: String,
    pub autonomous: bool,
    pub nav_state: String,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            fsm: "INIT".to_string(),
            autonomous: false,
            nav_state: "idle".to_string(),
        }
    }
}

impl DeviceState {
    pub fn is_emergency(&self) -> bool {
        self.fsm.eq_ignore_ascii_case("EMERGENCY")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkStatus {
    pub front: bool,
    pub camera: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControlReadout {
    pub out: f64,
    pub err: f64,
    pub sp: f64,
    #[serde(rename = "P")]
    pub p: f64,
    #[serde(rename = "I")]
    pub i: f64,
    #[serde(rename = "D")]
    pub d: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Timing {
    pub loop_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelemetrySnapshot {
    pub sensors: Sensors,
    pub motors: Motors,
    pub state: DeviceState,
    pub network: NetworkStatus,
    pub control: ControlReadout,
    pub timing: Timing,
    pub server_clients: u32,
    #[serde(rename = "lastUpdate")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Sensors,
    Motors,
    State,
    Network,
    Control,
    Timing,
    ServerClients,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::Sensors,
        Section::Motors,
        Section::State,
        Section::Network,
        Section::Control,
        Section::Timing,
        Section::ServerClients,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Sensors => "sensors",
            Section::Motors => "motors",
            Section::State => "state",
            Section::Network => "network",
            Section::Control => "control",
            Section::Timing => "timing",
            Section::ServerClients => "server_clients",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("telemetry section `{section}` rejected: {message}")]
pub struct SectionError {
    pub section: Section,
    pub message: String,
}

/// A partial update. `None` means the device did not name that section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryFragment {
    pub sensors: Option<Sensors>,
    pub motors: Option<Motors>,
    pub state: Option<DeviceState>,
    pub network: Option<NetworkStatus>,
    pub control: Option<ControlReadout>,
    pub timing: Option<Timing>,
    pub server_clients: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FragmentParse {
    pub fragment: TelemetryFragment,
    pub errors: Vec<SectionError>,
}

impl TelemetryFragment {
    /// Picks the recognized sections out of a frame body. Unknown keys are
    /// ignored; a malformed section is reported and left out on its own.
    pub fn from_body(body: &Map<String, Value>) -> FragmentParse {
        let mut errors = Vec::new();
        let fragment = TelemetryFragment {
            sensors: take_section(body, Section::Sensors, &mut errors),
            motors: take_section(body, Section::Motors, &mut errors),
            state: take_section(body, Section::State, &mut errors),
            network: take_section(body, Section::Network, &mut errors),
            control: take_section(body, Section::Control, &mut errors),
            timing: take_section(body, Section::Timing, &mut errors),
            server_clients: take_section(body, Section::ServerClients, &mut errors),
        };
        FragmentParse { fragment, errors }
    }

    pub fn sections(&self) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|section| self.names(*section))
            .collect()
    }

    pub fn names(&self, section: Section) -> bool {
        match section {
            Section::Sensors => self.sensors.is_some(),
            Section::Motors => self.motors.is_some(),
            Section::State => self.state.is_some(),
            Section::Network => self.network.is_some(),
            Section::Control => self.control.is_some(),
            Section::Timing => self.timing.is_some(),
            Section::ServerClients => self.server_clients.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !Section::ALL.iter().any(|section| self.names(*section))
    }
}

fn take_section<T: DeserializeOwned>(
    body: &Map<String, Value>,
    section: Section,
    errors: &mut Vec<SectionError>,
) -> Option<T> {
    let value = body.get(section.as_str())?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<T>(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            errors.push(SectionError {
                section,
                message: err.to_string(),
            });
            None
        }
    }
}
