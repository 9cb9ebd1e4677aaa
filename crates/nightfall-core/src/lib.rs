//! Wire contracts shared by the Nightfall link runtime and the operator console.

pub mod command;
pub mod protocol;
pub mod telemetry;

pub use command::{CommandParseError, UiCommand};
pub use protocol::{
    decode_inbound, encode_record, CommandRecord, FrameError, FrameKind, HazardAlert,
    InboundFrame, StatusReport, DEFAULT_MAX_FRAME_BYTES,
};
pub use telemetry::{
    ControlReadout, DeviceState, FragmentParse, Motors, NetworkStatus, Section, SectionError,
    Sensors, TelemetryFragment, TelemetrySnapshot, Timing,
};

/// Parses the loose boolean spellings accepted from env vars and operator input.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_flag_accepts_common_spellings() {
        assert_eq!(parse_bool_flag("1"), Some(true));
        assert_eq!(parse_bool_flag(" ON "), Some(true));
        assert_eq!(parse_bool_flag("no"), Some(false));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }
}
