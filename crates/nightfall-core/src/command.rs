use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::parse_bool_flag;

/// Operator-facing command set. The dispatcher stays payload-agnostic; this
/// enum exists so the console cannot misspell a command the device knows.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Rotate360,
    AutoOn,
    AutoOff,
    PidTune { kp: f64, ki: f64, kd: f64 },
    PidEnable { enable: bool },
    Raw { cmd: String, payload: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("{command} is missing argument `{argument}`")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("{command} argument `{argument}` is invalid: {value}")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
        value: String,
    },
    #[error("raw payload must be a json object: {0}")]
    InvalidPayload(String),
}

impl UiCommand {
    pub fn autonomy(enabled: bool) -> Self {
        if enabled {
            UiCommand::AutoOn
        } else {
            UiCommand::AutoOff
        }
    }

    pub fn name(&self) -> &str {
        match self {
            UiCommand::Forward => "forward",
            UiCommand::Backward => "backward",
            UiCommand::Left => "left",
            UiCommand::Right => "right",
            UiCommand::Stop => "stop",
            UiCommand::Rotate360 => "rotate_360",
            UiCommand::AutoOn => "auto_on",
            UiCommand::AutoOff => "auto_off",
            UiCommand::PidTune { .. } => "pid_tune",
            UiCommand::PidEnable { .. } => "pid_enable",
            UiCommand::Raw { cmd, .. } => cmd.as_str(),
        }
    }

    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        match self {
            UiCommand::PidTune { kp, ki, kd } => {
                payload.insert("kP".to_string(), Value::from(*kp));
                payload.insert("kI".to_string(), Value::from(*ki));
                payload.insert("kD".to_string(), Value::from(*kd));
            }
            UiCommand::PidEnable { enable } => {
                payload.insert("enable".to_string(), Value::Bool(*enable));
            }
            UiCommand::Raw { payload: raw, .. } => {
                payload = raw.clone();
            }
            _ => {}
        }
        payload
    }

    /// Manual drive commands, which the device ignores or fights in autonomy.
    pub fn is_movement(&self) -> bool {
        matches!(
            self,
            UiCommand::Forward
                | UiCommand::Backward
                | UiCommand::Left
                | UiCommand::Right
                | UiCommand::Stop
                | UiCommand::Rotate360
        )
    }

    pub fn is_pid(&self) -> bool {
        matches!(self, UiCommand::PidTune { .. } | UiCommand::PidEnable { .. })
    }
}

impl fmt::Display for UiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UiCommand {
    type Err = CommandParseError;

    /// Accepts `forward`, `pid_tune 4 0 1`, `pid_enable off` and
    /// `raw <cmd> [json-object]`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        if head.is_empty() {
            return Err(CommandParseError::Empty);
        }
        match head.to_ascii_lowercase().as_str() {
            "forward" => Ok(UiCommand::Forward),
            "backward" => Ok(UiCommand::Backward),
            "left" => Ok(UiCommand::Left),
            "right" => Ok(UiCommand::Right),
            "stop" => Ok(UiCommand::Stop),
            "rotate_360" => Ok(UiCommand::Rotate360),
            "auto_on" => Ok(UiCommand::AutoOn),
            "auto_off" => Ok(UiCommand::AutoOff),
            "pid_tune" => {
                let mut gains = rest.split_whitespace();
                let kp = parse_gain(gains.next(), "kP")?;
                let ki = parse_gain(gains.next(), "kI")?;
                let kd = parse_gain(gains.next(), "kD")?;
                Ok(UiCommand::PidTune { kp, ki, kd })
            }
            "pid_enable" => {
                if rest.is_empty() {
                    return Err(CommandParseError::MissingArgument {
                        command: "pid_enable",
                        argument: "enable",
                    });
                }
                let enable =
                    parse_bool_flag(rest).ok_or_else(|| CommandParseError::InvalidArgument {
                        command: "pid_enable",
                        argument: "enable",
                        value: rest.to_string(),
                    })?;
                Ok(UiCommand::PidEnable { enable })
            }
            "raw" => parse_raw(rest),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_gain(value: Option<&str>, argument: &'static str) -> Result<f64, CommandParseError> {
    let value = value.ok_or(CommandParseError::MissingArgument {
        command: "pid_tune",
        argument,
    })?;
    value
        .parse::<f64>()
        .ok()
        .filter(|gain| gain.is_finite())
        .ok_or_else(|| CommandParseError::InvalidArgument {
            command: "pid_tune",
            argument,
            value: value.to_string(),
        })
}

fn parse_raw(rest: &str) -> Result<UiCommand, CommandParseError> {
    let (cmd, payload) = match rest.split_once(char::is_whitespace) {
        Some((cmd, payload)) => (cmd, payload.trim()),
        None => (rest, ""),
    };
    if cmd.is_empty() {
        return Err(CommandParseError::MissingArgument {
            command: "raw",
            argument: "cmd",
        });
    }
    let payload = if payload.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Err(CommandParseError::InvalidPayload(other.to_string())),
            Err(err) => return Err(CommandParseError::InvalidPayload(err.to_string())),
        }
    };
    Ok(UiCommand::Raw {
        cmd: cmd.to_string(),
        payload,
    })
}
