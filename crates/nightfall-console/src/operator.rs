use std::str::FromStr;

use nightfall_core::{CommandParseError, UiCommand};
use nightfall_link::LinkView;
use thiserror::Error;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorAction {
    Command(UiCommand),
    ToggleAutonomy,
    EmergencyStop,
    Quit,
}

impl FromStr for OperatorAction {
    type Err = CommandParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let action = match input.trim().to_ascii_lowercase().as_str() {
            "estop" | "e-stop" | "!" => OperatorAction::EmergencyStop,
            "auto" | "toggle" => OperatorAction::ToggleAutonomy,
            "quit" | "exit" | "q" => OperatorAction::Quit,
            "w" => OperatorAction::Command(UiCommand::Forward),
            "s" => OperatorAction::Command(UiCommand::Backward),
            "a" => OperatorAction::Command(UiCommand::Left),
            "d" => OperatorAction::Command(UiCommand::Right),
            "x" => OperatorAction::Command(UiCommand::Stop),
            _ => OperatorAction::Command(input.parse()?),
        };
        Ok(action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("controls locked: device reports EMERGENCY")]
    Emergency,
    #[error("manual drive disabled while autonomy is on")]
    Autonomous,
    #[error("link is not connected")]
    NotConnected,
}

/// What to hand the link for an accepted action, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub prediction: Option<bool>,
    pub commands: Vec<UiCommand>,
}

/// Applies the dashboard's control rules to the latest view. `Quit` plans to
/// nothing.
pub fn plan(action: &OperatorAction, view: &LinkView) -> Result<Plan, Refusal> {
    match action {
        OperatorAction::EmergencyStop => Ok(Plan {
            prediction: None,
            commands: vec![UiCommand::Stop, UiCommand::AutoOff],
        }),
        OperatorAction::ToggleAutonomy => set_autonomy(!view.effective_autonomous(), view),
        OperatorAction::Quit => Ok(Plan::default()),
        OperatorAction::Command(UiCommand::AutoOn) => set_autonomy(true, view),
        OperatorAction::Command(UiCommand::AutoOff) => set_autonomy(false, view),
        OperatorAction::Command(command) => {
            if command.is_movement() {
                if view.is_emergency() {
                    return Err(Refusal::Emergency);
                }
                if view.effective_autonomous() {
                    return Err(Refusal::Autonomous);
                }
            }
            if command.is_pid() && !view.is_connected() {
                return Err(Refusal::NotConnected);
            }
            Ok(Plan {
                prediction: None,
                commands: vec![command.clone()],
            })
        }
    }
}

fn set_autonomy(enabled: bool, view: &LinkView) -> Result<Plan, Refusal> {
    if view.is_emergency() {
        return Err(Refusal::Emergency);
    }
    Ok(Plan {
        prediction: Some(enabled),
        commands: vec![UiCommand::autonomy(enabled)],
    })
}
