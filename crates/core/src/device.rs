//! Device-action types and the collaborator seam.
//!
//! Valet does not drive hardware itself. When the classifier extracts a
//! structured `DeviceCommand`, the dispatcher hands it to whatever
//! `DeviceActions` implementation was injected (home-automation bridge,
//! OS automation, a test stub). Execution failure is never fatal — the
//! dispatcher falls through to normal generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// The fixed grammar of device verbs the classifier recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    TurnOn,
    TurnOff,
    Dim,
    Brighten,
    Lock,
    Unlock,
    Arm,
    Disarm,
    Play,
    Pause,
    SetVolume,
    SetTemperature,
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::Dim => "dim",
            Self::Brighten => "brighten",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Arm => "arm",
            Self::Disarm => "disarm",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::SetVolume => "set_volume",
            Self::SetTemperature => "set_temperature",
        };
        write!(f, "{s}")
    }
}

/// A structured command extracted from free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// The verb
    pub action: DeviceAction,

    /// What the verb applies to ("the lights", "front door")
    pub target: String,

    /// Numeric argument for volume/temperature verbs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
}

/// The device-automation collaborator.
///
/// `execute` returns the user-facing confirmation text on success.
#[async_trait]
pub trait DeviceActions: Send + Sync {
    /// A short name for this backend.
    fn name(&self) -> &str;

    /// Execute a structured command, returning spoken confirmation text.
    async fn execute(&self, command: &DeviceCommand) -> std::result::Result<String, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serialization() {
        let cmd = DeviceCommand {
            action: DeviceAction::SetTemperature,
            target: "thermostat".into(),
            value: Some(72.0),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""action":"set_temperature""#));
        assert!(json.contains("72"));
    }

    #[test]
    fn value_omitted_when_absent() {
        let cmd = DeviceCommand {
            action: DeviceAction::Lock,
            target: "front door".into(),
            value: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("value"));
    }

    #[test]
    fn action_display_names() {
        assert_eq!(DeviceAction::TurnOn.to_string(), "turn_on");
        assert_eq!(DeviceAction::SetVolume.to_string(), "set_volume");
    }
}
