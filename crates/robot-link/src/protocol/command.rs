//! Command channel payloads and the drive vocabulary understood by the robot.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// JSON message sent on the command channel.
///
/// `speed` is present for drive commands and omitted for free-text commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub client_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Epoch milliseconds at send time.
    pub ts: u64,
}

impl CommandMessage {
    /// Build a message stamped with the current wall-clock time.
    pub fn new(client_id: impl Into<String>, command: impl Into<String>, speed: Option<f64>) -> Self {
        Self {
            client_id: client_id.into(),
            command: command.into(),
            speed,
            ts: epoch_millis(),
        }
    }
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Motor commands understood by the rover firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveCommand {
    MoveForward,
    MoveBack,
    MoveLeft,
    MoveRight,
    ForwardStop,
    BackStop,
    LeftStop,
    RightStop,
    Stop,
}

impl DriveCommand {
    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            DriveCommand::MoveForward => "MOVE_FORWARD",
            DriveCommand::MoveBack => "MOVE_BACK",
            DriveCommand::MoveLeft => "MOVE_LEFT",
            DriveCommand::MoveRight => "MOVE_RIGHT",
            DriveCommand::ForwardStop => "FORWARD_STOP",
            DriveCommand::BackStop => "BACK_STOP",
            DriveCommand::LeftStop => "LEFT_STOP",
            DriveCommand::RightStop => "RIGHT_STOP",
            DriveCommand::Stop => "STOP",
        }
    }

    /// The command that ends this motion, for hold-to-drive controls.
    pub fn release(self) -> DriveCommand {
        match self {
            DriveCommand::MoveForward => DriveCommand::ForwardStop,
            DriveCommand::MoveBack => DriveCommand::BackStop,
            DriveCommand::MoveLeft => DriveCommand::LeftStop,
            DriveCommand::MoveRight => DriveCommand::RightStop,
            other => other,
        }
    }

    /// WASD mapping for a key press. Case-insensitive.
    pub fn for_key_press(key: char) -> Option<DriveCommand> {
        match key.to_ascii_lowercase() {
            'w' => Some(DriveCommand::MoveForward),
            's' => Some(DriveCommand::MoveBack),
            'a' => Some(DriveCommand::MoveLeft),
            'd' => Some(DriveCommand::MoveRight),
            _ => None,
        }
    }

    /// WASD mapping for a key release.
    pub fn for_key_release(key: char) -> Option<DriveCommand> {
        Self::for_key_press(key).map(DriveCommand::release)
    }
}

impl std::fmt::Display for DriveCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriveCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [DriveCommand; 9] = [
            DriveCommand::MoveForward,
            DriveCommand::MoveBack,
            DriveCommand::MoveLeft,
            DriveCommand::MoveRight,
            DriveCommand::ForwardStop,
            DriveCommand::BackStop,
            DriveCommand::LeftStop,
            DriveCommand::RightStop,
            DriveCommand::Stop,
        ];
        ALL.into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown drive command: {s}"))
    }
}
