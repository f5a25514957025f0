//! Channel identity: which stream a channel carries and how it is transported.

use serde::{Deserialize, Serialize};

use super::constants::Paths;

/// The stream a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Video,
    Thermal,
    Command,
    Telemetry,
}

impl ChannelKind {
    /// All kinds, in the order a session opens them.
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Video,
        ChannelKind::Thermal,
        ChannelKind::Command,
        ChannelKind::Telemetry,
    ];

    /// Returns `true` for channels that carry image frames.
    pub fn is_image(self) -> bool {
        matches!(self, ChannelKind::Video | ChannelKind::Thermal)
    }

    /// Returns `true` for channels whose traffic counts toward liveness
    /// (image frames and telemetry).
    pub fn is_data(self) -> bool {
        !matches!(self, ChannelKind::Command)
    }

    /// Endpoint path prefix for this kind in the given mode, or `None` when
    /// the kind has no endpoint in that mode (only image channels have a
    /// PushStream alternative).
    pub fn path_prefix(self, mode: ChannelMode) -> Option<&'static str> {
        match (self, mode) {
            (ChannelKind::Video, ChannelMode::SocketStream) => Some(Paths::VIDEO_SOCKET),
            (ChannelKind::Thermal, ChannelMode::SocketStream) => Some(Paths::THERMAL_SOCKET),
            (ChannelKind::Command, ChannelMode::SocketStream) => Some(Paths::COMMAND_SOCKET),
            (ChannelKind::Telemetry, ChannelMode::SocketStream) => Some(Paths::TELEMETRY_SOCKET),
            (ChannelKind::Video, ChannelMode::PushStream) => Some(Paths::VIDEO_MJPEG),
            (ChannelKind::Thermal, ChannelMode::PushStream) => Some(Paths::THERMAL_MJPEG),
            (ChannelKind::Command | ChannelKind::Telemetry, ChannelMode::PushStream) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Video => "video",
            ChannelKind::Thermal => "thermal",
            ChannelKind::Command => "command",
            ChannelKind::Telemetry => "telemetry",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a channel is transported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// One-way `multipart/x-mixed-replace` image stream over HTTP.
    PushStream,

    /// Bidirectional WebSocket.
    #[default]
    SocketStream,
}

impl ChannelMode {
    /// Returns `true` if the transport accepts outbound messages.
    pub fn is_bidirectional(self) -> bool {
        matches!(self, ChannelMode::SocketStream)
    }
}

impl std::fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMode::PushStream => write!(f, "mjpeg"),
            ChannelMode::SocketStream => write!(f, "websocket"),
        }
    }
}
