//! Protocol constants: endpoint paths, HTTP routes and form field defaults.

/// Endpoint path prefixes served by the relay server.
///
/// The device id is appended as the final path segment.
pub struct Paths;

impl Paths {
    // ─── SocketStream (WebSocket) ───────────────────────────────────

    /// Binary JPEG frames from the main camera.
    pub const VIDEO_SOCKET: &'static str = "/ws/video/client";

    /// Binary JPEG frames from the thermal camera.
    pub const THERMAL_SOCKET: &'static str = "/ws/thermal/client";

    /// Bidirectional JSON command channel.
    pub const COMMAND_SOCKET: &'static str = "/ws/command/client";

    /// Text telemetry pushed by the robot.
    pub const TELEMETRY_SOCKET: &'static str = "/ws/telemetry/client";

    // ─── PushStream (MJPEG over HTTP) ───────────────────────────────

    /// `multipart/x-mixed-replace` stream of the main camera.
    pub const VIDEO_MJPEG: &'static str = "/mjpeg";

    /// `multipart/x-mixed-replace` stream of the thermal camera.
    pub const THERMAL_MJPEG: &'static str = "/mjpeg/thermal";

    // ─── Registry (HTTP JSON) ───────────────────────────────────────

    /// List robots; `?online=1` filters to connected ones.
    pub const ROBOTS: &'static str = "/api/robots";

    /// Register this control client.
    pub const REGISTER_CLIENT: &'static str = "/api/clients/register";
}

/// Query parameter used to defeat caching of PushStream URLs.
pub const CACHE_BUSTER_PARAM: &str = "t";

/// Default multipart field name carrying the captured JPEG.
pub const DEFAULT_IMAGE_FIELD: &str = "file";

/// File name sent with the captured JPEG part.
pub const CAPTURE_FILE_NAME: &str = "capture.jpg";

/// MIME type of captured frames.
pub const JPEG_MIME: &str = "image/jpeg";
