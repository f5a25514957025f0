//! # Configuration
//!
//! [`LinkConfig`] holds everything needed to reach the relay server, the
//! inference endpoint, and to tune liveness detection.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. File named by the `ROBOT_LINK_CONFIG` environment variable
//! 4. `./robot-link.toml` in the current directory
//! 5. `~/.config/robot-link/robot-link.toml`
//! 6. Environment variables only (`ROBOT_LINK_SERVER_URL`, ...)
//!
//! Individual fields can always be overridden by environment variables,
//! even when loading from a file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{LinkError, LinkResult};
use crate::protocol::constants::{CACHE_BUSTER_PARAM, DEFAULT_IMAGE_FIELD};
use crate::protocol::{ChannelKind, ChannelMode, epoch_millis};

/// Default client id announced in command messages.
pub const DEFAULT_CLIENT_ID: &str = "rust-control";

/// Environment variable naming the relay server origin.
pub const ENV_SERVER_URL: &str = "ROBOT_LINK_SERVER_URL";
/// Environment variable naming the default device.
pub const ENV_DEVICE_ID: &str = "ROBOT_LINK_DEVICE_ID";
/// Environment variable overriding the client id.
pub const ENV_CLIENT_ID: &str = "ROBOT_LINK_CLIENT_ID";
/// Environment variable naming the inference endpoint.
pub const ENV_INFERENCE_URL: &str = "ROBOT_LINK_INFERENCE_URL";
/// Environment variable pointing at a config file.
pub const ENV_CONFIG_PATH: &str = "ROBOT_LINK_CONFIG";

/// No frame or telemetry for this long means the robot is offline.
const DEFAULT_OFFLINE_AFTER_MS: u64 = 10_000;

/// How often the liveness monitor evaluates the session.
const DEFAULT_CHECK_INTERVAL_MS: u64 = 2_000;

/// Inference request timeout in seconds.
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 30;

/// Channel handshake timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Registry HTTP timeout in seconds.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Default motor speed for drive commands (percent duty cycle).
const DEFAULT_DRIVE_SPEED: f64 = 70.0;

/// Configuration for a robot-link client.
///
/// # Examples
///
/// ```
/// use robot_link::config::LinkConfig;
///
/// let config = LinkConfig::new("https://relay.example.com");
/// assert_eq!(config.client_id, "rust-control");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Relay server origin, `http(s)://` or `ws(s)://`.
    pub server_url: String,

    /// Device used when a command does not name one.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Client id stamped on command messages and used for registration.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Main camera channel.
    #[serde(default)]
    pub video: StreamConfig,

    /// Thermal camera channel.
    #[serde(default)]
    pub thermal: ThermalConfig,

    /// Telemetry channel.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Offline detection.
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Capture-and-classify endpoint.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Transport timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Drive defaults.
    #[serde(default)]
    pub drive: DriveConfig,
}

/// Transport selection for the main camera.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub mode: ChannelMode,
}

/// Thermal camera channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: ChannelMode,
}

/// Telemetry channel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Liveness thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Silence longer than this demotes the session to offline, in milliseconds.
    #[serde(default = "default_offline_after")]
    pub offline_after_ms: u64,

    /// Evaluation interval, in milliseconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
}

/// Inference endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// `POST` endpoint accepting a multipart JPEG upload. Capture is
    /// unavailable when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Multipart field name carrying the image.
    #[serde(default = "default_image_field")]
    pub image_field: String,

    /// Upper bound on the whole request, in seconds.
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
}

/// Timeouts for the relay server transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// WebSocket handshake / MJPEG response headers, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Registry requests, in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

/// Drive command defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_drive_speed")]
    pub default_speed: f64,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_true() -> bool {
    true
}

fn default_offline_after() -> u64 {
    DEFAULT_OFFLINE_AFTER_MS
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

fn default_image_field() -> String {
    DEFAULT_IMAGE_FIELD.to_string()
}

fn default_inference_timeout() -> u64 {
    DEFAULT_INFERENCE_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_drive_speed() -> f64 {
    DEFAULT_DRIVE_SPEED
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ChannelMode::SocketStream,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            offline_after_ms: DEFAULT_OFFLINE_AFTER_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
        }
    }
}

impl LivenessConfig {
    pub fn offline_after(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: None,
            image_field: DEFAULT_IMAGE_FIELD.to_string(),
            timeout_secs: DEFAULT_INFERENCE_TIMEOUT_SECS,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            default_speed: DEFAULT_DRIVE_SPEED,
        }
    }
}

// ─── LinkConfig impl ────────────────────────────────────────────────────

impl LinkConfig {
    /// Create a config for a server origin (all other fields use defaults).
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            device_id: None,
            client_id: default_client_id(),
            video: StreamConfig::default(),
            thermal: ThermalConfig::default(),
            telemetry: TelemetryConfig::default(),
            liveness: LivenessConfig::default(),
            inference: InferenceConfig::default(),
            timeouts: TimeoutConfig::default(),
            drive: DriveConfig::default(),
        }
    }

    /// Load config from environment variables.
    ///
    /// Required: `ROBOT_LINK_SERVER_URL`
    ///
    /// Optional: `ROBOT_LINK_DEVICE_ID`, `ROBOT_LINK_CLIENT_ID`, `ROBOT_LINK_INFERENCE_URL`
    pub fn from_env() -> LinkResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LinkResult<Self> {
        let server_url = lookup(ENV_SERVER_URL).ok_or_else(|| LinkError::ConfigError {
            reason: format!("{ENV_SERVER_URL} environment variable not set"),
        })?;
        let mut config = Self::new(server_url);
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Load config from a TOML file, with environment variable overrides.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> LinkResult<Self> {
        Self::from_file_with(path.as_ref(), |key| std::env::var(key).ok())
    }

    #[cfg(feature = "config-toml")]
    fn from_file_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> LinkResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| LinkError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `ROBOT_LINK_CONFIG` environment variable
    /// 3. `./robot-link.toml`
    /// 4. `~/.config/robot-link/robot-link.toml`
    ///
    /// Falls back to environment-variable-only config if no file is found.
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&Path>) -> LinkResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("robot-link.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(config_path) = dirs_config_path() {
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        Self::from_env()
    }

    /// Without TOML support only the environment is consulted.
    #[cfg(not(feature = "config-toml"))]
    pub fn discover(_explicit_path: Option<&Path>) -> LinkResult<Self> {
        Self::from_env()
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server_url = url;
        }
        if let Some(device) = lookup(ENV_DEVICE_ID) {
            self.device_id = Some(device);
        }
        if let Some(client) = lookup(ENV_CLIENT_ID) {
            self.client_id = client;
        }
        if let Some(url) = lookup(ENV_INFERENCE_URL) {
            self.inference.url = Some(url);
        }
    }

    /// Reject values that would make the client misbehave at runtime.
    pub fn validate(&self) -> LinkResult<()> {
        self.http_base()?;
        if self.liveness.offline_after_ms == 0 || self.liveness.check_interval_ms == 0 {
            return Err(LinkError::ConfigError {
                reason: "liveness offline_after_ms and check_interval_ms must be non-zero".into(),
            });
        }
        if self.inference.timeout_secs == 0 {
            return Err(LinkError::ConfigError {
                reason: "inference timeout_secs must be non-zero".into(),
            });
        }
        if let Some(url) = &self.inference.url {
            Url::parse(url)?;
        }
        Ok(())
    }

    // ─── URL derivation ─────────────────────────────────────────────

    /// Server origin with an `http`/`https` scheme.
    pub fn http_base(&self) -> LinkResult<Url> {
        let mut url = Url::parse(self.server_url.trim())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => {
                return Err(LinkError::ConfigError {
                    reason: format!("unsupported server URL scheme '{other}'"),
                });
            }
        };
        set_scheme(&mut url, scheme)?;
        Ok(url)
    }

    /// Server origin with a `ws`/`wss` scheme.
    pub fn ws_base(&self) -> LinkResult<Url> {
        let mut url = self.http_base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        set_scheme(&mut url, scheme)?;
        Ok(url)
    }

    /// Full endpoint URL for one channel of `device_id`.
    ///
    /// PushStream URLs carry a cache-busting timestamp.
    pub fn channel_url(
        &self,
        kind: ChannelKind,
        mode: ChannelMode,
        device_id: &str,
    ) -> LinkResult<String> {
        let prefix = kind.path_prefix(mode).ok_or_else(|| LinkError::ConfigError {
            reason: format!("{kind} channel has no {mode} endpoint"),
        })?;
        let base = match mode {
            ChannelMode::SocketStream => self.ws_base()?,
            ChannelMode::PushStream => self.http_base()?,
        };
        let mut url = join_path(base, prefix, Some(device_id))?;
        if mode == ChannelMode::PushStream {
            url.query_pairs_mut()
                .append_pair(CACHE_BUSTER_PARAM, &epoch_millis().to_string());
        }
        Ok(url.into())
    }

    /// Full URL of an HTTP API route on the relay server.
    pub fn api_url(&self, path: &str) -> LinkResult<Url> {
        join_path(self.http_base()?, path, None)
    }

    /// Transport mode configured for a channel kind.
    pub fn mode_for(&self, kind: ChannelKind) -> ChannelMode {
        match kind {
            ChannelKind::Video => self.video.mode,
            ChannelKind::Thermal => self.thermal.mode,
            ChannelKind::Command | ChannelKind::Telemetry => ChannelMode::SocketStream,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn set_scheme(url: &mut Url, scheme: &str) -> LinkResult<()> {
    url.set_scheme(scheme).map_err(|()| LinkError::ConfigError {
        reason: format!("cannot use scheme '{scheme}' for {url}"),
    })
}

fn join_path(mut url: Url, prefix: &str, last: Option<&str>) -> LinkResult<Url> {
    {
        let mut segments = url.path_segments_mut().map_err(|()| LinkError::ConfigError {
            reason: "server URL cannot be a base".into(),
        })?;
        segments.pop_if_empty();
        segments.extend(prefix.split('/').filter(|s| !s.is_empty()));
        if let Some(last) = last {
            segments.push(last);
        }
    }
    Ok(url)
}

/// Platform-appropriate config file path.
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("robot-link").join("robot-link.toml"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("robot-link")
                .join("robot-link.toml")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "robot-link-config-tests-{}-{}-{}",
            label,
            std::process::id(),
            now
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_new_defaults() {
        let config = LinkConfig::new("https://relay.example.com");
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.video.mode, ChannelMode::SocketStream);
        assert!(config.thermal.enabled);
        assert!(!config.telemetry.enabled);
        assert_eq!(config.liveness.offline_after(), Duration::from_secs(10));
        assert_eq!(config.liveness.check_interval(), Duration::from_secs(2));
        assert_eq!(config.inference.image_field, "file");
        assert_eq!(config.inference.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ws_base_swaps_scheme() {
        let secure = LinkConfig::new("https://relay.example.com/");
        assert_eq!(secure.ws_base().unwrap().scheme(), "wss");
        let plain = LinkConfig::new("http://127.0.0.1:8000");
        assert_eq!(plain.ws_base().unwrap().scheme(), "ws");
        let already_ws = LinkConfig::new("wss://relay.example.com");
        assert_eq!(already_ws.http_base().unwrap().scheme(), "https");
    }

    #[test]
    fn test_channel_urls() {
        let config = LinkConfig::new("https://relay.example.com/");
        assert_eq!(
            config
                .channel_url(ChannelKind::Video, ChannelMode::SocketStream, "Agraid")
                .unwrap(),
            "wss://relay.example.com/ws/video/client/Agraid"
        );
        assert_eq!(
            config
                .channel_url(ChannelKind::Command, ChannelMode::SocketStream, "robot 1")
                .unwrap(),
            "wss://relay.example.com/ws/command/client/robot%201"
        );

        let mjpeg = config
            .channel_url(ChannelKind::Thermal, ChannelMode::PushStream, "Agraid")
            .unwrap();
        assert!(
            mjpeg.starts_with("https://relay.example.com/mjpeg/thermal/Agraid?t="),
            "unexpected url: {mjpeg}"
        );

        assert!(matches!(
            config.channel_url(ChannelKind::Command, ChannelMode::PushStream, "x"),
            Err(LinkError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_server_url_with_base_path() {
        let config = LinkConfig::new("http://host:9000/relay");
        assert_eq!(
            config
                .channel_url(ChannelKind::Telemetry, ChannelMode::SocketStream, "r1")
                .unwrap(),
            "ws://host:9000/relay/ws/telemetry/client/r1"
        );
        assert_eq!(
            config.api_url("/api/robots").unwrap().as_str(),
            "http://host:9000/relay/api/robots"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let ftp = LinkConfig::new("ftp://relay.example.com");
        assert!(matches!(ftp.validate(), Err(LinkError::ConfigError { .. })));

        let mut zero = LinkConfig::new("http://localhost");
        zero.liveness.check_interval_ms = 0;
        assert!(zero.validate().is_err());

        let mut bad_inference = LinkConfig::new("http://localhost");
        bad_inference.inference.url = Some("::nope".into());
        assert!(bad_inference.validate().is_err());
    }

    #[test]
    fn test_mode_for() {
        let mut config = LinkConfig::new("http://localhost");
        config.video.mode = ChannelMode::PushStream;
        assert_eq!(config.mode_for(ChannelKind::Video), ChannelMode::PushStream);
        assert_eq!(config.mode_for(ChannelKind::Thermal), ChannelMode::SocketStream);
        assert_eq!(config.mode_for(ChannelKind::Command), ChannelMode::SocketStream);
    }

    #[test]
    fn test_from_lookup_requires_server_and_applies_overrides() {
        let missing = LinkConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(
            missing.to_string().contains(ENV_SERVER_URL),
            "unexpected error: {missing}"
        );

        let config = LinkConfig::from_lookup(lookup_from(&[
            (ENV_SERVER_URL, "https://env.example"),
            (ENV_DEVICE_ID, "robot-001"),
            (ENV_CLIENT_ID, "env-client"),
            (ENV_INFERENCE_URL, "https://model.example/predict"),
        ]))
        .unwrap();
        assert_eq!(config.server_url, "https://env.example");
        assert_eq!(config.device_id.as_deref(), Some("robot-001"));
        assert_eq!(config.client_id, "env-client");
        assert_eq!(
            config.inference.url.as_deref(),
            Some("https://model.example/predict")
        );
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_deserialize_toml() {
        let toml_str = r#"
            server_url = "https://relay.example.com"
            device_id = "Agraid"
            client_id = "web-control"

            [video]
            mode = "push_stream"

            [thermal]
            enabled = false

            [telemetry]
            enabled = true

            [liveness]
            offline_after_ms = 5000

            [inference]
            url = "https://model.example/predict"
            image_field = "image"
        "#;

        let config: LinkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device_id.as_deref(), Some("Agraid"));
        assert_eq!(config.client_id, "web-control");
        assert_eq!(config.video.mode, ChannelMode::PushStream);
        assert!(!config.thermal.enabled);
        assert!(config.telemetry.enabled);
        assert_eq!(config.liveness.offline_after_ms, 5000);
        assert_eq!(config.liveness.check_interval_ms, DEFAULT_CHECK_INTERVAL_MS);
        assert_eq!(config.inference.image_field, "image");
        assert_eq!(config.inference.timeout_secs, DEFAULT_INFERENCE_TIMEOUT_SECS);
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_from_file_env_overrides_precedence() {
        let dir = unique_temp_dir("from-file-overrides");
        let config_path = dir.join("robot-link.toml");
        fs::write(
            &config_path,
            r#"
server_url = "https://file.example"
device_id = "file-robot"
client_id = "file-client"
"#,
        )
        .unwrap();

        let config = LinkConfig::from_file_with(
            &config_path,
            lookup_from(&[(ENV_DEVICE_ID, "env-robot")]),
        )
        .unwrap();
        assert_eq!(config.server_url, "https://file.example");
        assert_eq!(config.device_id.as_deref(), Some("env-robot"));
        assert_eq!(config.client_id, "file-client");

        fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_from_file_missing_and_invalid_errors() {
        let dir = unique_temp_dir("from-file-errors");

        let missing = LinkConfig::from_file_with(&dir.join("missing.toml"), lookup_from(&[]))
            .unwrap_err();
        assert!(matches!(missing, LinkError::ConfigError { .. }));
        assert!(
            missing.to_string().contains("Failed to read config file"),
            "unexpected error: {missing}"
        );

        let invalid_path = dir.join("invalid.toml");
        fs::write(&invalid_path, "server_url = [").unwrap();
        let invalid = LinkConfig::from_file_with(&invalid_path, lookup_from(&[])).unwrap_err();
        assert!(matches!(invalid, LinkError::ConfigError { .. }));

        fs::remove_dir_all(dir).unwrap();
    }
}
