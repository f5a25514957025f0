//! # robot-link
//!
//! A realtime control client for a remote robot reached through a relay
//! server. One session per device multiplexes:
//!
//! - **video** and **thermal** image channels, over WebSocket or MJPEG
//! - a bidirectional **command** channel for drive and free-text commands
//! - an optional **telemetry** channel
//!
//! and tracks whether the robot is actually alive (frames arriving) rather
//! than merely whether the sockets are open. A one-shot capture workflow
//! sends the current video frame to an inference service and reports the
//! predicted label.
//!
//! ## Quick Start
//!
//! ```no_run
//! use robot_link::{ConnectionStatus, LinkConfig, RobotLink, SessionEvent};
//! use robot_link::protocol::DriveCommand;
//!
//! #[tokio::main]
//! async fn main() -> robot_link::LinkResult<()> {
//!     // Load config from environment or robot-link.toml
//!     let config = LinkConfig::discover(None)?;
//!     let link = RobotLink::start(config)?;
//!     let mut events = link.event_receiver();
//!
//!     link.connect("Agraid").await?;
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::StatusChanged { status: ConnectionStatus::Live, .. } = event {
//!             break;
//!         }
//!     }
//!
//!     link.send_drive(DriveCommand::MoveForward, None).await?;
//!     let prediction = link.capture().await?;
//!     println!("{} ({})", prediction.label_text(), prediction.confidence_text());
//!
//!     link.shutdown().await
//! }
//! ```
//!
//! ## Layers
//!
//! | Type | Role |
//! |------|------|
//! | [`RobotLink`] | Async handle; owns the session task |
//! | [`session::Session`] | Synchronous state machine: channels, frame slots, liveness |
//! | [`channel::ChannelOpener`] | Transport seam; [`channel::NetworkOpener`] for real sockets |
//! | [`registry::RegistryClient`] | Online robot discovery and client registration |
//! | [`capture::CaptureWorkflow`] | Single-flight capture and classify |
//!
//! ## Configuration
//!
//! See [`LinkConfig`]. The simplest setup uses environment variables:
//!
//! ```bash
//! export ROBOT_LINK_SERVER_URL="https://relay.example.com"
//! export ROBOT_LINK_INFERENCE_URL="https://model.example.com/predict"
//! ```
//!
//! Or a `robot-link.toml` file:
//!
//! ```toml
//! server_url = "https://relay.example.com"
//!
//! [inference]
//! url = "https://model.example.com/predict"
//! ```

pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame_slot;
pub mod link;
pub mod liveness;
pub mod mjpeg;
pub mod prediction;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod session;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use capture::{CaptureStatus, InferenceClient};
pub use config::LinkConfig;
pub use error::{LinkError, LinkResult};
pub use frame_slot::FrameRef;
pub use link::RobotLink;
pub use liveness::OfflineReason;
pub use prediction::Prediction;
pub use registry::RegistryClient;
pub use session::{ConnectionStatus, SessionEvent, SessionSnapshot};
