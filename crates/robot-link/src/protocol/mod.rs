//! Wire-level vocabulary shared with the relay server.
//!
//! - [`constants`]: endpoint paths, HTTP routes and upload defaults.
//! - [`channel`]: channel kinds and transport modes.
//! - [`command`]: command channel JSON and the drive command set.
//! - [`registry`]: robot discovery and client registration payloads.

pub mod channel;
pub mod command;
pub mod constants;
pub mod registry;

pub use channel::{ChannelKind, ChannelMode};
pub use command::{CommandMessage, DriveCommand, epoch_millis};
pub use constants::Paths;
pub use registry::{RegisterClientRequest, RobotList, RobotSummary};
