mod classify;
mod drive;
mod registry;
mod session;

pub use classify::cmd_classify;
pub use drive::cmd_drive;
pub use registry::{cmd_register, cmd_robots};
pub use session::{cmd_capture, cmd_send, cmd_watch};
