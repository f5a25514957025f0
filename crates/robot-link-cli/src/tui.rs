//! Raw-mode terminal lifecycle for hold-to-drive.
//!
//! [`RawTerminal`] restores the terminal on drop, including on panic.
//! Where the terminal supports it, key release events are requested so a
//! released key can stop the motion it started.

use std::io::{self, Write};

use crossterm::event::{
    KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::{execute, terminal};

pub struct RawTerminal {
    enhanced: bool,
}

impl RawTerminal {
    pub fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        let enhanced = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if enhanced {
            execute!(
                io::stdout(),
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
        }
        Ok(Self { enhanced })
    }

    /// Whether key releases are reported.
    pub fn reports_releases(&self) -> bool {
        self.enhanced
    }

    /// Print a line; raw mode needs an explicit carriage return.
    pub fn line(&self, text: &str) {
        let mut stdout = io::stdout();
        let _ = write!(stdout, "{text}\r\n");
        let _ = stdout.flush();
    }

    pub fn exit(&mut self) -> io::Result<()> {
        if self.enhanced {
            execute!(io::stdout(), PopKeyboardEnhancementFlags)?;
            self.enhanced = false;
        }
        terminal::disable_raw_mode()
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = self.exit();
    }
}
