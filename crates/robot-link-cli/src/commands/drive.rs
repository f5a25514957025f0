use std::collections::HashSet;

use colored::Colorize;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use tokio::sync::broadcast;

use robot_link::protocol::DriveCommand;
use robot_link::{LinkConfig, LinkResult, RobotLink, SessionEvent};

use crate::app::{
    acknowledge_frame, describe_event, graceful_shutdown, open_session, recover_from_lag,
    resolve_device,
};
use crate::tui::RawTerminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Drive(DriveCommand),
    Quit,
    Ignore,
}

/// Map a key event to an action. `held` tracks pressed drive keys so that
/// auto-repeat does not resend the same command.
fn key_action(key: &KeyEvent, held: &mut HashSet<char>) -> KeyAction {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return KeyAction::Quit;
    }
    match (key.code, key.kind) {
        (KeyCode::Char('q') | KeyCode::Esc, KeyEventKind::Press) => KeyAction::Quit,
        (KeyCode::Char(' '), KeyEventKind::Press) => {
            held.clear();
            KeyAction::Drive(DriveCommand::Stop)
        }
        (KeyCode::Char(c), KeyEventKind::Press) => {
            let c = c.to_ascii_lowercase();
            match DriveCommand::for_key_press(c) {
                Some(command) if held.insert(c) => KeyAction::Drive(command),
                _ => KeyAction::Ignore,
            }
        }
        (KeyCode::Char(c), KeyEventKind::Release) => {
            let c = c.to_ascii_lowercase();
            match DriveCommand::for_key_release(c) {
                Some(command) if held.remove(&c) => KeyAction::Drive(command),
                _ => KeyAction::Ignore,
            }
        }
        _ => KeyAction::Ignore,
    }
}

// ─── Drive ──────────────────────────────────────────────────────────────

pub async fn cmd_drive(config: LinkConfig, device: Option<&str>, speed: Option<f64>) -> LinkResult<()> {
    let device = resolve_device(&config, device)?;
    let (link, mut events) = open_session(config, &device).await?;

    println!(
        "{} W/A/S/D to drive, {} to stop, {} to quit",
        "Drive:".bright_blue(),
        "space".cyan(),
        "q".cyan()
    );
    let terminal = RawTerminal::enter()?;
    if !terminal.reports_releases() {
        terminal.line(&format!(
            "{} key releases are not reported by this terminal; press space to stop",
            "Note:".yellow()
        ));
    }

    let mut keys = EventStream::new();
    let mut held = HashSet::new();
    loop {
        tokio::select! {
            key = keys.next() => match key {
                Some(Ok(Event::Key(key))) => match key_action(&key, &mut held) {
                    KeyAction::Quit => break,
                    KeyAction::Drive(command) => drive(&link, &terminal, command, speed).await,
                    KeyAction::Ignore => {}
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    terminal.line(&format!("{} {}", "Input error:".red(), e));
                    break;
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(SessionEvent::FrameReady(frame)) => acknowledge_frame(&link, frame.kind).await,
                Ok(SessionEvent::CommandSent(_)) => {}
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        terminal.line(&line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => recover_from_lag(&link, n).await,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drive(&link, &terminal, DriveCommand::Stop, speed).await;
    drop(terminal);
    graceful_shutdown(&link).await;
    Ok(())
}

async fn drive(link: &RobotLink, terminal: &RawTerminal, command: DriveCommand, speed: Option<f64>) {
    match link.send_drive(command, speed).await {
        Ok(message) => terminal.line(&format!(
            "  {} {} {}",
            "sent>".dimmed(),
            message.command,
            message.speed.map(|s| format!("@ {s}")).unwrap_or_default().dimmed()
        )),
        Err(e) => terminal.line(&format!("  {} {}", "not sent:".yellow(), e)),
    }
}
