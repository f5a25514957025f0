use std::time::Duration;

use colored::Colorize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use robot_link::protocol::ChannelKind;
use robot_link::{
    CaptureStatus, ConnectionStatus, LinkConfig, LinkError, LinkResult, Prediction, RobotLink,
    SessionEvent, SessionSnapshot,
};

/// The device named on the command line, else the configured default.
pub fn resolve_device(config: &LinkConfig, device: Option<&str>) -> LinkResult<String> {
    device
        .map(str::to_string)
        .or_else(|| config.device_id.clone())
        .ok_or_else(|| LinkError::ConfigError {
            reason: "no device given; pass one or set ROBOT_LINK_DEVICE_ID".into(),
        })
}

/// Start a link and connect to `device`.
pub async fn open_session(
    config: LinkConfig,
    device: &str,
) -> LinkResult<(RobotLink, broadcast::Receiver<SessionEvent>)> {
    let link = RobotLink::start(config)?;
    let events = link.event_receiver();
    println!("Connecting to {}...", device.cyan());
    link.connect(device).await?;
    Ok((link, events))
}

/// Wait until the session is live, printing status changes on the way.
///
/// Returns the last status seen if the wait times out or the session ends.
pub async fn wait_until_live(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
) -> Result<(), ConnectionStatus> {
    let mut last = ConnectionStatus::Connecting;
    let waited = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StatusChanged { status, reason }) => {
                    print_status(status, reason.map(|r| r.to_string()).as_deref());
                    last = status;
                    match status {
                        ConnectionStatus::Live => return Ok(()),
                        ConnectionStatus::Disconnected | ConnectionStatus::Offline => {
                            return Err(status);
                        }
                        _ => {}
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(last),
            }
        }
    })
    .await;
    waited.unwrap_or(Err(last))
}

pub fn print_status(status: ConnectionStatus, reason: Option<&str>) {
    println!("{}", format_status(status, reason));
}

pub fn format_status(status: ConnectionStatus, reason: Option<&str>) -> String {
    let text = status.to_string();
    let colored = match status {
        ConnectionStatus::Live => text.green(),
        ConnectionStatus::Offline | ConnectionStatus::Disconnected => text.red(),
        _ => text.yellow(),
    };
    match reason {
        Some(reason) => format!("{} {} ({})", "Status:".bright_blue(), colored, reason.dimmed()),
        None => format!("{} {}", "Status:".bright_blue(), colored),
    }
}

pub fn print_event(event: &SessionEvent) {
    if let Some(line) = describe_event(event) {
        println!("{line}");
    }
}

/// One line per event. Frame events are summarised by the caller.
pub fn describe_event(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::StatusChanged { status, reason } => {
            format_status(*status, reason.map(|r| r.to_string()).as_deref())
        }
        SessionEvent::ChannelOpened { kind, mode } => {
            format!("  {} {} ({})", "opened".green(), kind, mode.to_string().dimmed())
        }
        SessionEvent::ChannelClosed {
            kind,
            reason,
            errored,
        } => {
            let label = if *errored { "closed".red() } else { "closed".yellow() };
            format!("  {label} {kind}: {reason}")
        }
        SessionEvent::ChannelError { kind, detail } => {
            format!("  {} {kind}: {detail}", "error".red())
        }
        SessionEvent::CommandReceived(text) => format!("  {} {text}", "robot>".cyan()),
        SessionEvent::CommandSent(text) => format!("  {} {text}", "sent>".dimmed()),
        SessionEvent::Telemetry(text) => format!("  {} {text}", "telemetry>".magenta()),
        SessionEvent::Capture(status) => format_capture_status(*status),
        SessionEvent::FrameReady(_) | SessionEvent::FrameDropped { .. } => return None,
    };
    Some(line)
}

pub fn print_capture_status(status: CaptureStatus) {
    println!("{}", format_capture_status(status));
}

fn format_capture_status(status: CaptureStatus) -> String {
    let text = status.to_string();
    match status {
        CaptureStatus::Complete => format!("  {}", text.green()),
        CaptureStatus::Failed => format!("  {}", text.red()),
        _ => format!("  {}", text.dimmed()),
    }
}

pub fn format_snapshot(snapshot: &SessionSnapshot) -> String {
    let device = snapshot
        .device_id
        .as_deref()
        .map_or_else(|| "none".dimmed().to_string(), |d| d.cyan().to_string());
    let channels = snapshot
        .channels
        .iter()
        .map(|c| format!("{}:{:?}", c.kind, c.state))
        .collect::<Vec<_>>()
        .join(" ");
    let frames = |id: Option<u64>| id.map_or_else(|| "-".to_string(), |id| format!("#{id}"));
    format!(
        "Device: {device} | Status: {} | Frames: {} (video {}, thermal {}) | {channels}",
        snapshot.status,
        snapshot.live_frame_count,
        frames(snapshot.video_frame),
        frames(snapshot.thermal_frame),
    )
}

pub fn print_prediction(prediction: &Prediction, json: bool) {
    if json {
        match serde_json::to_string_pretty(prediction) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("{} {}", "Failed to format JSON output:".yellow(), err),
        }
        return;
    }
    println!("{} {}", "Prediction:".bright_blue(), prediction.label_text().bold());
    println!("{} {}", "Confidence:".bright_blue(), prediction.confidence_text());
    println!("{} {}", "All:".bright_blue(), prediction.distribution_text());
    if let Some(raw) = &prediction.raw {
        println!("{} {}", "Raw response:".yellow(), raw);
    }
}

/// Frames are not rendered by the CLI; acknowledge them at once so the
/// slots keep accepting.
pub async fn acknowledge_frame(link: &RobotLink, kind: ChannelKind) {
    if let Err(e) = link.mark_displayed(kind).await {
        tracing::debug!(error = %e, "Could not acknowledge frame");
    }
}

/// A lagged receiver may have missed a `FrameReady`, leaving its slot
/// pending forever. Acknowledge both image slots so they accept again.
pub async fn recover_from_lag(link: &RobotLink, skipped: u64) {
    tracing::debug!(skipped, "Event receiver lagged, acknowledging image slots");
    acknowledge_frame(link, ChannelKind::Video).await;
    acknowledge_frame(link, ChannelKind::Thermal).await;
}

/// Acknowledge every frame in the background until the session stops.
pub fn spawn_frame_acknowledger(link: &RobotLink) -> JoinHandle<()> {
    let events = link.event_receiver();
    tokio::spawn(acknowledge_frames(link.clone(), events))
}

async fn acknowledge_frames(link: RobotLink, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::FrameReady(frame)) => acknowledge_frame(&link, frame.kind).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => recover_from_lag(&link, n).await,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Disconnect and stop the session task.
pub async fn graceful_shutdown(link: &RobotLink) {
    println!("Disconnecting...");
    if let Err(e) = link.shutdown().await {
        eprintln!("{} {}", "Warning: shutdown error:".yellow(), e);
    }
}
