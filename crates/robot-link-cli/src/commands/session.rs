use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::broadcast;

use robot_link::{LinkConfig, LinkError, LinkResult, RobotLink, SessionEvent};

use crate::app::{
    acknowledge_frame, format_snapshot, graceful_shutdown, open_session, print_event,
    print_capture_status, print_prediction, recover_from_lag, resolve_device,
    spawn_frame_acknowledger, wait_until_live,
};

const COMMAND_READY_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Watch ──────────────────────────────────────────────────────────────

/// Print session events until Ctrl+C (or `seconds` elapse).
pub async fn cmd_watch(
    config: LinkConfig,
    device: Option<&str>,
    seconds: Option<u64>,
) -> LinkResult<()> {
    let device = resolve_device(&config, device)?;
    let (link, mut events) = open_session(config, &device).await?;
    println!("{}", "Watching session... (Ctrl+C to stop)".green());

    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut frames = 0u64;
    let mut stalls = 0u64;
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::FrameReady(frame)) => {
                    frames += 1;
                    acknowledge_frame(&link, frame.kind).await;
                }
                Ok(SessionEvent::FrameDropped { .. }) => stalls += 1,
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => recover_from_lag(&link, n).await,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = report.tick() => {
                let snapshot = link.snapshot().await?;
                println!(
                    "{} | shown {frames}, stalled {stalls}",
                    format_snapshot(&snapshot)
                );
            }
            () = sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Watch stopped.".yellow());
                break;
            }
        }
    }

    graceful_shutdown(&link).await;
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ─── Send ───────────────────────────────────────────────────────────────

pub async fn cmd_send(config: LinkConfig, device: Option<&str>, text: &str) -> LinkResult<()> {
    let device = resolve_device(&config, device)?;
    let (link, _events) = open_session(config, &device).await?;

    let result = send_when_ready(&link, text).await;
    match &result {
        Ok(()) => println!("{} {}", "Sent:".green(), text),
        Err(e) => eprintln!("{} {}", "Send failed:".red(), e),
    }
    graceful_shutdown(&link).await;
    result
}

/// The command channel opens asynchronously; retry until it accepts.
async fn send_when_ready(link: &RobotLink, text: &str) -> LinkResult<()> {
    let attempt = async {
        loop {
            match link.send_command(text).await {
                Err(LinkError::ChannelNotReady { .. }) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                other => return other.map(drop),
            }
        }
    };
    tokio::time::timeout(COMMAND_READY_TIMEOUT, attempt)
        .await
        .unwrap_or(Err(LinkError::Timeout {
            seconds: COMMAND_READY_TIMEOUT.as_secs(),
        }))
}

// ─── Capture ────────────────────────────────────────────────────────────

pub async fn cmd_capture(
    config: LinkConfig,
    device: Option<&str>,
    wait_secs: u64,
    json: bool,
    save: Option<&Path>,
) -> LinkResult<()> {
    let device = resolve_device(&config, device)?;
    let (link, mut events) = open_session(config, &device).await?;
    let acknowledger = spawn_frame_acknowledger(&link);

    if let Err(status) = wait_until_live(&mut events, Duration::from_secs(wait_secs)).await {
        eprintln!(
            "{} robot is {} after {}s, capturing anyway",
            "Warning:".yellow(),
            status,
            wait_secs
        );
    }

    let mut progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Capture(status)) => {
                    print_capture_status(status);
                    if status.is_terminal() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let result = link.capture().await;
    // Early rejections never emit a terminal status.
    if tokio::time::timeout(Duration::from_secs(1), &mut progress)
        .await
        .is_err()
    {
        progress.abort();
    }

    let outcome = match result {
        Ok(prediction) => {
            print_prediction(&prediction, json);
            match save {
                Some(path) => save_capture(&link, path).await,
                None => Ok(()),
            }
        }
        Err(e) => Err(e),
    };
    acknowledger.abort();
    graceful_shutdown(&link).await;
    outcome
}

/// Write the JPEG that was sent for classification.
async fn save_capture(link: &RobotLink, path: &Path) -> LinkResult<()> {
    let image = link
        .last_capture()
        .and_then(|request| request.image)
        .ok_or(LinkError::NoFrameAvailable)?;
    tokio::fs::write(path, &image).await?;
    eprintln!("{} {}", "Saved capture to".green(), path.display());
    Ok(())
}
