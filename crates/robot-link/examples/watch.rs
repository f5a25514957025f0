//! Connect to one robot, print session events for 30 seconds, then capture
//! a frame if an inference endpoint is configured.
//!
//! ```bash
//! ROBOT_LINK_SERVER_URL=http://localhost:8080 ROBOT_LINK_DEVICE_ID=r1 \
//!     cargo run --example watch
//! ```

use std::time::Duration;

use robot_link::{LinkConfig, RobotLink, SessionEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = LinkConfig::discover(None)?;
    let device = config
        .device_id
        .clone()
        .ok_or("set ROBOT_LINK_DEVICE_ID to the robot to watch")?;
    let can_capture = config.inference.url.is_some();

    let link = RobotLink::start(config)?;
    let mut events = link.event_receiver();
    link.connect(&device).await?;
    println!("Connecting to {device}...");

    // Nothing is rendered here, so every frame is acknowledged right away.
    let printer = {
        let link = link.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::FrameReady(frame) => {
                        let _ = link.mark_displayed(frame.kind).await;
                    }
                    SessionEvent::StatusChanged { status, reason } => match reason {
                        Some(reason) => println!("[status] {status} ({reason})"),
                        None => println!("[status] {status}"),
                    },
                    SessionEvent::ChannelOpened { kind, mode } => {
                        println!("[channel] {kind} open ({mode})");
                    }
                    SessionEvent::ChannelClosed { kind, reason, .. } => {
                        println!("[channel] {kind} closed: {reason}");
                    }
                    SessionEvent::CommandReceived(text) => println!("[robot] {text}"),
                    SessionEvent::Telemetry(text) => println!("[telemetry] {text}"),
                    SessionEvent::Capture(status) => println!("[capture] {status}"),
                    _ => {}
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;

    if can_capture {
        match link.capture().await {
            Ok(prediction) => println!(
                "Prediction: {} ({})",
                prediction.label_text(),
                prediction.confidence_text()
            ),
            Err(e) => println!("Capture failed: {e}"),
        }
    }

    let snapshot = link.snapshot().await?;
    println!(
        "{} frames received, final status {}",
        snapshot.live_frame_count, snapshot.status
    );

    link.shutdown().await?;
    printer.abort();
    Ok(())
}
