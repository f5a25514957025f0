//! # Session State Machine
//!
//! [`Session`] is the sole owner and mutator of the per-device state: the
//! open channels, both frame slots, the liveness timestamps and the
//! connection status. It is a plain synchronous state machine; the
//! [`RobotLink`](crate::link::RobotLink) actor feeds it channel events,
//! liveness ticks and user requests one at a time, so every mutation
//! happens in arrival order without locking.
//!
//! ```text
//! Idle → Connecting → AwaitingFirstFrame → Live ⇄ Offline
//!   any state ──────────────────────────────────────→ Disconnected
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::capture::{CaptureSource, CaptureStatus};
use crate::channel::{
    Channel, ChannelEnvelope, ChannelEvent, ChannelOpener, ChannelState, OpenRequest, Payload,
};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::frame_slot::{FrameBufferSlot, FrameRef, HandleLedger};
use crate::liveness::{
    LivenessMonitor, LivenessSnapshot, LivenessTick, LivenessVerdict, OfflineReason, evaluate,
};
use crate::protocol::{ChannelKind, ChannelMode, CommandMessage, DriveCommand};

/// Session connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    AwaitingFirstFrame,
    Live,
    Offline,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::AwaitingFirstFrame => "waiting for robot",
            ConnectionStatus::Live => "connected",
            ConnectionStatus::Offline => "robot offline",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// Notifications broadcast to session observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        status: ConnectionStatus,
        reason: Option<OfflineReason>,
    },
    ChannelOpened {
        kind: ChannelKind,
        mode: ChannelMode,
    },
    ChannelClosed {
        kind: ChannelKind,
        reason: String,
        errored: bool,
    },
    ChannelError {
        kind: ChannelKind,
        detail: String,
    },
    /// A frame was accepted by its slot and should be rendered. Call
    /// `mark_displayed` once it has been.
    FrameReady(FrameRef),
    /// The slot started dropping frames because the previous one is still
    /// being displayed. Sent once per pending frame, not per dropped frame.
    FrameDropped {
        kind: ChannelKind,
    },
    /// Inbound command channel text, verbatim.
    CommandReceived(String),
    /// A command was queued on the command channel.
    CommandSent(String),
    /// Inbound telemetry text, verbatim.
    Telemetry(String),
    Capture(CaptureStatus),
}

/// Per-channel view in a [`SessionSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub kind: ChannelKind,
    pub mode: ChannelMode,
    pub state: ChannelState,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub device_id: Option<String>,
    pub status: ConnectionStatus,
    pub generation: u64,
    pub live_frame_count: u64,
    pub first_frame_at: Option<Instant>,
    pub last_live_at: Option<Instant>,
    pub channels: Vec<ChannelInfo>,
    pub video_frame: Option<u64>,
    pub thermal_frame: Option<u64>,
    pub monitor_running: bool,
}

/// Per-device session state machine.
pub struct Session {
    config: Arc<LinkConfig>,
    opener: Arc<dyn ChannelOpener>,
    channel_tx: mpsc::UnboundedSender<ChannelEnvelope>,
    tick_tx: mpsc::Sender<LivenessTick>,
    events: broadcast::Sender<SessionEvent>,

    device_id: Option<String>,
    status: ConnectionStatus,
    generation: u64,
    channels: HashMap<ChannelKind, Channel>,
    video: FrameBufferSlot,
    thermal: FrameBufferSlot,
    last_video_payload: Option<Bytes>,
    live_frame_count: u64,
    first_frame_at: Option<Instant>,
    last_live_at: Option<Instant>,
    monitor: Option<LivenessMonitor>,
}

impl Session {
    pub fn new(
        config: Arc<LinkConfig>,
        opener: Arc<dyn ChannelOpener>,
        channel_tx: mpsc::UnboundedSender<ChannelEnvelope>,
        tick_tx: mpsc::Sender<LivenessTick>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let ledger = HandleLedger::new();
        Self {
            config,
            opener,
            channel_tx,
            tick_tx,
            events,
            device_id: None,
            status: ConnectionStatus::Idle,
            generation: 0,
            channels: HashMap::new(),
            video: FrameBufferSlot::with_ledger(ChannelKind::Video, Arc::clone(&ledger)),
            thermal: FrameBufferSlot::with_ledger(ChannelKind::Thermal, ledger),
            last_video_payload: None,
            live_frame_count: 0,
            first_frame_at: None,
            last_live_at: None,
            monitor: None,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Connect to `device_id`, tearing down any previous session first.
    ///
    /// Opens video, thermal (if enabled), command and telemetry (if
    /// enabled) channels. Progress is reported through channel events.
    pub fn connect(&mut self, device_id: &str) -> LinkResult<()> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(LinkError::ConfigError {
                reason: "device id must not be empty".into(),
            });
        }
        // Resolve every URL before touching the current session.
        let plan = self.channel_plan(device_id)?;

        if !self.channels.is_empty() {
            tracing::info!(
                previous = ?self.device_id,
                device_id,
                "Replacing existing session"
            );
        }
        self.teardown();

        self.device_id = Some(device_id.to_string());
        self.live_frame_count = 0;
        self.first_frame_at = None;
        self.last_live_at = None;
        self.set_status(ConnectionStatus::Connecting, None);

        for (kind, mode, url) in plan {
            let request =
                OpenRequest::new(kind, mode, url, self.generation, self.channel_tx.clone());
            let channel = self.opener.open(request);
            self.channels.insert(kind, channel);
        }
        tracing::info!(
            device_id,
            generation = self.generation,
            channels = self.channels.len(),
            "Session connecting"
        );
        Ok(())
    }

    /// Close every channel, release both frame slots, stop the liveness
    /// monitor and move to `Disconnected`. A no-op when already disconnected.
    pub fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.teardown();
        tracing::info!(device_id = ?self.device_id, "Session disconnected");
        self.set_status(ConnectionStatus::Disconnected, None);
    }

    fn channel_plan(&self, device_id: &str) -> LinkResult<Vec<(ChannelKind, ChannelMode, String)>> {
        let mut kinds = vec![ChannelKind::Video];
        if self.config.thermal.enabled {
            kinds.push(ChannelKind::Thermal);
        }
        kinds.push(ChannelKind::Command);
        if self.config.telemetry.enabled {
            kinds.push(ChannelKind::Telemetry);
        }
        kinds
            .into_iter()
            .map(|kind| {
                let mode = self.config.mode_for(kind);
                let url = self.config.channel_url(kind, mode, device_id)?;
                Ok((kind, mode, url))
            })
            .collect()
    }

    fn teardown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        for (_, mut channel) in self.channels.drain() {
            channel.close();
        }
        self.video.release();
        self.thermal.release();
        self.last_video_payload = None;
        // Anything still queued from the old channels is now stale.
        self.generation += 1;
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Apply one channel event.
    pub fn handle_channel_event(&mut self, envelope: ChannelEnvelope, now: Instant) {
        if envelope.generation != self.generation {
            tracing::trace!(
                kind = %envelope.kind,
                generation = envelope.generation,
                current = self.generation,
                "Dropping event from previous session"
            );
            return;
        }
        let kind = envelope.kind;
        let Some(channel) = self.channels.get_mut(&kind) else {
            return;
        };
        if !channel.observe(&envelope.event) {
            return;
        }
        let mode = channel.mode();
        let errored = channel.state() == ChannelState::ClosedWithError;

        match envelope.event {
            ChannelEvent::Open => {
                tracing::info!(kind = %kind, mode = %mode, "Channel open");
                self.emit(SessionEvent::ChannelOpened { kind, mode });
                if kind.is_data() && self.status == ConnectionStatus::Connecting {
                    self.set_status(ConnectionStatus::AwaitingFirstFrame, None);
                    self.start_monitor();
                }
            }
            ChannelEvent::Message(payload) => self.on_message(kind, mode, payload, now),
            ChannelEvent::Error { detail } => {
                tracing::warn!(kind = %kind, error = %detail, "Channel error");
                self.emit(SessionEvent::ChannelError { kind, detail });
            }
            ChannelEvent::Close { reason } => {
                tracing::info!(kind = %kind, reason = %reason, errored, "Channel closed");
                self.emit(SessionEvent::ChannelClosed {
                    kind,
                    reason,
                    errored,
                });
                self.check_remote_closure();
            }
        }
    }

    fn on_message(&mut self, kind: ChannelKind, mode: ChannelMode, payload: Payload, now: Instant) {
        match (kind, payload) {
            (ChannelKind::Video | ChannelKind::Thermal, Payload::Binary(bytes)) => {
                self.on_frame(kind, mode, bytes, now);
            }
            (ChannelKind::Video | ChannelKind::Thermal, Payload::Text(_)) => {
                tracing::debug!(kind = %kind, "Ignoring text message on image channel");
            }
            (ChannelKind::Command, payload) => {
                self.emit(SessionEvent::CommandReceived(payload_text(payload)));
            }
            (ChannelKind::Telemetry, payload) => {
                // Telemetry keeps a live session alive but never makes one live.
                if self.last_live_at.is_some() {
                    self.last_live_at = Some(now);
                }
                self.emit(SessionEvent::Telemetry(payload_text(payload)));
            }
        }
    }

    fn on_frame(&mut self, kind: ChannelKind, mode: ChannelMode, bytes: Bytes, now: Instant) {
        self.live_frame_count += 1;
        if kind == ChannelKind::Video && mode == ChannelMode::SocketStream {
            self.last_video_payload = Some(bytes.clone());
        }

        if self.live_frame_count == 1 {
            self.first_frame_at = Some(now);
            tracing::debug!(kind = %kind, "First frame received");
        } else {
            self.last_live_at = Some(now);
            self.set_status(ConnectionStatus::Live, None);
        }

        let slot = match kind {
            ChannelKind::Thermal => &mut self.thermal,
            _ => &mut self.video,
        };
        let event = if slot.offer(bytes) {
            slot.current().map(SessionEvent::FrameReady)
        } else if slot.dropped() == 1 {
            tracing::debug!(kind = %kind, "Frame slot backpressured, dropping frames");
            Some(SessionEvent::FrameDropped { kind })
        } else {
            tracing::trace!(kind = %kind, dropped = slot.dropped(), "Frame dropped, previous frame still pending");
            None
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// When every data channel has closed by itself there is nothing left
    /// to watch; the session ends.
    fn check_remote_closure(&mut self) {
        let any_data_alive = self
            .channels
            .values()
            .any(|c| c.kind().is_data() && !c.is_ended());
        if !any_data_alive {
            tracing::warn!(device_id = ?self.device_id, "All data channels closed by remote");
            self.teardown();
            self.set_status(ConnectionStatus::Disconnected, None);
        }
    }

    /// Run the liveness judgment for a monitor tick.
    pub fn on_tick(&mut self, tick: LivenessTick, now: Instant) {
        if tick.generation != self.generation
            || self.monitor.is_none()
            || self.status == ConnectionStatus::Offline
        {
            return;
        }
        let snapshot = LivenessSnapshot {
            live_frame_count: self.live_frame_count,
            first_frame_at: self.first_frame_at,
            last_live_at: self.last_live_at,
        };
        let threshold = self.config.liveness.offline_after();
        if let LivenessVerdict::Offline(reason) = evaluate(&snapshot, now, threshold) {
            self.go_offline(reason);
        }
    }

    fn go_offline(&mut self, reason: OfflineReason) {
        tracing::warn!(
            device_id = ?self.device_id,
            reason = %reason,
            live_frame_count = self.live_frame_count,
            "Robot offline"
        );
        self.video.release();
        self.thermal.release();
        // Push streams are dropped; sockets stay up so the robot can resume.
        let push: Vec<ChannelKind> = self
            .channels
            .values()
            .filter(|c| c.mode() == ChannelMode::PushStream)
            .map(Channel::kind)
            .collect();
        for kind in push {
            if let Some(mut channel) = self.channels.remove(&kind) {
                channel.close();
            }
        }
        self.set_status(ConnectionStatus::Offline, Some(reason));
    }

    fn start_monitor(&mut self) {
        if let Some(mut previous) = self.monitor.take() {
            previous.stop();
        }
        self.monitor = Some(LivenessMonitor::start(
            self.config.liveness.check_interval(),
            self.generation,
            self.tick_tx.clone(),
        ));
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Send free text on the command channel.
    ///
    /// # Errors
    /// [`LinkError::ChannelNotReady`] when the command channel is not open.
    pub fn send_command(&mut self, text: &str) -> LinkResult<CommandMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LinkError::ProtocolError {
                reason: "command text is empty".into(),
            });
        }
        self.send_message(CommandMessage::new(&self.config.client_id, text, None))
    }

    /// Send a drive command with a speed (the configured default when `None`).
    pub fn send_drive(&mut self, command: DriveCommand, speed: Option<f64>) -> LinkResult<CommandMessage> {
        let speed = speed.unwrap_or(self.config.drive.default_speed);
        self.send_message(CommandMessage::new(
            &self.config.client_id,
            command.as_str(),
            Some(speed),
        ))
    }

    fn send_message(&mut self, message: CommandMessage) -> LinkResult<CommandMessage> {
        let channel = self
            .channels
            .get(&ChannelKind::Command)
            .ok_or(LinkError::ChannelNotReady {
                kind: ChannelKind::Command,
            })?;
        let json = serde_json::to_string(&message)?;
        if let Err(e) = channel.send(json) {
            tracing::warn!(command = %message.command, "Command send failed: channel not connected");
            return Err(e);
        }
        tracing::debug!(command = %message.command, speed = ?message.speed, "Command sent");
        self.emit(SessionEvent::CommandSent(message.command.clone()));
        Ok(message)
    }

    /// The consumer finished rendering the current frame of `kind`.
    pub fn mark_displayed(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Video => self.video.mark_displayed(),
            ChannelKind::Thermal => self.thermal.mark_displayed(),
            ChannelKind::Command | ChannelKind::Telemetry => {}
        }
    }

    /// The best available frame for a capture: the last raw video payload,
    /// else the currently displayed video frame.
    pub fn capture_source(&self) -> Option<CaptureSource> {
        if let Some(raw) = &self.last_video_payload {
            return Some(CaptureSource::RawPayload(raw.clone()));
        }
        self.video
            .current()
            .map(|frame| CaptureSource::Displayed(frame.bytes))
    }

    // ─── Observation ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut channels: Vec<ChannelInfo> = self
            .channels
            .values()
            .map(|c| ChannelInfo {
                kind: c.kind(),
                mode: c.mode(),
                state: c.state(),
            })
            .collect();
        channels.sort_by_key(|c| ChannelKind::ALL.iter().position(|k| *k == c.kind));
        SessionSnapshot {
            device_id: self.device_id.clone(),
            status: self.status,
            generation: self.generation,
            live_frame_count: self.live_frame_count,
            first_frame_at: self.first_frame_at,
            last_live_at: self.last_live_at,
            channels,
            video_frame: self.video.current().map(|f| f.id),
            thermal_frame: self.thermal.current().map(|f| f.id),
            monitor_running: self.monitor.as_ref().is_some_and(LivenessMonitor::is_running),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Handle accounting shared by both frame slots.
    pub fn frame_ledger(&self) -> &Arc<HandleLedger> {
        self.video.ledger()
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: Option<OfflineReason>) {
        if self.status == status {
            return;
        }
        tracing::info!(
            device_id = ?self.device_id,
            from = %self.status,
            to = %status,
            live_frame_count = self.live_frame_count,
            "Session status changed"
        );
        self.status = status;
        self.emit(SessionEvent::StatusChanged { status, reason });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn payload_text(payload: Payload) -> String {
    match payload {
        Payload::Text(text) => text,
        Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}
