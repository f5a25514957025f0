//! # Robot Link
//!
//! [`RobotLink`] is the async handle applications hold. It owns a
//! background task that in turn owns the [`Session`]; every request, channel
//! event and liveness tick is delivered to that task and applied in arrival
//! order.
//!
//! ```text
//! ┌─────────────┐  requests   ┌──────────────────────────────┐
//! │  RobotLink  │ ──────────► │ session task                 │
//! │  (handle)   │ ◄────────── │  select! {                   │
//! └─────┬───────┘  oneshot    │    requests    → Session     │
//!       │                     │    channel evs → Session     │
//!       │ subscribe           │    ticks       → Session     │
//!       ▼                     │  }                           │
//! broadcast<SessionEvent> ◄───┴──────────────────────────────┘
//! ```
//!
//! Capture runs on the caller's task: it claims the single-flight slot,
//! asks the session task for the current frame, then uploads without
//! blocking the session.
//!
//! ## Usage
//!
//! ```no_run
//! use robot_link::{LinkConfig, RobotLink, SessionEvent};
//!
//! # async fn demo() -> robot_link::LinkResult<()> {
//! let config = LinkConfig::discover(None)?;
//! let link = RobotLink::start(config)?;
//!
//! let mut events = link.event_receiver();
//! link.connect("Agraid").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::FrameReady(frame) = event {
//!         println!("{} frame #{} ({} bytes)", frame.kind, frame.id, frame.bytes.len());
//!         link.mark_displayed(frame.kind).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::capture::{CaptureRequest, CaptureSource, CaptureWorkflow, InferenceClient};
use crate::channel::{ChannelEnvelope, ChannelOpener, NetworkOpener};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::liveness::LivenessTick;
use crate::prediction::Prediction;
use crate::protocol::{ChannelKind, CommandMessage, DriveCommand};
use crate::session::{Session, SessionEvent, SessionSnapshot};

const REQUEST_QUEUE: usize = 64;
const TICK_QUEUE: usize = 8;
const EVENT_CAPACITY: usize = 256;

enum Request {
    Connect {
        device_id: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendCommand {
        text: String,
        reply: oneshot::Sender<LinkResult<CommandMessage>>,
    },
    SendDrive {
        command: DriveCommand,
        speed: Option<f64>,
        reply: oneshot::Sender<LinkResult<CommandMessage>>,
    },
    MarkDisplayed {
        kind: ChannelKind,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    CaptureSource {
        reply: oneshot::Sender<Option<CaptureSource>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running robot session.
///
/// Cheap to clone. The session task stops when [`shutdown`](Self::shutdown)
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct RobotLink {
    config: Arc<LinkConfig>,
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<SessionEvent>,
    capture: Arc<CaptureWorkflow>,
}

impl RobotLink {
    /// Start a session task using real network transports.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`LinkError::ConfigError`] for an invalid configuration.
    pub fn start(config: LinkConfig) -> LinkResult<Self> {
        let opener = NetworkOpener::new(&config)?;
        Self::start_with_opener(config, Arc::new(opener))
    }

    /// Start a session task with a custom transport opener.
    pub fn start_with_opener(
        config: LinkConfig,
        opener: Arc<dyn ChannelOpener>,
    ) -> LinkResult<Self> {
        config.validate()?;
        let inference = match config.inference.url {
            Some(_) => Some(InferenceClient::new(&config.inference)?),
            None => None,
        };
        let config = Arc::new(config);

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(TICK_QUEUE);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = Session::new(
            Arc::clone(&config),
            opener,
            channel_tx,
            tick_tx,
            events.clone(),
        );
        tokio::spawn(run_session(session, requests_rx, channel_rx, tick_rx));

        tracing::info!(server = %config.server_url, "Robot link started");
        Ok(Self {
            capture: Arc::new(CaptureWorkflow::new(inference, events.clone())),
            config,
            requests: requests_tx,
            events,
        })
    }

    /// Subscribe to session events.
    pub fn event_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // ─── Session control ────────────────────────────────────────────────

    /// Connect to a device, replacing any current session.
    ///
    /// Returns once the channels have been requested; watch
    /// [`SessionEvent::StatusChanged`] for progress.
    pub async fn connect(&self, device_id: &str) -> LinkResult<()> {
        let device_id = device_id.to_string();
        self.request(|reply| Request::Connect { device_id, reply })
            .await?
    }

    /// Close every channel. A no-op when already disconnected.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    /// Send free text on the command channel.
    pub async fn send_command(&self, text: &str) -> LinkResult<CommandMessage> {
        let text = text.to_string();
        self.request(|reply| Request::SendCommand { text, reply })
            .await?
    }

    /// Send a drive command; `None` uses the configured default speed.
    pub async fn send_drive(
        &self,
        command: DriveCommand,
        speed: Option<f64>,
    ) -> LinkResult<CommandMessage> {
        self.request(|reply| Request::SendDrive {
            command,
            speed,
            reply,
        })
        .await?
    }

    /// Tell the session the current frame of `kind` has been rendered, so
    /// the next one can be accepted.
    pub async fn mark_displayed(&self, kind: ChannelKind) -> LinkResult<()> {
        self.requests
            .send(Request::MarkDisplayed { kind })
            .await
            .map_err(|_| LinkError::SessionClosed)
    }

    pub async fn snapshot(&self) -> LinkResult<SessionSnapshot> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    // ─── Capture ────────────────────────────────────────────────────────

    /// Capture the current video frame and classify it.
    ///
    /// # Errors
    /// - [`LinkError::ConfigError`] if no inference endpoint is configured
    /// - [`LinkError::AlreadyInFlight`] if another capture is running
    /// - [`LinkError::NoFrameAvailable`] if no video frame has arrived
    /// - [`LinkError::InferenceRequestFailed`] if the upload fails
    pub async fn capture(&self) -> LinkResult<Prediction> {
        let guard = self.capture.begin()?;
        let source = match self.request(|reply| Request::CaptureSource { reply }).await {
            Ok(source) => source,
            Err(e) => return Err(guard.fail(e)),
        };
        self.capture.run(guard, source).await
    }

    /// The most recent capture, in flight or finished.
    pub fn last_capture(&self) -> Option<CaptureRequest> {
        self.capture.current()
    }

    /// Disconnect and stop the session task. Later calls on any clone
    /// return [`LinkError::SessionClosed`].
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> LinkResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| LinkError::SessionClosed)?;
        rx.await.map_err(|_| LinkError::SessionClosed)
    }
}

async fn run_session(
    mut session: Session,
    mut requests: mpsc::Receiver<Request>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEnvelope>,
    mut ticks: mpsc::Receiver<LivenessTick>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    tracing::debug!("All handles dropped, stopping session task");
                    break;
                };
                if let Request::Shutdown { reply } = request {
                    session.disconnect();
                    let _ = reply.send(());
                    break;
                }
                handle_request(&mut session, request);
            }
            Some(envelope) = channel_events.recv() => {
                session.handle_channel_event(envelope, Instant::now());
            }
            Some(tick) = ticks.recv() => {
                session.on_tick(tick, Instant::now());
            }
        }
    }
    tracing::info!("Session task stopped");
}

fn handle_request(session: &mut Session, request: Request) {
    // A dropped reply receiver only means the caller stopped waiting.
    match request {
        Request::Connect { device_id, reply } => {
            let _ = reply.send(session.connect(&device_id));
        }
        Request::Disconnect { reply } => {
            session.disconnect();
            let _ = reply.send(());
        }
        Request::SendCommand { text, reply } => {
            let _ = reply.send(session.send_command(&text));
        }
        Request::SendDrive {
            command,
            speed,
            reply,
        } => {
            let _ = reply.send(session.send_drive(command, speed));
        }
        Request::MarkDisplayed { kind } => session.mark_displayed(kind),
        Request::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
        Request::CaptureSource { reply } => {
            let _ = reply.send(session.capture_source());
        }
        Request::Shutdown { reply } => {
            session.disconnect();
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::channel::{Channel, ChannelEvent, ChannelState, OpenRequest, Payload};
    use crate::session::ConnectionStatus;

    const JPEG: &[u8] = b"\xff\xd8\xff\xe0fake-jpeg\xff\xd9";

    /// Opens channels that connect at once. Image channels emit two frames;
    /// the command channel records what it is sent.
    #[derive(Default)]
    struct LoopbackOpener {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelOpener for LoopbackOpener {
        fn open(&self, request: OpenRequest) -> Channel {
            let kind = request.kind;
            let sent = Arc::clone(&self.sent);
            request.spawn(move |emitter, outbound| async move {
                emitter.emit(ChannelEvent::Open);
                if kind.is_image() {
                    for _ in 0..2 {
                        emitter.emit(ChannelEvent::Message(Payload::Binary(
                            Bytes::from_static(JPEG),
                        )));
                    }
                }
                if let Some(mut outbound) = outbound {
                    while let Some(text) = outbound.recv().await {
                        sent.lock().unwrap().push(text);
                    }
                }
                std::future::pending::<()>().await;
            })
        }
    }

    fn start(configure: impl FnOnce(&mut LinkConfig)) -> (RobotLink, Arc<Mutex<Vec<String>>>) {
        let mut config = LinkConfig::new("https://relay.example.com");
        configure(&mut config);
        let opener = LoopbackOpener::default();
        let sent = Arc::clone(&opener.sent);
        let link = RobotLink::start_with_opener(config, Arc::new(opener)).unwrap();
        (link, sent)
    }

    async fn wait_for_status(
        events: &mut broadcast::Receiver<SessionEvent>,
        wanted: ConnectionStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StatusChanged { status, .. }) if status == wanted => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted}"));
    }

    async fn wait_for_open(link: &RobotLink, kind: ChannelKind) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = link.snapshot().await.unwrap();
                if snapshot
                    .channels
                    .iter()
                    .any(|c| c.kind == kind && c.state == ChannelState::Open)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind} channel"));
    }

    #[tokio::test]
    async fn test_connect_goes_live() {
        let (link, _sent) = start(|_| {});
        let mut events = link.event_receiver();
        link.connect("Agraid").await.unwrap();
        wait_for_status(&mut events, ConnectionStatus::Live).await;

        let snapshot = link.snapshot().await.unwrap();
        assert_eq!(snapshot.device_id.as_deref(), Some("Agraid"));
        assert_eq!(snapshot.status, ConnectionStatus::Live);
        assert!(snapshot.live_frame_count >= 2);
        assert!(snapshot.monitor_running);
        assert_eq!(snapshot.channels.len(), 3);
    }

    #[tokio::test]
    async fn test_blank_device_id_rejected() {
        let (link, _sent) = start(|_| {});
        let err = link.connect("   ").await.unwrap_err();
        assert!(matches!(err, LinkError::ConfigError { .. }));
        assert_eq!(link.snapshot().await.unwrap().status, ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_commands_reach_command_channel() {
        let (link, sent) = start(|config| config.client_id = "tester".into());
        let mut events = link.event_receiver();
        link.connect("r1").await.unwrap();
        wait_for_status(&mut events, ConnectionStatus::Live).await;
        wait_for_open(&link, ChannelKind::Command).await;

        let message = link.send_drive(DriveCommand::MoveForward, None).await.unwrap();
        assert_eq!(message.speed, Some(70.0));
        link.send_command("lights on").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sent.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = sent.lock().unwrap().clone();
        let first: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(first["command"], "MOVE_FORWARD");
        assert_eq!(first["client_id"], "tester");
        let second: serde_json::Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(second["command"], "lights on");
    }

    #[tokio::test]
    async fn test_command_before_connect_not_ready() {
        let (link, _sent) = start(|_| {});
        let err = link.send_command("stop").await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::ChannelNotReady {
                kind: ChannelKind::Command
            }
        ));
    }

    #[tokio::test]
    async fn test_capture_without_inference_url() {
        let (link, _sent) = start(|_| {});
        let err = link.capture().await.unwrap_err();
        assert!(matches!(err, LinkError::ConfigError { .. }));
        assert!(link.last_capture().is_none());
    }

    #[tokio::test]
    async fn test_capture_before_any_frame() {
        let (link, _sent) = start(|config| {
            config.inference.url = Some("http://127.0.0.1:9/predict".into());
        });
        let err = link.capture().await.unwrap_err();
        assert!(matches!(err, LinkError::NoFrameAvailable));
    }

    #[tokio::test]
    async fn test_capture_uploads_raw_video_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/predict")
            .match_body(mockito::Matcher::Regex("fake-jpeg".into()))
            .with_status(200)
            .with_body(r#"{"label":"rust","confidence":0.61}"#)
            .create_async()
            .await;

        let url = format!("{}/predict", server.url());
        let (link, _sent) = start(move |config| config.inference.url = Some(url));
        let mut events = link.event_receiver();
        link.connect("r1").await.unwrap();
        wait_for_status(&mut events, ConnectionStatus::Live).await;

        let prediction = link.capture().await.unwrap();
        assert_eq!(prediction.label_text(), "rust");
        assert_eq!(prediction.confidence_text(), "61%");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let (link, _sent) = start(|_| {});
        let other = link.clone();
        link.shutdown().await.unwrap();
        assert!(matches!(
            other.snapshot().await.unwrap_err(),
            LinkError::SessionClosed
        ));
        assert!(matches!(
            other.connect("r1").await.unwrap_err(),
            LinkError::SessionClosed
        ));
    }
}
