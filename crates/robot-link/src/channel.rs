//! # Channels
//!
//! A [`Channel`] is one transport stream to a device endpoint. Opening never
//! blocks: the transport runs in its own task and reports
//! [`ChannelEvent`]s (`Open`, `Message`, `Close`, `Error`) to the session
//! through an mpsc mailbox, tagged with the session generation.
//!
//! Two transports are provided by [`NetworkOpener`]:
//!
//! - **SocketStream**: a `tokio-tungstenite` WebSocket, split into a reader
//!   and a writer half. Outbound text is queued on an unbounded mpsc and
//!   written by the same task.
//! - **PushStream**: a streaming `reqwest` GET of a
//!   `multipart/x-mixed-replace` body, cut into frames by [`MjpegParser`].
//!   Receive-only; closing it drops the response.
//!
//! Once a channel is closed locally it never emits another event.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::mjpeg::MjpegParser;
use crate::protocol::{ChannelKind, ChannelMode};

/// An inbound message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
}

/// Lifecycle events reported by a channel transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Close { reason: String },
    Error { detail: String },
}

/// A channel event tagged with its origin.
#[derive(Debug, Clone)]
pub struct ChannelEnvelope {
    /// Session generation the channel was opened for.
    pub generation: u64,
    pub kind: ChannelKind,
    pub event: ChannelEvent,
}

/// Channel connection state as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    ClosedWithError,
}

// ─── Emitter ────────────────────────────────────────────────────────────

/// The transport side of a channel: forwards events to the session until
/// the channel is closed locally.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    kind: ChannelKind,
    generation: u64,
    closed: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<ChannelEnvelope>,
}

impl ChannelEmitter {
    /// Forward an event. Returns `false` once the channel has been closed
    /// or the session has gone away, telling the transport to stop.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx
            .send(ChannelEnvelope {
                generation: self.generation,
                kind: self.kind,
                event,
            })
            .is_ok()
    }

    /// Report a transport failure on an established channel as
    /// [`LinkError::TransportError`].
    pub fn fail(&self, reason: impl Into<String>) {
        self.report(&LinkError::TransportError {
            kind: self.kind,
            reason: reason.into(),
        });
    }

    /// End the channel because of `err`: an `Error` followed by a `Close`.
    pub fn report(&self, err: &LinkError) {
        let detail = err.to_string();
        tracing::warn!(kind = %self.kind, generation = self.generation, error = %detail, "Channel transport error");
        if self.emit(ChannelEvent::Error {
            detail: detail.clone(),
        }) {
            self.emit(ChannelEvent::Close { reason: detail });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ─── Open request ───────────────────────────────────────────────────────

/// Everything a [`ChannelOpener`] needs to start a transport.
#[derive(Debug)]
pub struct OpenRequest {
    pub kind: ChannelKind,
    pub mode: ChannelMode,
    pub url: String,
    emitter: ChannelEmitter,
}

impl OpenRequest {
    pub fn new(
        kind: ChannelKind,
        mode: ChannelMode,
        url: impl Into<String>,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelEnvelope>,
    ) -> Self {
        Self {
            kind,
            mode,
            url: url.into(),
            emitter: ChannelEmitter {
                kind,
                generation,
                closed: Arc::new(AtomicBool::new(false)),
                tx: events,
            },
        }
    }

    pub fn emitter(&self) -> &ChannelEmitter {
        &self.emitter
    }

    /// Build a channel whose transport is driven by `run`.
    ///
    /// `run` receives the emitter and, for bidirectional modes, the queue of
    /// outbound text messages.
    pub fn spawn<F, Fut>(self, run: F) -> Channel
    where
        F: FnOnce(ChannelEmitter, Option<mpsc::UnboundedReceiver<String>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (mut channel, emitter, outbound) = self.detached();
        channel.task = Some(tokio::spawn(run(emitter, outbound)));
        channel
    }

    /// Build a channel with no transport task. The caller drives the
    /// emitter and drains the outbound queue itself.
    pub fn detached(
        self,
    ) -> (
        Channel,
        ChannelEmitter,
        Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let (outbound_tx, outbound_rx) = if self.mode.is_bidirectional() {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let channel = Channel {
            kind: self.kind,
            mode: self.mode,
            url: self.url,
            state: ChannelState::Opening,
            ended: false,
            outbound: outbound_tx,
            task: None,
            closed: Arc::clone(&self.emitter.closed),
        };
        (channel, self.emitter, outbound_rx)
    }
}

/// Starts channel transports. The seam between the session and the network.
pub trait ChannelOpener: Send + Sync {
    /// Begin connecting. Must not block; progress is reported through the
    /// request's emitter.
    fn open(&self, request: OpenRequest) -> Channel;
}

// ─── Channel ────────────────────────────────────────────────────────────

/// One transport stream owned by a session.
#[derive(Debug)]
pub struct Channel {
    kind: ChannelKind,
    mode: ChannelMode,
    url: String,
    state: ChannelState,
    ended: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl Channel {
    /// Queue a text message.
    ///
    /// # Errors
    /// Returns [`LinkError::ChannelNotReady`] unless the channel is open and
    /// bidirectional.
    pub fn send(&self, text: impl Into<String>) -> LinkResult<()> {
        let not_ready = || LinkError::ChannelNotReady { kind: self.kind };
        if self.state != ChannelState::Open || self.closed.load(Ordering::SeqCst) {
            return Err(not_ready());
        }
        let tx = self.outbound.as_ref().ok_or_else(not_ready)?;
        tx.send(text.into()).map_err(|_| not_ready())
    }

    /// Close the channel. Idempotent; no event is emitted afterwards.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.state != ChannelState::ClosedWithError {
            self.state = ChannelState::Closed;
        }
        self.ended = true;
        tracing::debug!(kind = %self.kind, mode = %self.mode, "Channel closed");
    }

    /// Apply an inbound event to the channel state. Returns `false` for
    /// events the session must ignore (after close, duplicates, messages
    /// outside the open state).
    pub(crate) fn observe(&mut self, event: &ChannelEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match event {
            ChannelEvent::Open => {
                if self.state == ChannelState::Opening {
                    self.state = ChannelState::Open;
                    true
                } else {
                    false
                }
            }
            ChannelEvent::Message(_) => self.state == ChannelState::Open,
            ChannelEvent::Error { .. } => {
                if self.ended || self.state == ChannelState::ClosedWithError {
                    false
                } else {
                    self.state = ChannelState::ClosedWithError;
                    true
                }
            }
            ChannelEvent::Close { .. } => {
                if self.ended {
                    return false;
                }
                self.ended = true;
                self.outbound = None;
                if self.state != ChannelState::ClosedWithError {
                    self.state = ChannelState::Closed;
                }
                true
            }
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open && !self.ended
    }

    /// Returns `true` once the channel has closed, locally or remotely.
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Network transports ─────────────────────────────────────────────────

/// Opens real WebSocket and MJPEG transports.
#[derive(Debug, Clone)]
pub struct NetworkOpener {
    connect_timeout: Duration,
    http: reqwest::Client,
}

impl NetworkOpener {
    /// Build an opener from the transport timeouts in `config`.
    pub fn new(config: &LinkConfig) -> LinkResult<Self> {
        let connect_timeout = config.timeouts.connect_timeout();
        // Push streams are long-lived, so only the connect phase is bounded.
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            connect_timeout,
            http,
        })
    }
}

impl ChannelOpener for NetworkOpener {
    fn open(&self, request: OpenRequest) -> Channel {
        let url = request.url.clone();
        let connect_timeout = self.connect_timeout;
        tracing::debug!(kind = %request.kind, mode = %request.mode, url = %url, "Opening channel");
        match request.mode {
            ChannelMode::SocketStream => request.spawn(move |emitter, outbound| {
                run_socket_stream(url, connect_timeout, emitter, outbound)
            }),
            ChannelMode::PushStream => {
                let http = self.http.clone();
                request.spawn(move |emitter, _| {
                    run_push_stream(http, url, connect_timeout, emitter)
                })
            }
        }
    }
}

async fn run_socket_stream(
    url: String,
    connect_timeout: Duration,
    emitter: ChannelEmitter,
    mut outbound: Option<mpsc::UnboundedReceiver<String>>,
) {
    let ws = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, response))) => {
            tracing::info!(kind = %emitter.kind(), url = %url, status = %response.status(), "Channel connected");
            ws
        }
        Ok(Err(e)) => {
            emitter.report(&LinkError::ConnectionFailed {
                url,
                reason: e.to_string(),
            });
            return;
        }
        Err(_) => {
            emitter.report(&LinkError::ConnectionFailed {
                url,
                reason: format!("timed out after {}s", connect_timeout.as_secs()),
            });
            return;
        }
    };

    if !emitter.emit(ChannelEvent::Open) {
        return;
    }

    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            outgoing = next_outbound(&mut outbound) => {
                let Some(text) = outgoing else {
                    // Local side dropped the channel.
                    let _ = writer.close().await;
                    return;
                };
                if let Err(e) = writer.send(Message::text(text)).await {
                    emitter.fail(format!("send failed: {e}"));
                    return;
                }
            }
            incoming = reader.next() => {
                let event = match incoming {
                    Some(Ok(Message::Text(text))) => {
                        ChannelEvent::Message(Payload::Text(text.as_str().to_owned()))
                    }
                    Some(Ok(Message::Binary(data))) => ChannelEvent::Message(Payload::Binary(data)),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        tracing::info!(kind = %emitter.kind(), reason = %reason, "Channel closed by server");
                        emitter.emit(ChannelEvent::Close { reason });
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        emitter.fail(e.to_string());
                        return;
                    }
                    None => {
                        emitter.emit(ChannelEvent::Close {
                            reason: "stream ended".into(),
                        });
                        return;
                    }
                };
                if !emitter.emit(event) {
                    return;
                }
            }
        }
    }
}

async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_push_stream(
    http: reqwest::Client,
    url: String,
    connect_timeout: Duration,
    emitter: ChannelEmitter,
) {
    let response = match tokio::time::timeout(connect_timeout, http.get(&url).send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            emitter.report(&LinkError::ConnectionFailed {
                url,
                reason: e.to_string(),
            });
            return;
        }
        Err(_) => {
            emitter.report(&LinkError::ConnectionFailed {
                url,
                reason: format!("timed out after {}s", connect_timeout.as_secs()),
            });
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        emitter.fail(format!("MJPEG stream {url} answered {status}"));
        return;
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some(mut parser) = MjpegParser::from_content_type(&content_type).ok() else {
        emitter.fail(format!("{url} is not a multipart stream: '{content_type}'"));
        return;
    };

    tracing::info!(kind = %emitter.kind(), url = %url, "Push stream connected");
    if !emitter.emit(ChannelEvent::Open) {
        return;
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                emitter.fail(format!("MJPEG stream read failed: {e}"));
                return;
            }
        };
        let frames = match parser.push(&chunk) {
            Ok(frames) => frames,
            Err(e) => {
                emitter.fail(e.to_string());
                return;
            }
        };
        for frame in frames {
            if !emitter.emit(ChannelEvent::Message(Payload::Binary(frame))) {
                return;
            }
        }
        if parser.is_finished() {
            break;
        }
    }

    emitter.emit(ChannelEvent::Close {
        reason: "stream ended".into(),
    });
}
