//! # Capture and Classify
//!
//! One-shot workflow that grabs the latest video frame, uploads it to the
//! inference endpoint and reports a [`Prediction`].
//!
//! The workflow is single-flight: while one capture is running every other
//! request is rejected with [`LinkError::AlreadyInFlight`]. The in-flight
//! slot is held by a [`CaptureGuard`]; dropping the guard before the capture
//! finishes (for example when the caller's future is cancelled) marks the
//! request `Failed`, so the slot can never stay taken.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::InferenceConfig;
use crate::error::{LinkError, LinkResult};
use crate::prediction::Prediction;
use crate::protocol::constants::{CAPTURE_FILE_NAME, JPEG_MIME};
use crate::session::SessionEvent;

/// Progress of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Idle,
    CapturingFrame,
    Submitting,
    AwaitingResult,
    Complete,
    Failed,
}

impl CaptureStatus {
    /// `Idle`, `Complete` and `Failed` hold no lock.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaptureStatus::Idle | CaptureStatus::Complete | CaptureStatus::Failed
        )
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CaptureStatus::Idle => "Idle",
            CaptureStatus::CapturingFrame => "Capturing frame...",
            CaptureStatus::Submitting => "Sending to model...",
            CaptureStatus::AwaitingResult => "Waiting for prediction...",
            CaptureStatus::Complete => "Prediction complete.",
            CaptureStatus::Failed => "Prediction failed.",
        };
        f.write_str(text)
    }
}

/// Where the captured bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// The last payload received on the video socket, uploaded as-is.
    RawPayload(Bytes),
    /// The frame currently held for display; re-encoded to JPEG.
    Displayed(Bytes),
}

/// The most recent capture, in flight or finished.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub id: u64,
    pub status: CaptureStatus,
    pub started_at: Instant,
    pub result: Option<Prediction>,
    pub error: Option<String>,
    /// The JPEG that was (or is being) uploaded.
    pub image: Option<Bytes>,
}

// ─── Inference client ───────────────────────────────────────────────────

/// Uploads JPEG frames to the inference endpoint.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
    image_field: String,
    timeout: Duration,
}

impl InferenceClient {
    /// Build a client for the configured endpoint.
    ///
    /// # Errors
    /// [`LinkError::ConfigError`] when no inference URL is configured.
    pub fn new(config: &InferenceConfig) -> LinkResult<Self> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| LinkError::ConfigError {
                reason: "inference url is not configured".into(),
            })?;
        let timeout = config.timeout();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            image_field: config.image_field.clone(),
            timeout,
        })
    }

    /// `POST` the JPEG as a multipart upload. Returns the response once
    /// its status has been checked.
    ///
    /// # Errors
    /// [`LinkError::InferenceRequestFailed`] on timeout, transport failure
    /// or a non-success status (with the response text as detail).
    pub async fn submit(&self, jpeg: Bytes) -> LinkResult<reqwest::Response> {
        let part = Part::bytes(jpeg.to_vec())
            .file_name(CAPTURE_FILE_NAME)
            .mime_str(JPEG_MIME)?;
        let form = Form::new().part(self.image_field.clone(), part);

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_failed(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(LinkError::InferenceRequestFailed {
            status: Some(status.as_u16()),
            detail,
        })
    }

    /// Read the response body as text.
    pub async fn read_body(&self, response: reqwest::Response) -> LinkResult<String> {
        response.text().await.map_err(|e| self.request_failed(&e))
    }

    /// Submit and interpret in one step, degrading unparseable bodies.
    pub async fn classify(&self, jpeg: Bytes) -> LinkResult<Prediction> {
        let response = self.submit(jpeg).await?;
        let body = self.read_body(response).await?;
        Ok(interpret(&body))
    }

    fn request_failed(&self, err: &reqwest::Error) -> LinkError {
        let detail = if err.is_timeout() {
            format!("timed out after {}s", self.timeout.as_secs())
        } else {
            err.to_string()
        };
        LinkError::InferenceRequestFailed {
            status: None,
            detail,
        }
    }
}

/// Parse a body into a prediction; a non-JSON body becomes a degraded
/// result carrying the raw text.
fn interpret(body: &str) -> Prediction {
    match Prediction::from_body(body) {
        Ok(prediction) => prediction,
        Err(e) => {
            tracing::warn!(error = %e, "Inference response was not JSON, returning raw text");
            Prediction::degraded(body)
        }
    }
}

/// Decode any supported image and re-encode it as JPEG.
pub fn reencode_jpeg(bytes: &[u8]) -> LinkResult<Bytes> {
    let image = image::load_from_memory(bytes)?;
    let mut output = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut output, image::ImageFormat::Jpeg)?;
    Ok(Bytes::from(output.into_inner()))
}

// ─── Workflow ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WorkflowState {
    current: Option<CaptureRequest>,
    next_id: u64,
}

/// Single-flight capture-and-classify coordinator.
pub struct CaptureWorkflow {
    state: Mutex<WorkflowState>,
    inference: Option<InferenceClient>,
    events: broadcast::Sender<SessionEvent>,
}

impl CaptureWorkflow {
    pub fn new(inference: Option<InferenceClient>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            state: Mutex::new(WorkflowState::default()),
            inference,
            events,
        }
    }

    /// Claim the in-flight slot.
    ///
    /// # Errors
    /// [`LinkError::ConfigError`] if no inference endpoint is configured,
    /// [`LinkError::AlreadyInFlight`] if a capture is still running (its
    /// state is left untouched).
    pub fn begin(self: &Arc<Self>) -> LinkResult<CaptureGuard> {
        if self.inference.is_none() {
            return Err(LinkError::ConfigError {
                reason: "inference url is not configured".into(),
            });
        }
        let id = {
            let mut state = self.lock();
            if state
                .current
                .as_ref()
                .is_some_and(|req| !req.status.is_terminal())
            {
                return Err(LinkError::AlreadyInFlight);
            }
            state.next_id += 1;
            let id = state.next_id;
            state.current = Some(CaptureRequest {
                id,
                status: CaptureStatus::CapturingFrame,
                started_at: Instant::now(),
                result: None,
                error: None,
                image: None,
            });
            id
        };
        tracing::info!(capture = id, "Capture started");
        self.emit(CaptureStatus::CapturingFrame);
        Ok(CaptureGuard {
            workflow: Arc::clone(self),
            id,
            finished: false,
        })
    }

    /// Run a claimed capture to completion.
    ///
    /// Always ends in `Complete` or `Failed`.
    pub async fn run(
        &self,
        guard: CaptureGuard,
        source: Option<CaptureSource>,
    ) -> LinkResult<Prediction> {
        match self.execute(&guard, source).await {
            Ok(prediction) => Ok(guard.complete(prediction)),
            Err(e) => Err(guard.fail(e)),
        }
    }

    async fn execute(
        &self,
        guard: &CaptureGuard,
        source: Option<CaptureSource>,
    ) -> LinkResult<Prediction> {
        let client = self.inference.as_ref().ok_or_else(|| LinkError::ConfigError {
            reason: "inference url is not configured".into(),
        })?;

        let jpeg = match source.ok_or(LinkError::NoFrameAvailable)? {
            CaptureSource::RawPayload(bytes) => bytes,
            CaptureSource::Displayed(bytes) => {
                tokio::task::spawn_blocking(move || reencode_jpeg(&bytes))
                    .await
                    .map_err(|e| LinkError::Image(format!("re-encode task failed: {e}")))??
            }
        };
        tracing::debug!(capture = guard.id, bytes = jpeg.len(), "Frame captured");
        self.store_image(guard.id, jpeg.clone());

        guard.advance(CaptureStatus::Submitting);
        let response = client.submit(jpeg).await?;

        guard.advance(CaptureStatus::AwaitingResult);
        let body = client.read_body(response).await?;
        Ok(interpret(&body))
    }

    /// Snapshot of the most recent request.
    pub fn current(&self) -> Option<CaptureRequest> {
        self.lock().current.clone()
    }

    /// Returns `true` while a capture holds the in-flight slot.
    pub fn is_in_flight(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|req| !req.status.is_terminal())
    }

    fn store_image(&self, id: u64, jpeg: Bytes) {
        if let Some(req) = self.lock().current.as_mut().filter(|req| req.id == id) {
            req.image = Some(jpeg);
        }
    }

    fn update(&self, id: u64, status: CaptureStatus, f: impl FnOnce(&mut CaptureRequest)) -> bool {
        let mut state = self.lock();
        match state.current.as_mut() {
            Some(req) if req.id == id && !req.status.is_terminal() => {
                req.status = status;
                f(req);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        // The state stays consistent across a panic; keep using it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, status: CaptureStatus) {
        let _ = self.events.send(SessionEvent::Capture(status));
    }
}

/// Holds the single-flight slot for one capture.
pub struct CaptureGuard {
    workflow: Arc<CaptureWorkflow>,
    id: u64,
    finished: bool,
}

impl CaptureGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn advance(&self, status: CaptureStatus) {
        if self.workflow.update(self.id, status, |_| {}) {
            tracing::debug!(capture = self.id, status = ?status, "Capture progress");
            self.workflow.emit(status);
        }
    }

    pub fn complete(mut self, prediction: Prediction) -> Prediction {
        self.finished = true;
        let stored = prediction.clone();
        if self
            .workflow
            .update(self.id, CaptureStatus::Complete, |req| req.result = Some(stored))
        {
            tracing::info!(
                capture = self.id,
                label = prediction.label_text(),
                confidence = %prediction.confidence_text(),
                "Capture complete"
            );
            self.workflow.emit(CaptureStatus::Complete);
        }
        prediction
    }

    pub fn fail(mut self, error: LinkError) -> LinkError {
        self.finished = true;
        self.mark_failed(error.to_string());
        error
    }

    fn mark_failed(&self, message: String) {
        tracing::warn!(capture = self.id, error = %message, "Capture failed");
        if self
            .workflow
            .update(self.id, CaptureStatus::Failed, |req| req.error = Some(message))
        {
            self.workflow.emit(CaptureStatus::Failed);
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.mark_failed("capture cancelled".into());
        }
    }
}
