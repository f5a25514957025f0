//! # Liveness Monitor
//!
//! Decides whether the remote device is still streaming. The judgment
//! itself is the pure function [`evaluate`]; [`LivenessMonitor`] is the
//! background task that asks the session to run it on a fixed interval,
//! independently of message arrival.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Why a session was declared offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// Exactly one frame ever arrived and nothing followed it.
    StaleSingleFrame,
    /// The stream was live and then went silent.
    LivenessTimeout,
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfflineReason::StaleSingleFrame => write!(f, "only one stale frame received"),
            OfflineReason::LivenessTimeout => write!(f, "no data within the liveness threshold"),
        }
    }
}

/// Outcome of one liveness evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Not enough data to judge yet.
    Pending,
    Online,
    Offline(OfflineReason),
}

/// The session timestamps the verdict is derived from.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessSnapshot {
    pub live_frame_count: u64,
    pub first_frame_at: Option<Instant>,
    pub last_live_at: Option<Instant>,
}

/// Judge liveness at `now`.
///
/// Offline when the stream went live and has been silent for longer than
/// `threshold`, or when exactly one frame arrived and more than `threshold`
/// has passed since.
pub fn evaluate(snapshot: &LivenessSnapshot, now: Instant, threshold: Duration) -> LivenessVerdict {
    if let Some(last_live) = snapshot.last_live_at {
        return if now.saturating_duration_since(last_live) > threshold {
            LivenessVerdict::Offline(OfflineReason::LivenessTimeout)
        } else {
            LivenessVerdict::Online
        };
    }
    match snapshot.first_frame_at {
        Some(first) if snapshot.live_frame_count == 1 => {
            if now.saturating_duration_since(first) > threshold {
                LivenessVerdict::Offline(OfflineReason::StaleSingleFrame)
            } else {
                LivenessVerdict::Pending
            }
        }
        _ => LivenessVerdict::Pending,
    }
}

/// Periodic request to evaluate liveness for one session generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTick {
    pub generation: u64,
}

/// Background timer that emits [`LivenessTick`]s.
///
/// Started when a session's first data channel opens and stopped on every
/// teardown. Dropping the monitor aborts the task.
pub struct LivenessMonitor {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl LivenessMonitor {
    /// Start ticking every `interval`. The first tick fires one interval
    /// after start.
    pub fn start(interval: Duration, generation: u64, ticks: mpsc::Sender<LivenessTick>) -> Self {
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                timer.tick().await;

                while running.load(Ordering::SeqCst) {
                    timer.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    match ticks.try_send(LivenessTick { generation }) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }

                tracing::debug!(generation, "Liveness monitor stopped");
                running.store(false, Ordering::SeqCst);
            })
        };

        tracing::debug!(generation, interval_ms = interval.as_millis(), "Liveness monitor started");
        Self {
            handle: Some(handle),
            running,
        }
    }

    /// Stop the monitor. No tick is sent after this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the monitor is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
