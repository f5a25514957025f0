//! # Frame Buffer Slot
//!
//! Owns the most recent displayable frame of one image channel.
//!
//! A slot accepts a new frame only when the previous one has been
//! displayed, so a slow consumer drops frames instead of queueing them.
//! Frame resources are [`FrameHandle`]s: each is released exactly once,
//! when it is dropped, and a [`HandleLedger`] counts creations and releases
//! so the accounting can be checked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::protocol::ChannelKind;

/// Counts frame handles created and released by one or more slots.
#[derive(Debug, Default)]
pub struct HandleLedger {
    created: AtomicU64,
    released: AtomicU64,
}

impl HandleLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles created and not yet released.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }
}

/// An owned displayable frame resource. Released when dropped.
#[derive(Debug)]
pub struct FrameHandle {
    id: u64,
    bytes: Bytes,
    ledger: Arc<HandleLedger>,
}

impl FrameHandle {
    fn new(id: u64, bytes: Bytes, ledger: Arc<HandleLedger>) -> Self {
        ledger.created.fetch_add(1, Ordering::SeqCst);
        Self { id, bytes, ledger }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(handle = self.id, "Frame handle released");
    }
}

/// A short-lived view of an accepted frame, handed to consumers.
///
/// Cloning the underlying [`Bytes`] is cheap and does not extend the life
/// of the slot's handle: the slot still releases it when superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub kind: ChannelKind,
    pub id: u64,
    pub bytes: Bytes,
}

/// Latest-frame slot for one image channel.
#[derive(Debug)]
pub struct FrameBufferSlot {
    kind: ChannelKind,
    pending: bool,
    active: Option<FrameHandle>,
    /// Offers rejected since the current frame was accepted.
    dropped: u64,
    next_id: u64,
    ledger: Arc<HandleLedger>,
}

impl FrameBufferSlot {
    pub fn new(kind: ChannelKind) -> Self {
        Self::with_ledger(kind, HandleLedger::new())
    }

    /// Create a slot that records its handles in a shared ledger.
    pub fn with_ledger(kind: ChannelKind, ledger: Arc<HandleLedger>) -> Self {
        Self {
            kind,
            pending: false,
            active: None,
            dropped: 0,
            next_id: 1,
            ledger,
        }
    }

    /// Offer a new frame.
    ///
    /// Returns `false` without touching the slot while the previous frame
    /// is still waiting for [`mark_displayed`](Self::mark_displayed).
    /// Otherwise the new handle is installed first and the superseded one
    /// released afterwards.
    pub fn offer(&mut self, bytes: Bytes) -> bool {
        if self.pending {
            self.dropped += 1;
            return false;
        }
        self.dropped = 0;
        let handle = FrameHandle::new(self.next_id, bytes, Arc::clone(&self.ledger));
        self.next_id += 1;
        self.pending = true;
        let superseded = self.active.replace(handle);
        drop(superseded);
        true
    }

    /// The consumer finished rendering the current frame.
    pub fn mark_displayed(&mut self) {
        self.pending = false;
    }

    /// Frames rejected while the current one has been pending.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Release the current handle and clear the pending flag.
    pub fn release(&mut self) {
        self.pending = false;
        self.dropped = 0;
        if let Some(handle) = self.active.take() {
            tracing::debug!(kind = %self.kind, handle = handle.id(), "Frame slot released");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn has_frame(&self) -> bool {
        self.active.is_some()
    }

    /// A reference to the active frame, if any.
    pub fn current(&self) -> Option<FrameRef> {
        self.active.as_ref().map(|h| FrameRef {
            kind: self.kind,
            id: h.id,
            bytes: h.bytes.clone(),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn ledger(&self) -> &Arc<HandleLedger> {
        &self.ledger
    }
}
