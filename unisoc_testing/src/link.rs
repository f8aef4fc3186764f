//! A [`Link`](unisoc::Link) that records traffic instead of sending it.

use std::sync::{
    Mutex,
    PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use unisoc::{Envelope, Killable, Transmittable, TransportError};

/// Recording link for driving an engine without a peer.
///
/// Transmitted envelopes are kept in order. The link can be switched to
/// disconnected, made to fail every send, or made to hang on kill so that
/// shutdown paths can be exercised.
#[derive(Debug, Default)]
pub struct MockLink {
    sent: Mutex<Vec<Envelope>>,
    down: AtomicBool,
    failing: AtomicBool,
    hang_on_kill: AtomicBool,
    kills: AtomicUsize,
}

impl MockLink {
    pub fn new() -> Self { Self::default() }

    /// A link whose [`kill`](Killable::kill) never completes.
    pub fn hanging() -> Self {
        let link = Self::default();
        link.hang_on_kill.store(true, Ordering::SeqCst);
        link
    }

    pub fn set_connected(&self, connected: bool) { self.down.store(!connected, Ordering::SeqCst); }

    /// Make every subsequent transmit fail with [`TransportError::Closed`].
    pub fn fail_sends(&self) { self.failing.store(true, Ordering::SeqCst); }

    /// Envelopes transmitted so far, without attachments.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Envelope::snapshot)
            .collect()
    }

    /// Subjects of the envelopes transmitted so far.
    pub fn subjects(&self) -> Vec<String> { self.sent().into_iter().map(|e| e.subject).collect() }

    pub fn kills(&self) -> usize { self.kills.load(Ordering::SeqCst) }
}

#[async_trait]
impl Transmittable for MockLink {
    fn is_connected(&self) -> bool { !self.down.load(Ordering::SeqCst) }

    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope);
        Ok(())
    }
}

#[async_trait]
impl Killable for MockLink {
    async fn kill(&self) -> Result<(), TransportError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_kill.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
