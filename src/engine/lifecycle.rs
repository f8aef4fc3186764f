//! Connection lifecycle state.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::watch;

use super::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Pending,
    Connected,
    Disconnected,
}

/// Tracks state transitions and guarantees the disconnect notification
/// fires at most once per connection.
pub(crate) struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    ever_connected: AtomicBool,
    disconnect_emitted: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Pending),
            ever_connected: AtomicBool::new(false),
            disconnect_emitted: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState { *self.state.borrow() }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> { self.state.subscribe() }

    pub(crate) fn ever_connected(&self) -> bool { self.ever_connected.load(Ordering::Acquire) }

    pub(crate) fn last_error(&self) -> Option<String> { lock(&self.last_error).clone() }

    /// Returns `true` if this call performed the transition.
    pub(crate) fn mark_connected(&self) -> bool {
        self.ever_connected.store(true, Ordering::Release);
        self.disconnect_emitted.store(false, Ordering::Release);
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                false
            } else {
                *s = ConnectionState::Connected;
                true
            }
        })
    }

    /// Returns `true` only for the first call after a connect.
    pub(crate) fn mark_disconnected(&self, error: Option<String>) -> bool {
        if self.disconnect_emitted.swap(true, Ordering::AcqRel) {
            return false;
        }
        if error.is_some() {
            *lock(&self.last_error) = error;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }
}
