//! Errors raised by [`Server`](super::Server) operations.

use std::io;

use thiserror::Error;

use super::ConnectionId;
use crate::error::UnisocError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding a listener failed.
    #[error("bind error: {0}")]
    Bind(#[from] io::Error),

    /// The server has been shut down and accepts no new listeners.
    #[error("server is shutting down")]
    ShuttingDown,

    /// A broadcast named neither a subject nor a group.
    #[error("broadcast needs a subject or a group")]
    NoSubject,

    #[error(transparent)]
    Engine(#[from] UnisocError),

    /// Some peers could not be reached. Every targeted peer was attempted.
    #[error("broadcast failed for {count} of {attempted} peers", count = .failures.len())]
    Broadcast {
        attempted: usize,
        failures: Vec<(ConnectionId, UnisocError)>,
    },
}
