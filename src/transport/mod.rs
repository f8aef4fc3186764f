//! Transport capabilities and concrete transports.
//!
//! The engine only needs something it can transmit envelopes through and
//! kill; servers additionally need something they can listen on. Each
//! concern is its own trait so a transport implements exactly what it can
//! do.

pub mod channel;
pub mod datagram;
pub mod frames;
mod link;
pub mod reconnect;
pub mod stream;

use std::io;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use self::{
    channel::ChannelConnection,
    datagram::DatagramConnection,
    frames::FrameConnection,
    reconnect::ReconnectingClient,
    stream::StreamConnection,
};
use crate::{
    codec::CodecError,
    envelope::{Envelope, Handle},
};

/// Errors raised while moving envelopes over a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// Reading from or writing to the underlying channel failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// An envelope or transfer piece could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    /// The stream framing layer rejected the input.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A connectionless transport was asked to send without a peer address.
    #[error("no destination address for datagram")]
    NoDestination,
    /// The transport cannot carry resource handles.
    #[error("transport cannot carry attachments")]
    AttachmentUnsupported,
    /// Some pieces of a composite transfer failed.
    #[error("{failed} of {total} transfer pieces failed")]
    Partial {
        /// Pieces the transport refused.
        failed: usize,
        /// Pieces attempted, metadata included.
        total: usize,
    },
}

/// Something envelopes can be sent through.
#[async_trait]
pub trait Transmittable: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Serialize and send one envelope. Resolves once the transport has
    /// accepted the bytes.
    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Whether [`transmit_piece`](Self::transmit_piece) can carry handles.
    fn carries_handles(&self) -> bool { false }

    /// Send one raw piece of a composite transfer with an optional handle.
    async fn transmit_piece(
        &self,
        piece: Value,
        handle: Option<Handle>,
    ) -> Result<(), TransportError> {
        let _ = (piece, handle);
        Err(TransportError::AttachmentUnsupported)
    }
}

/// Something that can be closed.
#[async_trait]
pub trait Killable: Send + Sync {
    async fn kill(&self) -> Result<(), TransportError>;
}

/// Something that accepts incoming connections or datagrams.
#[async_trait]
pub trait Listenable: Send + Sync {
    type Target: Send;
    type Listening: Send;
    type Error: std::error::Error + Send + Sync;

    /// Start listening. Listening again on the same target is a no-op that
    /// returns the existing listener.
    async fn listen(&self, target: Self::Target) -> Result<Self::Listening, Self::Error>;
}

/// The transport half of a connection as seen by the engine.
pub trait Link: Transmittable + Killable {}

impl<T: Transmittable + Killable> Link for T {}
