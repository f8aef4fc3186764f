//! In-process message channel able to carry resource handles.
//!
//! This is the shape of a parent/child IPC channel: each packet is a JSON
//! value plus at most one [`Handle`]. Packets carrying the transfer header
//! are pieces of a composite and are routed to reassembly.

use std::{fmt, ops::Deref, sync::{Arc, Mutex}};

use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Killable, TransportError, Transmittable};
use crate::{
    codec::{FrameError, decode_value},
    engine::{Engine, lock},
    envelope::{Attachment, Envelope, Handle},
    multiplex::TRANSFER_FIELD,
};

/// One message on the channel.
#[derive(Debug)]
pub struct ChannelPacket {
    pub frame: Value,
    pub handle: Option<Handle>,
}

pub type PacketSender = mpsc::UnboundedSender<ChannelPacket>;
pub type PacketReceiver = mpsc::UnboundedReceiver<ChannelPacket>;

/// Sending half of a channel connection.
pub struct ChannelLink {
    tx: Mutex<Option<PacketSender>>,
    cancel: CancellationToken,
}

impl ChannelLink {
    fn send(&self, packet: ChannelPacket) -> Result<(), TransportError> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(packet).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transmittable for ChannelLink {
    fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && lock(&self.tx).as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn transmit(&self, mut envelope: Envelope) -> Result<(), TransportError> {
        let handle = match envelope.attachment.take() {
            None => None,
            Some(Attachment::Handle(handle)) => Some(handle),
            Some(_) => return Err(TransportError::AttachmentUnsupported),
        };
        let frame = serde_json::to_value(&envelope)?;
        self.send(ChannelPacket { frame, handle })
    }

    fn carries_handles(&self) -> bool { true }

    async fn transmit_piece(
        &self,
        piece: Value,
        handle: Option<Handle>,
    ) -> Result<(), TransportError> {
        self.send(ChannelPacket {
            frame: piece,
            handle,
        })
    }
}

#[async_trait]
impl Killable for ChannelLink {
    async fn kill(&self) -> Result<(), TransportError> {
        lock(&self.tx).take();
        self.cancel.cancel();
        Ok(())
    }
}

impl fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// An engine bound to a packet channel.
#[derive(Debug)]
pub struct ChannelConnection {
    engine: Engine,
    link: Arc<ChannelLink>,
}

impl ChannelConnection {
    /// Run `engine` over an existing pair of packet queues.
    pub fn from_parts(engine: Engine, tx: PacketSender, rx: PacketReceiver) -> Self {
        let link = Arc::new(ChannelLink {
            tx: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
        });
        engine.attach_link(Arc::clone(&link) as Arc<dyn super::Link>);
        engine.notify_connected();
        tokio::spawn(read_loop(engine.clone(), Arc::clone(&link), rx));
        Self { engine, link }
    }

    /// Connect two engines to each other.
    pub fn pair(a: Engine, b: Engine) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::from_parts(a, a_tx, b_rx), Self::from_parts(b, b_tx, a_rx))
    }

    #[must_use]
    pub fn engine(&self) -> &Engine { &self.engine }

    #[must_use]
    pub fn link(&self) -> &Arc<ChannelLink> { &self.link }
}

impl Deref for ChannelConnection {
    type Target = Engine;

    fn deref(&self) -> &Engine { &self.engine }
}

async fn read_loop(engine: Engine, link: Arc<ChannelLink>, mut rx: PacketReceiver) {
    loop {
        let packet = tokio::select! {
            biased;
            () = link.cancel.cancelled() => break,
            packet = rx.recv() => packet,
        };
        let Some(ChannelPacket { frame, handle }) = packet else {
            break;
        };
        if frame.get(TRANSFER_FIELD).is_some() {
            engine.receive_piece(frame, handle);
            continue;
        }
        match decode_value(frame) {
            Ok(mut envelope) => {
                envelope.attachment = handle.map(Attachment::Handle);
                engine.receive(envelope);
            }
            Err(FrameError::Foreign) => warn!("ignoring non-protocol packet on channel"),
            Err(e) => warn!("dropping badly formatted packet: error={e}"),
        }
    }
    lock(&link.tx).take();
    link.cancel.cancel();
    engine.notify_disconnected(None);
}
