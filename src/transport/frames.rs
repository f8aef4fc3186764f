//! Message-oriented full-duplex transport.
//!
//! Works over any pair of `Sink<String>` and `Stream<Item = io::Result<String>>`,
//! one envelope per frame, which is the shape of a WebSocket adapter. Frames
//! without the protocol marker and frames that fail to parse are logged and
//! dropped.

use std::{fmt, future, io, ops::Deref, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{error, warn};

use super::{Killable, TransportError, Transmittable, link::LinkCore};
use crate::{
    codec::{FrameError, decode_frame, encode_frame},
    engine::Engine,
    envelope::Envelope,
    metrics,
};

pub type BoxFrameSink = Pin<Box<dyn Sink<String, Error = io::Error> + Send>>;
pub type BoxFrameStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Sending half of a frame connection.
pub struct FrameLink {
    core: LinkCore<Envelope>,
    peer: Option<String>,
}

#[async_trait]
impl Transmittable for FrameLink {
    fn is_connected(&self) -> bool { self.core.is_connected() }

    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        if envelope.attachment.is_some() {
            return Err(TransportError::AttachmentUnsupported);
        }
        self.core.send(envelope).await
    }
}

#[async_trait]
impl Killable for FrameLink {
    async fn kill(&self) -> Result<(), TransportError> {
        self.core.shutdown().await;
        Ok(())
    }
}

impl fmt::Debug for FrameLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLink")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// An engine bound to a frame channel.
#[derive(Debug)]
pub struct FrameConnection {
    engine: Engine,
    link: Arc<FrameLink>,
}

impl FrameConnection {
    /// Run `engine` over an open frame channel.
    pub fn spawn<Si, St>(engine: Engine, sink: Si, stream: St, peer: Option<String>) -> Self
    where
        Si: Sink<String, Error = io::Error> + Send + 'static,
        St: Stream<Item = io::Result<String>> + Send + 'static,
    {
        let sink: BoxFrameSink = Box::pin(sink);
        let sink = sink.with(|envelope: Envelope| {
            future::ready(
                encode_frame(&envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            )
        });
        let link = Arc::new(FrameLink {
            core: LinkCore::spawn(sink),
            peer,
        });
        engine.attach_link(Arc::clone(&link) as Arc<dyn super::Link>);
        engine.notify_connected();
        metrics::inc_connections();
        let stream: BoxFrameStream = Box::pin(stream);
        tokio::spawn(read_loop(engine.clone(), Arc::clone(&link), stream));
        Self { engine, link }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine { &self.engine }

    #[must_use]
    pub fn link(&self) -> &Arc<FrameLink> { &self.link }
}

impl Deref for FrameConnection {
    type Target = Engine;

    fn deref(&self) -> &Engine { &self.engine }
}

async fn read_loop(engine: Engine, link: Arc<FrameLink>, mut stream: BoxFrameStream) {
    let error = loop {
        let frame = tokio::select! {
            biased;
            () = link.core.cancelled() => break None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(text)) => match decode_frame(&text) {
                Ok(envelope) => engine.receive(envelope),
                Err(FrameError::Foreign) => {
                    warn!("ignoring non-protocol frame: peer={:?}", link.peer);
                }
                Err(e @ FrameError::Malformed(_)) => {
                    warn!("dropping badly formatted frame: peer={:?}, error={e}", link.peer);
                }
            },
            Some(Err(e)) => {
                error!("frame read failed: peer={:?}, error={e}", link.peer);
                metrics::inc_errors();
                break Some(e.to_string());
            }
            None => break None,
        }
    };
    link.core.shutdown().await;
    metrics::dec_connections();
    engine.notify_disconnected(error);
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;
    use serde_json::json;

    use super::*;
    use crate::{config::Config, engine::EndpointOptions, error::Fault};

    /// Two frame connections wired back to back through in-memory channels.
    fn pair() -> (FrameConnection, FrameConnection) {
        let (a_tx, a_rx) = mpsc::unbounded::<String>();
        let (b_tx, b_rx) = mpsc::unbounded::<String>();
        let sink = |tx: mpsc::UnboundedSender<String>| {
            tx.sink_map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
        };
        let left = FrameConnection::spawn(
            Engine::new(Config::default()),
            sink(a_tx),
            b_rx.map(Ok),
            Some("left".into()),
        );
        let right = FrameConnection::spawn(
            Engine::new(Config::default()),
            sink(b_tx),
            a_rx.map(Ok),
            Some("right".into()),
        );
        (left, right)
    }

    #[tokio::test]
    async fn frames_carry_requests_and_responses() {
        let (left, right) = pair();
        right
            .register_endpoint("echo", EndpointOptions::new().param("v"), |call| async move {
                Ok::<_, Fault>(call.arg(0).cloned().unwrap_or_default())
            })
            .expect("register");
        assert_eq!(
            left.request("echo", json!(["hi"])).await.expect("echo"),
            json!("hi")
        );
    }

    #[tokio::test]
    async fn closing_one_side_disconnects_the_other() {
        let (left, right) = pair();
        left.kill().await;
        right.wait_disconnected().await;
        assert!(!right.is_connected());
    }
}
