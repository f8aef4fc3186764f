//! Byte-stream transport: TCP, Unix sockets or any duplex stream.
//!
//! Envelopes are framed with [`DelimitedCodec`]. When the peer closes its
//! write side while requests it sent are still being handled, the
//! connection stays writable until those requests are answered.

use std::{fmt, io, ops::Deref, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, warn};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpSocket, TcpStream, ToSocketAddrs, lookup_host},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{Killable, TransportError, Transmittable, link::LinkCore};
use crate::{
    codec::{Decoded, DelimitedCodec},
    engine::Engine,
    envelope::{Envelope, SYNTAX_ERROR_SUBJECT},
    error::UnisocError,
    metrics,
};

/// Sending half of a stream connection.
pub struct StreamLink {
    core: LinkCore<Envelope>,
    peer: Option<String>,
}

impl StreamLink {
    #[must_use]
    pub fn peer(&self) -> Option<&str> { self.peer.as_deref() }
}

#[async_trait]
impl Transmittable for StreamLink {
    fn is_connected(&self) -> bool { self.core.is_connected() }

    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        if envelope.attachment.is_some() {
            return Err(TransportError::AttachmentUnsupported);
        }
        self.core.send(envelope).await
    }
}

#[async_trait]
impl Killable for StreamLink {
    async fn kill(&self) -> Result<(), TransportError> {
        self.core.shutdown().await;
        Ok(())
    }
}

impl fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLink")
            .field("peer", &self.peer)
            .field("connected", &self.core.is_connected())
            .finish_non_exhaustive()
    }
}

/// An engine bound to a byte stream.
#[derive(Debug)]
pub struct StreamConnection {
    engine: Engine,
    link: Arc<StreamLink>,
}

impl StreamConnection {
    /// Run `engine` over an already connected stream.
    ///
    /// Spawns a reader and a writer task; must be called within a Tokio
    /// runtime.
    pub fn spawn<S>(engine: Engine, stream: S, peer: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = DelimitedCodec::new(&engine.config().eom);
        let link = Arc::new(StreamLink {
            core: LinkCore::spawn(FramedWrite::new(write_half, codec.clone())),
            peer,
        });
        engine.attach_link(Arc::clone(&link) as Arc<dyn super::Link>);
        engine.notify_connected();
        metrics::inc_connections();
        tokio::spawn(read_loop(
            engine.clone(),
            Arc::clone(&link),
            FramedRead::new(read_half, codec),
        ));
        Self { engine, link }
    }

    /// Dial a TCP address.
    ///
    /// Honours the engine's connect timeout and keepalive settings.
    ///
    /// # Errors
    ///
    /// Fails if the address does not resolve or the connection fails.
    pub async fn connect_tcp<A: ToSocketAddrs>(engine: Engine, addr: A) -> Result<Self, UnisocError> {
        let keepalive = engine.config().keepalive_duration().is_some();
        let dial = dial_tcp(addr, keepalive);
        let stream = match engine.config().connect_timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                .and_then(|r| r),
            None => dial.await,
        }
        .map_err(TransportError::from)?;
        let peer = stream.peer_addr().ok().map(|a| a.to_string());
        Ok(Self::spawn(engine, stream, peer))
    }

    /// Dial a Unix domain socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be reached.
    #[cfg(unix)]
    pub async fn connect_unix(
        engine: Engine,
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, UnisocError> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(TransportError::from)?;
        Ok(Self::spawn(engine, stream, Some(path.display().to_string())))
    }

    #[must_use]
    pub fn engine(&self) -> &Engine { &self.engine }

    #[must_use]
    pub fn link(&self) -> &Arc<StreamLink> { &self.link }

    #[must_use]
    pub fn into_engine(self) -> Engine { self.engine }
}

impl Deref for StreamConnection {
    type Target = Engine;

    fn deref(&self) -> &Engine { &self.engine }
}

async fn dial_tcp<A: ToSocketAddrs>(addr: A, keepalive: bool) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host(addr).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if keepalive {
            socket.set_keepalive(true)?;
        }
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve")))
}

async fn read_loop<R>(engine: Engine, link: Arc<StreamLink>, mut frames: FramedRead<R, DelimitedCodec>)
where
    R: AsyncRead + Unpin,
{
    let error = loop {
        let item = tokio::select! {
            biased;
            () = link.core.cancelled() => break None,
            item = frames.next() => item,
        };
        match item {
            Some(Ok(Decoded::Envelope(envelope))) => engine.receive(envelope),
            Some(Ok(Decoded::Foreign(value))) => {
                warn!("ignoring non-protocol message: peer={:?}, message={value}", link.peer);
            }
            Some(Ok(Decoded::Malformed { raw, error })) => {
                warn!(
                    "could not parse incoming message: peer={:?}, error={error}, raw={raw}",
                    link.peer
                );
                reply_syntax_error(&engine, error);
            }
            Some(Err(e)) => {
                error!("stream read failed: peer={:?}, error={e}", link.peer);
                metrics::inc_errors();
                break Some(e.to_string());
            }
            None => {
                let pending = engine.pending_inbound();
                if pending > 0 {
                    debug!(
                        "peer closed its write side, answering outstanding requests: peer={:?}, \
                         pending={pending}",
                        link.peer
                    );
                    tokio::select! {
                        () = engine.wait_idle() => {}
                        () = link.core.cancelled() => {}
                    }
                }
                break None;
            }
        }
    };
    link.core.shutdown().await;
    metrics::dec_connections();
    engine.notify_disconnected(error);
}

fn reply_syntax_error(engine: &Engine, error: String) {
    let mut envelope = Envelope::default();
    envelope.subject = SYNTAX_ERROR_SUBJECT.to_owned();
    envelope.error = Some(Value::String(format!(
        "Could not parse incoming message. {error}"
    )));
    let engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.send_envelope(envelope).await {
            debug!("failed to report syntax error to peer: error={e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::{config::Config, engine::EndpointOptions};

    fn engine() -> Engine { Engine::new(Config::default()) }

    #[rstest]
    #[tokio::test]
    async fn request_round_trip_over_duplex() {
        let (a, b) = duplex(4096);
        let client = StreamConnection::spawn(engine(), a, None);
        let server = StreamConnection::spawn(engine(), b, None);
        server
            .register_endpoint("add", EndpointOptions::new().params(["a", "b"]), |call| async move {
                let a: i64 = call.arg_as(0)?;
                let b: i64 = call.arg_as(1)?;
                Ok::<_, crate::error::Fault>(json!(a + b))
            })
            .expect("register");
        let sum = client.request("add", json!([2, 3])).await.expect("response");
        assert_eq!(sum, json!(5));
    }

    #[tokio::test]
    async fn malformed_input_gets_syntax_error_reply() {
        let (a, mut raw) = duplex(4096);
        let _conn = StreamConnection::spawn(engine(), a, None);
        raw.write_all(b"{broken__EOM__").await.expect("write");
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(1), raw.read(&mut buf))
            .await
            .expect("reply in time")
            .expect("read");
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"subject\":\"SyntaxError\""), "{text}");
        assert!(text.ends_with("__EOM__"));
    }

    #[tokio::test]
    async fn half_closed_peer_still_gets_responses() {
        let (a, mut raw) = duplex(4096);
        let conn = StreamConnection::spawn(engine(), a, None);
        conn.register_endpoint("slow", EndpointOptions::new(), |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("done"))
        })
        .expect("register");
        raw.write_all(br#"{"__unisoc":true,"subject":"slow","id":9}__EOM__"#)
            .await
            .expect("write");
        raw.shutdown().await.expect("half close");
        let mut out = String::new();
        raw.read_to_string(&mut out).await.expect("read until close");
        assert!(out.contains("\"id\":9"), "{out}");
        assert!(out.contains("\"data\":\"done\""), "{out}");
        conn.wait_disconnected().await;
    }

    #[tokio::test]
    async fn kill_disconnects_both_sides() {
        let (a, b) = duplex(1024);
        let left = StreamConnection::spawn(engine(), a, None);
        let right = StreamConnection::spawn(engine(), b, None);
        left.kill().await;
        assert!(!left.is_connected());
        tokio::time::timeout(Duration::from_secs(1), right.wait_disconnected())
            .await
            .expect("peer notices close");
        assert!(matches!(
            left.send("late", ()).await,
            Err(UnisocError::NotConnected)
        ));
    }
}
