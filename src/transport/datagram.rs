//! Connectionless datagram transport over UDP.
//!
//! Every datagram carries one envelope. The sender's address is recorded on
//! each received envelope so that responses go back to it; outgoing
//! messages name their destination explicitly.

use std::{
    fmt,
    io,
    net::{Ipv4Addr, SocketAddr},
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::{Killable, Listenable, TransportError, Transmittable};
use crate::{
    codec::{FrameError, decode_frame, encode_frame},
    engine::{Engine, to_data},
    envelope::Envelope,
    error::UnisocError,
    metrics,
};

/// Largest datagram accepted.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Sending half of a datagram socket.
pub struct DatagramLink {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

#[async_trait]
impl Transmittable for DatagramLink {
    fn is_connected(&self) -> bool { !self.cancel.is_cancelled() }

    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        let peer = envelope.peer.ok_or(TransportError::NoDestination)?;
        let text = encode_frame(&envelope)?;
        self.socket.send_to(text.as_bytes(), peer).await?;
        Ok(())
    }
}

#[async_trait]
impl Killable for DatagramLink {
    async fn kill(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        Ok(())
    }
}

impl fmt::Debug for DatagramLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramLink")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// An engine bound to a UDP socket.
#[derive(Debug)]
pub struct DatagramConnection {
    engine: Engine,
    link: Arc<DatagramLink>,
}

impl DatagramConnection {
    /// Bind a socket and start receiving.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind<A: ToSocketAddrs>(engine: Engine, addr: A) -> Result<Self, UnisocError> {
        let socket = UdpSocket::bind(addr).await.map_err(TransportError::from)?;
        Ok(Self::from_socket(engine, socket))
    }

    /// Run `engine` over an existing socket.
    pub fn from_socket(engine: Engine, socket: UdpSocket) -> Self {
        let link = Arc::new(DatagramLink {
            socket: Arc::new(socket),
            cancel: CancellationToken::new(),
        });
        engine.attach_link(Arc::clone(&link) as Arc<dyn super::Link>);
        engine.notify_connected();
        tokio::spawn(read_loop(engine.clone(), Arc::clone(&link)));
        Self { engine, link }
    }

    /// Local address of the socket.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.link.socket.local_addr() }

    /// Join an IPv4 multicast group on `interface`.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.link.socket.join_multicast_v4(group, interface)
    }

    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn set_broadcast(&self, on: bool) -> io::Result<()> { self.link.socket.set_broadcast(on) }

    /// Send a one-way message to `peer`.
    ///
    /// # Errors
    ///
    /// As for [`Engine::send`].
    pub async fn send_to<T: Serialize>(
        &self,
        peer: SocketAddr,
        subject: &str,
        data: T,
    ) -> Result<(), UnisocError> {
        let envelope = Envelope::message(subject, to_data(data)?)?.with_peer(peer);
        self.engine.send_envelope(envelope).await
    }

    /// Send a request to `peer` and wait for its response data.
    ///
    /// # Errors
    ///
    /// As for [`Engine::request`].
    pub async fn request_to<T: Serialize>(
        &self,
        peer: SocketAddr,
        subject: &str,
        data: T,
        timeout: Option<Duration>,
    ) -> Result<Value, UnisocError> {
        let envelope = Envelope::message(subject, to_data(data)?)?.with_peer(peer);
        let timeout = timeout.or_else(|| self.engine.config().request_timeout_duration());
        let response = self.engine.request_envelope(envelope, timeout).await?;
        Ok(response.data.unwrap_or(Value::Null))
    }

    #[must_use]
    pub fn engine(&self) -> &Engine { &self.engine }
}

impl Deref for DatagramConnection {
    type Target = Engine;

    fn deref(&self) -> &Engine { &self.engine }
}

/// Binding again on the current address is a no-op; any other address is
/// refused since a datagram connection owns exactly one socket.
#[async_trait]
impl Listenable for DatagramConnection {
    type Target = SocketAddr;
    type Listening = SocketAddr;
    type Error = io::Error;

    async fn listen(&self, target: SocketAddr) -> Result<SocketAddr, io::Error> {
        let current = self.local_addr()?;
        let same_port = target.port() == 0 || target.port() == current.port();
        let same_ip = target.ip().is_unspecified() || target.ip() == current.ip();
        if same_port && same_ip {
            return Ok(current);
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("already bound to {current}, cannot listen on {target}"),
        ))
    }
}

async fn read_loop(engine: Engine, link: Arc<DatagramLink>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let error = loop {
        let received = tokio::select! {
            biased;
            () = link.cancel.cancelled() => break None,
            received = link.socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // ICMP port unreachable from an earlier send.
                debug!("datagram peer unreachable: error={e}");
                continue;
            }
            Err(e) => {
                error!("datagram receive failed: error={e}");
                metrics::inc_errors();
                break Some(e.to_string());
            }
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        match decode_frame(&text) {
            Ok(envelope) => engine.receive(envelope.with_peer(from)),
            Err(FrameError::Foreign) => warn!("ignoring non-protocol datagram: from={from}"),
            Err(e) => warn!("dropping badly formatted datagram: from={from}, error={e}"),
        }
    };
    link.cancel.cancel();
    engine.notify_disconnected(error);
}
