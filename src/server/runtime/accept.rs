//! Accept loops that hand new peers to the server.

use std::{io, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    select,
    sync::mpsc,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffConfig;
use crate::server::{FramePeer, Server};

/// Source of incoming byte-stream connections.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
pub(in crate::server) trait AcceptListener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next connection and a printable peer address.
    async fn accept(&self) -> io::Result<(Self::Stream, Option<String>)>;

    fn describe(&self) -> String;
}

#[async_trait]
impl AcceptListener for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, Option<String>)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((stream, Some(addr.to_string())))
    }

    fn describe(&self) -> String {
        self.local_addr()
            .map_or_else(|_| "tcp".to_owned(), |a| a.to_string())
    }
}

#[cfg(unix)]
#[async_trait]
impl AcceptListener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<(Self::Stream, Option<String>)> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok((stream, None))
    }

    fn describe(&self) -> String {
        self.local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_owned())
    }
}

/// Accept connections from `listener` until `shutdown` is cancelled.
///
/// Accept failures are retried after an exponentially growing delay that
/// resets after the next success.
pub(in crate::server) async fn accept_loop<L>(
    listener: Arc<L>,
    server: Server,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
) where
    L: AcceptListener + 'static,
{
    let backoff = backoff.normalized();
    let mut delay = backoff.initial_delay;
    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    server.accept_stream(stream, peer);
                    delay = backoff.initial_delay;
                }
                Err(e) => {
                    warn!("accept error: error={e:?}, listener={}", listener.describe());
                    sleep(delay).await;
                    delay = backoff.next(delay);
                }
            },
        }
    }
    debug!("accept loop stopped: listener={}", listener.describe());
}

/// Take already-established frame channels from `acceptor` until it closes
/// or `shutdown` is cancelled.
pub(in crate::server) async fn accept_frames(
    mut acceptor: mpsc::Receiver<FramePeer>,
    server: Server,
    shutdown: CancellationToken,
) {
    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            peer = acceptor.recv() => match peer {
                Some(peer) => {
                    server.accept_frames(peer);
                }
                None => break,
            },
        }
    }
}
