//! Client-side reconnection for stream transports.

use std::{ops::Deref, time::Duration};

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::stream::StreamConnection;
use crate::{engine::Engine, error::UnisocError};

/// A TCP client that re-dials its address after the connection drops.
///
/// The same [`Engine`] is reused for every connection, so endpoints and
/// listeners survive reconnects. Requests in flight when the connection
/// drops fail; nothing is replayed.
#[derive(Debug)]
pub struct ReconnectingClient {
    engine: Engine,
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl ReconnectingClient {
    /// Connect once, then keep reconnecting every
    /// `reconnect_interval_ms` from the engine's configuration. With the
    /// interval disabled this behaves like a plain connection.
    ///
    /// # Errors
    ///
    /// Fails if the first connection attempt fails.
    pub async fn connect(engine: Engine, addr: impl Into<String>) -> Result<Self, UnisocError> {
        let addr = addr.into();
        StreamConnection::connect_tcp(engine.clone(), addr.as_str()).await?;
        let stop = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            engine.clone(),
            addr,
            engine.config().reconnect_interval_duration(),
            stop.clone(),
        ));
        Ok(Self {
            engine,
            stop,
            supervisor,
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Engine { &self.engine }

    /// Stop reconnecting and close the current connection.
    pub async fn close(self) {
        self.stop.cancel();
        self.engine.kill().await;
        if let Err(e) = self.supervisor.await {
            warn!("reconnect supervisor ended abnormally: error={e}");
        }
    }
}

impl Deref for ReconnectingClient {
    type Target = Engine;

    fn deref(&self) -> &Engine { &self.engine }
}

async fn supervise(engine: Engine, addr: String, interval: Option<Duration>, stop: CancellationToken) {
    let Some(interval) = interval else {
        return;
    };
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = engine.wait_disconnected() => {}
        }
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            match StreamConnection::connect_tcp(engine.clone(), addr.as_str()).await {
                Ok(_) => {
                    info!("reconnected: engine={}, addr={addr}", engine.name());
                    break;
                }
                Err(e) => warn!(
                    "reconnect failed: engine={}, addr={addr}, retry_in={interval:?}, error={e}",
                    engine.name()
                ),
            }
        }
    }
}
