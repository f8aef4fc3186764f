//! Fan-out server.
//!
//! A [`Server`] accepts peers from any number of listeners, gives each one
//! its own [`Engine`] wired to the server's shared endpoints and hooks, and
//! tracks them by [`ConnectionId`]. Peers can be grouped for targeted
//! [`broadcast`](Server::broadcast)s. Shutdown notifies peers, stops the
//! listeners and waits a bounded time for peers to drain.

mod broadcast;
pub mod error;
mod registry;
mod runtime;

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
#[cfg(unix)]
use std::path::PathBuf;

use async_trait::async_trait;
use futures::{Sink, Stream, future::join_all};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{broadcast as events, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub use self::{
    broadcast::Broadcast,
    error::ServerError,
    registry::ConnectionId,
    runtime::BackoffConfig,
};
use self::{
    registry::Registry,
    runtime::{AcceptListener, accept_frames, accept_loop},
};
use crate::{
    config::Config,
    engine::{
        ConnectionState,
        Engine,
        EndpointOptions,
        IdAllocator,
        SharedEndpoints,
        lock,
    },
    error::Fault,
    transport::{
        Link,
        Listenable,
        frames::{BoxFrameSink, BoxFrameStream, FrameConnection},
        stream::StreamConnection,
    },
};

/// Subject of the notice sent to peers when the server shuts down.
pub const SHUTDOWN_SUBJECT: &str = "_shutdown";

const EVENT_BUFFER: usize = 256;
const NOTICE_TIMEOUT: Duration = Duration::from_millis(500);

/// Where a server accepts peers.
pub enum ListenTarget {
    /// TCP on all interfaces.
    Port(u16),
    Addr(SocketAddr),
    /// An already bound TCP listener.
    Tcp(TcpListener),
    /// A Unix domain socket path.
    #[cfg(unix)]
    Path(PathBuf),
    /// Frame channels handed over by an external acceptor, such as a
    /// WebSocket server.
    Frames {
        name: String,
        acceptor: mpsc::Receiver<FramePeer>,
    },
}

impl fmt::Debug for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::Port(port) => f.debug_tuple("Port").field(port).finish(),
            ListenTarget::Addr(addr) => f.debug_tuple("Addr").field(addr).finish(),
            ListenTarget::Tcp(listener) => f.debug_tuple("Tcp").field(&listener.local_addr().ok()).finish(),
            #[cfg(unix)]
            ListenTarget::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ListenTarget::Frames { name, .. } => f.debug_struct("Frames").field("name", name).finish(),
        }
    }
}

/// An active listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Listening {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
    Frames(String),
}

/// One established frame channel offered to the server.
pub struct FramePeer {
    sink: BoxFrameSink,
    stream: BoxFrameStream,
    peer: Option<String>,
}

impl FramePeer {
    pub fn new<Si, St>(sink: Si, stream: St, peer: Option<String>) -> Self
    where
        Si: Sink<String, Error = std::io::Error> + Send + 'static,
        St: Stream<Item = std::io::Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer,
        }
    }
}

/// Lifecycle notifications published by a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Listening(Listening),
    Unlistening(Listening),
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    /// A peer connected while none were connected.
    First,
    /// The last connected peer went away.
    Last,
}

/// Outcome of [`Server::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Peers still connected when the drain timeout elapsed. They were
    /// closed forcibly.
    pub undrained: Vec<ConnectionId>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool { self.undrained.is_empty() }
}

struct ListenerEntry {
    listening: Listening,
    cancel: CancellationToken,
}

struct Shared {
    engine: Engine,
    config: Config,
    registry: Arc<Registry>,
    events: events::Sender<ServerEvent>,
    listeners: Mutex<Vec<ListenerEntry>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: Option<Config>,
    backoff: Option<BackoffConfig>,
    ids: Option<Box<dyn IdAllocator>>,
    name: Option<String>,
}

impl ServerBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Allocator for connection ids.
    #[must_use]
    pub fn ids(mut self, ids: Box<dyn IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Server {
        let config = self.config.unwrap_or_default();
        let engine = Engine::builder()
            .name(self.name.unwrap_or_else(|| "server".to_owned()))
            .config(config.clone())
            .build();
        let registry = Arc::new(match self.ids {
            Some(ids) => Registry::with_ids(ids),
            None => Registry::default(),
        });
        register_group_endpoints(&engine, &registry);
        Server {
            inner: Arc::new(Shared {
                engine,
                config,
                registry,
                events: events::channel(EVENT_BUFFER).0,
                listeners: Mutex::new(Vec::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                backoff: self.backoff.unwrap_or_default(),
            }),
        }
    }
}

fn register_group_endpoints(engine: &Engine, registry: &Arc<Registry>) {
    for (subject, join) in [("subscribe", true), ("unsubscribe", false)] {
        let registry = Arc::downgrade(registry);
        let description = if join { "Join a group" } else { "Leave a group" };
        let result = engine.register_endpoint(
            subject,
            EndpointOptions::new()
                .param("group")
                .with_engine()
                .description(description),
            move |call| {
                let registry = registry.upgrade();
                async move {
                    let group: String = call.arg_as(0)?;
                    let (Some(registry), Some(peer)) = (registry, call.engine()) else {
                        return Err(Fault::from("server is not accepting group changes"));
                    };
                    let id = ConnectionId::new(peer.id());
                    let changed = if join {
                        registry.subscribe(&group, id)
                    } else {
                        registry.unsubscribe(&group, id)
                    };
                    Ok(Value::Bool(changed))
                }
            },
        );
        if let Err(e) = result {
            error!("failed to register server endpoint: subject={subject}, error={e}");
        }
    }
}

/// Accepts and tracks peers. Cloning shares the server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Shared>,
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder { ServerBuilder::default() }

    #[must_use]
    pub fn new(config: Config) -> Self { Self::builder().config(config).build() }

    /// The server's own engine. Endpoints registered here are shared with
    /// every peer; its hooks are inherited by every peer.
    #[must_use]
    pub fn engine(&self) -> &Engine { &self.inner.engine }

    #[must_use]
    pub fn events(&self) -> events::Receiver<ServerEvent> { self.inner.events.subscribe() }

    #[must_use]
    pub fn client(&self, id: ConnectionId) -> Option<Engine> { self.inner.registry.get(id) }

    /// Every tracked peer, ordered by id.
    #[must_use]
    pub fn clients(&self) -> Vec<(ConnectionId, Engine)> { self.inner.registry.all() }

    #[must_use]
    pub fn len(&self) -> usize { self.inner.registry.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[must_use]
    pub fn group_members(&self, group: &str) -> Vec<ConnectionId> { self.inner.registry.members(group) }

    #[must_use]
    pub fn groups(&self) -> Vec<String> { self.inner.registry.groups() }

    /// Add a peer to a group. Returns `false` when it already was a member
    /// or is not connected.
    pub fn subscribe(&self, group: &str, id: ConnectionId) -> bool { self.inner.registry.subscribe(group, id) }

    /// Remove a peer from a group. Returns `false` when it was not a member.
    pub fn unsubscribe(&self, group: &str, id: ConnectionId) -> bool {
        self.inner.registry.unsubscribe(group, id)
    }

    #[must_use]
    pub fn listening(&self) -> Vec<Listening> {
        lock(&self.inner.listeners)
            .iter()
            .map(|e| e.listening.clone())
            .collect()
    }

    fn emit(&self, event: ServerEvent) {
        debug!("server event: {event:?}");
        let _ = self.inner.events.send(event);
    }

    /// Start accepting peers on `target`.
    ///
    /// Listening again on an address that is already served returns the
    /// existing listener.
    ///
    /// # Errors
    ///
    /// Fails when binding fails or the server is shutting down.
    pub async fn listen(&self, target: ListenTarget) -> Result<Listening, ServerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        match target {
            ListenTarget::Port(port) => self.listen_addr(SocketAddr::from(([0, 0, 0, 0], port))).await,
            ListenTarget::Addr(addr) => self.listen_addr(addr).await,
            ListenTarget::Tcp(listener) => {
                let listening = Listening::Tcp(listener.local_addr()?);
                if let Some(existing) = self.find(&listening) {
                    return Ok(existing);
                }
                Ok(self.serve(listening, listener))
            }
            #[cfg(unix)]
            ListenTarget::Path(path) => {
                let listening = Listening::Unix(path.clone());
                if let Some(existing) = self.find(&listening) {
                    return Ok(existing);
                }
                let listener = tokio::net::UnixListener::bind(&path)?;
                Ok(self.serve(listening, listener))
            }
            ListenTarget::Frames { name, acceptor } => {
                let listening = Listening::Frames(name);
                if let Some(existing) = self.find(&listening) {
                    warn!("frame acceptor already attached, ignoring the new one: {existing:?}");
                    return Ok(existing);
                }
                let cancel = self.register_listener(&listening);
                let server = self.clone();
                let done = listening.clone();
                self.inner.tracker.spawn(async move {
                    accept_frames(acceptor, server.clone(), cancel).await;
                    server.unlisten_finished(&done);
                });
                Ok(listening)
            }
        }
    }

    async fn listen_addr(&self, addr: SocketAddr) -> Result<Listening, ServerError> {
        if addr.port() != 0
            && let Some(existing) = self.find(&Listening::Tcp(addr))
        {
            return Ok(existing);
        }
        let listener = TcpListener::bind(addr).await?;
        let listening = Listening::Tcp(listener.local_addr()?);
        Ok(self.serve(listening, listener))
    }

    fn find(&self, listening: &Listening) -> Option<Listening> {
        lock(&self.inner.listeners)
            .iter()
            .find(|e| &e.listening == listening)
            .map(|e| e.listening.clone())
    }

    fn register_listener(&self, listening: &Listening) -> CancellationToken {
        let cancel = self.inner.shutdown.child_token();
        lock(&self.inner.listeners).push(ListenerEntry {
            listening: listening.clone(),
            cancel: cancel.clone(),
        });
        info!("server listening: {listening:?}");
        self.emit(ServerEvent::Listening(listening.clone()));
        cancel
    }

    fn serve<L: AcceptListener + 'static>(&self, listening: Listening, listener: L) -> Listening {
        let cancel = self.register_listener(&listening);
        let server = self.clone();
        let done = listening.clone();
        let backoff = self.inner.backoff;
        self.inner.tracker.spawn(async move {
            accept_loop(Arc::new(listener), server.clone(), cancel, backoff).await;
            server.unlisten_finished(&done);
        });
        listening
    }

    /// Stop one listener. Connected peers are unaffected.
    pub fn unlisten(&self, listening: &Listening) -> bool {
        match lock(&self.inner.listeners).iter().find(|e| &e.listening == listening) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn unlisten_finished(&self, listening: &Listening) {
        lock(&self.inner.listeners).retain(|e| &e.listening != listening);
        #[cfg(unix)]
        if let Listening::Unix(path) = listening
            && let Err(e) = std::fs::remove_file(path)
        {
            debug!("could not remove socket file: path={}, error={e}", path.display());
        }
        info!("server stopped listening: {listening:?}");
        self.emit(ServerEvent::Unlistening(listening.clone()));
    }

    fn admit(&self) -> (ConnectionId, Engine) {
        let shared = &self.inner.engine;
        let config = &self.inner.config;
        self.inner.registry.admit(|id| {
            Engine::builder()
                .id(id.as_u64())
                .name(format!("peer_{}", id.as_u64()))
                .config(config.clone())
                .parent_hooks(Arc::clone(shared.hooks()))
                .share(SharedEndpoints::Engine(shared.clone()))
                .build()
        })
    }

    /// Track a connected peer until it disconnects.
    fn watch(&self, id: ConnectionId, engine: Engine) {
        let registry = &self.inner.registry;
        info!("peer connected: peer={id}, clients={}", registry.len());
        let first = registry.mark_connected();
        self.emit(ServerEvent::Connected(id));
        if first {
            self.emit(ServerEvent::First);
        }
        let server = self.clone();
        self.inner.tracker.spawn(async move {
            engine.wait_disconnected().await;
            let last = server.inner.registry.remove(id, true);
            info!(
                "peer disconnected: peer={id}, reason={:?}, clients={}",
                engine.last_error(),
                server.len()
            );
            server.emit(ServerEvent::Disconnected(id));
            if last {
                server.emit(ServerEvent::Last);
            }
        });
    }

    /// Serve a peer over any byte stream.
    pub fn accept_stream<S>(&self, stream: S, peer: Option<String>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (id, engine) = self.admit();
        debug!("accepting stream peer: peer={id}, addr={peer:?}");
        StreamConnection::spawn(engine.clone(), stream, peer);
        self.watch(id, engine);
        id
    }

    /// Serve a peer over an established frame channel.
    pub fn accept_frames(&self, peer: FramePeer) -> ConnectionId {
        let (id, engine) = self.admit();
        debug!("accepting frame peer: peer={id}, addr={:?}", peer.peer);
        FrameConnection::spawn(engine.clone(), peer.sink, peer.stream, peer.peer);
        self.watch(id, engine);
        id
    }

    /// Serve a peer over a custom link. The caller feeds inbound envelopes
    /// into [`Engine::receive`] of the returned engine.
    pub fn attach(&self, link: Arc<dyn Link>) -> (ConnectionId, Engine) {
        let (id, engine) = self.admit();
        engine.attach_link(link);
        engine.notify_connected();
        self.watch(id, engine.clone());
        (id, engine)
    }

    /// Shut down with the configured drain timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_timeout(self.inner.config.shutdown_timeout_duration())
            .await
    }

    /// Notify peers, stop listening and wait up to `limit` for peers to
    /// finish their inbound requests and close. Peers still open afterwards
    /// are closed forcibly and reported.
    pub async fn shutdown_with_timeout(&self, limit: Duration) -> ShutdownReport {
        let peers = self.clients();
        info!("server shutting down: clients={}, timeout={limit:?}", peers.len());

        join_all(peers.iter().map(|(id, engine)| async move {
            match tokio::time::timeout(NOTICE_TIMEOUT, engine.send(SHUTDOWN_SUBJECT, ())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("shutdown notice failed: peer={id}, error={e}"),
                Err(_) => debug!("shutdown notice timed out: peer={id}"),
            }
        }))
        .await;

        self.inner.shutdown.cancel();

        let drain = join_all(peers.iter().map(|(_, engine)| async move {
            engine.wait_idle().await;
            engine.kill().await;
        }));
        if tokio::time::timeout(limit, drain).await.is_err() {
            warn!("shutdown drain timed out: timeout={limit:?}");
        }

        let mut report = ShutdownReport::default();
        for (id, engine) in &peers {
            if engine.state() == ConnectionState::Disconnected {
                continue;
            }
            warn!("peer failed to drain before shutdown: peer={id}");
            report.undrained.push(*id);
            engine.notify_disconnected(Some("server shutdown timed out".to_owned()));
            if let Some(link) = engine.detach_link() {
                tokio::spawn(async move {
                    let _ = link.kill().await;
                });
            }
        }

        self.inner.tracker.close();
        if tokio::time::timeout(limit, self.inner.tracker.wait()).await.is_err() {
            warn!("server tasks still running after shutdown");
        }
        info!("server shut down: undrained={}", report.undrained.len());
        report
    }
}

#[async_trait]
impl Listenable for Server {
    type Target = ListenTarget;
    type Listening = Listening;
    type Error = ServerError;

    async fn listen(&self, target: ListenTarget) -> Result<Listening, ServerError> {
        Server::listen(self, target).await
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("engine", &self.inner.engine.name())
            .field("clients", &self.len())
            .field("listening", &self.listening())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
