//! The correlation engine.
//!
//! An [`Engine`] owns one logical connection: its endpoint table, the
//! tables of pending outbound and inbound requests, the hooks applied to
//! outgoing envelopes and the lifecycle state. Transports feed received
//! envelopes into [`Engine::receive`] and carry outgoing ones through the
//! attached [`Link`].

mod endpoint;
mod events;
mod hooks;
pub mod id;
mod lifecycle;
mod listeners;
mod pending;
mod responder;

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};

pub use self::{
    endpoint::{
        Call,
        Endpoint,
        EndpointOptions,
        EndpointSet,
        Handler,
        HandlerResult,
        RESERVED_PARAMS,
        SharedEndpoints,
        handler,
    },
    events::{EventFilter, EventRoute, ResourceEvent},
    hooks::{HookSet, ObserveHook, TransmitHook},
    id::{IdAllocator, RandomIds, SequentialIds},
    lifecycle::ConnectionState,
    listeners::{Incoming, Listener, ListenerId},
    pending::{Flow, Response, ResponseHandler},
    responder::Responder,
};
use self::{
    endpoint::EndpointTable,
    lifecycle::Lifecycle,
    listeners::Listeners,
    pending::{PendingOutbound, ResponseSink},
};
use crate::{
    config::Config,
    envelope::{Attachment, Envelope, validate_subject},
    error::{ErrorCode, Fault, UnisocError},
    metrics::{self, Direction},
    multiplex::TransferTable,
    panic::format_panic,
    payload::Args,
    transport::Link,
};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Convert a serializable payload into envelope data; `null` means absent.
///
/// # Errors
///
/// Returns the serializer error.
pub fn to_data<T: Serialize>(data: T) -> Result<Option<Value>, UnisocError> {
    let value = serde_json::to_value(data)?;
    Ok((!value.is_null()).then_some(value))
}

struct History {
    limit: usize,
    sent: VecDeque<u64>,
    received: VecDeque<u64>,
}

impl History {
    fn push(log: &mut VecDeque<u64>, limit: usize, id: u64) {
        if limit == 0 {
            return;
        }
        if log.len() == limit {
            log.pop_front();
        }
        log.push_back(id);
    }
}

pub(crate) struct Inner {
    id: u64,
    name: String,
    config: Config,
    endpoints: EndpointTable,
    listeners: Listeners,
    hooks: Arc<HookSet>,
    ids: Arc<dyn IdAllocator>,
    sent: DashMap<u64, PendingOutbound>,
    received: DashMap<u64, Instant>,
    inbound: watch::Sender<usize>,
    link: RwLock<Option<Arc<dyn Link>>>,
    lifecycle: Lifecycle,
    history: Mutex<History>,
    transfers: Mutex<TransferTable>,
}

/// Handle to one logical connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    id: Option<u64>,
    name: Option<String>,
    config: Option<Config>,
    ids: Option<Arc<dyn IdAllocator>>,
    parent_hooks: Option<Arc<HookSet>>,
    shared: Vec<SharedEndpoints>,
}

impl EngineBuilder {
    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Allocator for outbound request ids.
    #[must_use]
    pub fn ids(mut self, ids: Arc<dyn IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Inherit hooks and error policy from `parent` unless set locally.
    #[must_use]
    pub fn parent_hooks(mut self, parent: Arc<HookSet>) -> Self {
        self.parent_hooks = Some(parent);
        self
    }

    #[must_use]
    pub fn share(mut self, source: SharedEndpoints) -> Self {
        self.shared.push(source);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let config = self.config.unwrap_or_default();
        let hooks = match self.parent_hooks {
            Some(parent) => HookSet::with_parent(parent),
            None => {
                let hooks = HookSet::default();
                hooks.set_error_policy(Some(config.transmit_errors.clone()));
                hooks
            }
        };
        let id = self
            .id
            .unwrap_or_else(|| RandomIds::connections().allocate(&|_| false));
        let history = History {
            limit: config.history_limit,
            sent: VecDeque::new(),
            received: VecDeque::new(),
        };
        let endpoints = EndpointTable::default();
        for source in self.shared {
            endpoints.share(source);
        }
        let engine = Engine {
            inner: Arc::new(Inner {
                id,
                name: self.name.unwrap_or_else(|| format!("unisoc_{id}")),
                config,
                endpoints,
                listeners: Listeners::default(),
                hooks: Arc::new(hooks),
                ids: self.ids.unwrap_or_else(|| Arc::new(RandomIds::requests())),
                sent: DashMap::new(),
                received: DashMap::new(),
                inbound: watch::Sender::new(0),
                link: RwLock::new(None),
                lifecycle: Lifecycle::new(),
                history: Mutex::new(history),
                transfers: Mutex::new(TransferTable::default()),
            }),
        };
        engine.register_help();
        engine
    }
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder { EngineBuilder::default() }

    /// Engine with the given configuration and default identity.
    #[must_use]
    pub fn new(config: Config) -> Self { Self::builder().config(config).build() }

    #[must_use]
    pub fn id(&self) -> u64 { self.inner.id }

    #[must_use]
    pub fn name(&self) -> &str { &self.inner.name }

    #[must_use]
    pub fn config(&self) -> &Config { &self.inner.config }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookSet> { &self.inner.hooks }

    pub(crate) fn transfers(&self) -> MutexGuard<'_, TransferTable> { lock(&self.inner.transfers) }

    pub(crate) fn downgrade(&self) -> Weak<Inner> { Arc::downgrade(&self.inner) }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> { weak.upgrade().map(|inner| Self { inner }) }

    #[must_use]
    pub fn ptr_eq(&self, other: &Engine) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    fn register_help(&self) {
        let registered = self.register_endpoint(
            "help",
            EndpointOptions::new()
                .with_engine()
                .description("List the endpoints visible on this connection"),
            |call: Call| async move {
                match call.engine() {
                    Some(engine) => Ok(Value::String(engine.help_text())),
                    None => Err(Fault::from("engine unavailable")),
                }
            },
        );
        if let Err(e) = registered {
            error!("failed to register help endpoint: engine={}, error={e}", self.name());
        }
    }

    // ----- lifecycle -----

    #[must_use]
    pub fn state(&self) -> ConnectionState { self.inner.lifecycle.state() }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> { self.inner.lifecycle.subscribe() }

    /// Connected state as seen by both the engine and its link.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && read(&self.inner.link)
                .as_ref()
                .is_some_and(|link| link.is_connected())
    }

    /// The error that closed the connection, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> { self.inner.lifecycle.last_error() }

    /// Install the transport used for sending. Replaces any previous link.
    pub fn attach_link(&self, link: Arc<dyn Link>) { *write(&self.inner.link) = Some(link); }

    pub fn detach_link(&self) -> Option<Arc<dyn Link>> { write(&self.inner.link).take() }

    /// Record that the transport is ready. Returns `true` on transition.
    pub fn notify_connected(&self) -> bool {
        let changed = self.inner.lifecycle.mark_connected();
        if changed {
            debug!("connection established: engine={}", self.name());
        }
        changed
    }

    /// Record that the transport closed.
    ///
    /// Only the first call per connection has effect: outstanding requests
    /// fail with [`UnisocError::NotConnected`] and inbound requests that can
    /// no longer be answered are forgotten. Returns `true` for that call.
    pub fn notify_disconnected(&self, error: Option<String>) -> bool {
        if !self.inner.lifecycle.mark_disconnected(error.clone()) {
            return false;
        }
        match &error {
            Some(e) => info!("connection closed: engine={}, error={e}", self.name()),
            None => debug!("connection closed: engine={}", self.name()),
        }
        let ids: Vec<u64> = self.inner.sent.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.inner.sent.remove(&id) {
                pending.fail(UnisocError::NotConnected);
            }
        }
        self.inner.received.clear();
        self.inner.inbound.send_replace(0);
        true
    }

    /// Resolve once the connection reports disconnected.
    pub async fn wait_disconnected(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    /// Close the connection.
    ///
    /// Calling this on a connection that is already closed is a no-op that
    /// still guarantees the disconnect notification fired once.
    pub async fn kill(&self) {
        if !self.is_connected() {
            if self.inner.lifecycle.ever_connected() {
                self.notify_disconnected(None);
            } else {
                info!("kill requested before connecting: engine={}", self.name());
            }
            return;
        }
        let link = read(&self.inner.link).clone();
        if let Some(link) = link
            && let Err(e) = link.kill().await
        {
            error!("failed to close connection: engine={}, error={e}", self.name());
        }
        self.notify_disconnected(None);
    }

    // ----- endpoints -----

    /// Register a local endpoint.
    ///
    /// # Errors
    ///
    /// Fails on an invalid subject or when a local endpoint with the same
    /// subject exists. Shared endpoints may be shadowed.
    pub fn register_endpoint<F, Fut>(
        &self,
        subject: &str,
        options: EndpointOptions,
        f: F,
    ) -> Result<(), UnisocError>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(subject, options, handler(f))
    }

    /// Register a local endpoint from an already boxed handler.
    ///
    /// # Errors
    ///
    /// As for [`register_endpoint`](Self::register_endpoint).
    pub fn register_handler(
        &self,
        subject: &str,
        options: EndpointOptions,
        handler: Handler,
    ) -> Result<(), UnisocError> {
        validate_subject(subject)?;
        let result = self
            .inner
            .endpoints
            .insert(Endpoint::new(subject.to_owned(), options, handler));
        if let Err(e) = &result {
            warn!("endpoint registration rejected: engine={}, error={e}", self.name());
        }
        result
    }

    pub fn unregister_endpoint(&self, subject: &str) -> bool { self.inner.endpoints.remove(subject) }

    /// Resolve a subject through the local table, then shared sources.
    #[must_use]
    pub fn endpoint(&self, subject: &str) -> Option<Arc<Endpoint>> { self.inner.endpoints.find(subject, 0) }

    pub fn share_endpoints(&self, source: SharedEndpoints) { self.inner.endpoints.share(source); }

    /// Non-secret endpoints visible on this connection, sorted by subject.
    #[must_use]
    pub fn visible_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner.endpoints.visible(0).into_values().collect()
    }

    /// One line per visible endpoint: `subject(args) description`.
    #[must_use]
    pub fn help_text(&self) -> String {
        self.visible_endpoints()
            .iter()
            .map(|ep| match ep.description() {
                Some(desc) => format!("{}({}) {desc}", ep.subject(), ep.arg_spec()),
                None => format!("{}({})", ep.subject(), ep.arg_spec()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Ask the peer for its endpoint listing.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn remote_endpoints(&self) -> Result<String, UnisocError> {
        let value = self.request("help", ()).await?;
        Ok(value.as_str().map_or_else(|| value.to_string(), str::to_owned))
    }

    /// Invoke an endpoint in-process through the normal binding path.
    ///
    /// # Errors
    ///
    /// Returns the handler's fault, or an unknown-endpoint fault.
    pub async fn call_endpoint<T: Serialize>(&self, subject: &str, data: T) -> HandlerResult {
        let Some(endpoint) = self.endpoint(subject) else {
            return Err(UnisocError::UnknownEndpoint(subject.to_owned()).into());
        };
        let mut envelope = Envelope::message(subject, to_data(data)?)?;
        envelope.mark();
        let (tx, rx) = oneshot::channel();
        let responder = Responder::local(self.clone(), subject.to_owned(), tx);
        self.invoke(endpoint, envelope, Some(responder));
        rx.await
            .unwrap_or_else(|_| Err(Fault::from("endpoint finished without responding")))
    }

    // ----- listeners -----

    pub fn on<F>(&self, subject: &str, f: F) -> ListenerId
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Some(subject.to_owned()), Arc::new(f))
    }

    pub fn on_any<F>(&self, f: F) -> ListenerId
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.inner.listeners.add(None, Arc::new(f))
    }

    pub fn off(&self, id: ListenerId) -> bool { self.inner.listeners.remove(id) }

    /// Number of registered listeners, wildcard ones included.
    #[must_use]
    pub fn listener_count(&self) -> usize { self.inner.listeners.len() }

    // ----- sending -----

    /// Send a one-way message.
    ///
    /// # Errors
    ///
    /// Fails on an invalid subject, a closed connection or a transport error.
    pub async fn send<T: Serialize>(&self, subject: &str, data: T) -> Result<(), UnisocError> {
        self.send_envelope(Envelope::message(subject, to_data(data)?)?)
            .await
    }

    /// Send a prepared envelope as-is, including any attachment.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), UnisocError> {
        self.transmit(envelope, None).await
    }

    /// Send a request and wait for its response data.
    ///
    /// Uses the configured default timeout.
    ///
    /// # Errors
    ///
    /// Fails with the peer's error, a timeout, or any send failure.
    pub async fn request<T: Serialize>(&self, subject: &str, data: T) -> Result<Value, UnisocError> {
        let timeout = self.config().request_timeout_duration();
        self.request_timeout(subject, data, timeout).await
    }

    /// As [`request`](Self::request) with an explicit timeout; `None`
    /// waits indefinitely.
    ///
    /// # Errors
    ///
    /// As for [`request`](Self::request).
    pub async fn request_timeout<T: Serialize>(
        &self,
        subject: &str,
        data: T,
        timeout: Option<Duration>,
    ) -> Result<Value, UnisocError> {
        let envelope = Envelope::message(subject, to_data(data)?)?;
        let response = self.request_envelope(envelope, timeout).await?;
        Ok(response.data.unwrap_or(Value::Null))
    }

    /// Send a prepared request envelope and wait for the full response
    /// envelope, attachment included. The envelope's id is replaced.
    ///
    /// # Errors
    ///
    /// As for [`request`](Self::request).
    pub async fn request_envelope(
        &self,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope, UnisocError> {
        validate_subject(&envelope.subject)?;
        self.ready_link()?;
        let (tx, rx) = oneshot::channel();
        let id = self.register_pending(&envelope.subject, ResponseSink::Once(tx));
        envelope.id = id;
        let guard = PendingGuard { engine: self, id };
        self.transmit(envelope, None).await?;
        self.mark_sent(id);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("request timed out: engine={}, id={id}, timeout={limit:?}", self.name());
                    return Err(UnisocError::Timeout { id, timeout: limit });
                }
            },
            None => rx.await,
        };
        drop(guard);
        outcome.unwrap_or(Err(UnisocError::Cancelled(id)))
    }

    /// Send a request whose responses are delivered to `handler`.
    ///
    /// Resolves with the request id once the request has been transmitted.
    /// The handler runs for every matching response until it returns
    /// [`Flow::Cancel`], [`cancel_request`](Self::cancel_request) is called
    /// or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Fails if the request could not be sent.
    pub async fn request_with_handler<T, F>(
        &self,
        subject: &str,
        data: T,
        timeout: Option<Duration>,
        handler: F,
    ) -> Result<u64, UnisocError>
    where
        T: Serialize,
        F: Fn(Response) -> Flow + Send + Sync + 'static,
    {
        let mut envelope = Envelope::message(subject, to_data(data)?)?;
        self.ready_link()?;
        let id = self.register_pending(subject, ResponseSink::Repeat(Arc::new(handler)));
        envelope.id = id;
        if let Err(e) = self.transmit(envelope, None).await {
            self.inner.sent.remove(&id);
            return Err(e);
        }
        self.mark_sent(id);
        if let Some(limit) = timeout {
            let weak = self.downgrade();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(engine) = Engine::upgrade(&weak)
                    && engine.inner.sent.remove(&id).is_some()
                {
                    debug!("request timed out, dropping handler: engine={}, id={id}", engine.name());
                }
            });
        }
        Ok(id)
    }

    /// Withdraw a pending request. Later responses are treated as unknown.
    pub fn cancel_request(&self, id: u64) -> bool {
        match self.inner.sent.remove(&id) {
            Some((_, pending)) => {
                debug!(
                    "request cancelled: engine={}, id={id}, subject={}, age={:?}",
                    self.name(),
                    pending.subject,
                    pending.created.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Number of outbound requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize { self.inner.sent.len() }

    /// Number of inbound requests not yet answered.
    #[must_use]
    pub fn pending_inbound(&self) -> usize { self.inner.received.len() }

    /// Resolve once every inbound request has been answered.
    pub async fn wait_idle(&self) {
        let mut count = self.inner.inbound.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }

    #[must_use]
    pub fn sent_history(&self) -> Vec<u64> { lock(&self.inner.history).sent.iter().copied().collect() }

    #[must_use]
    pub fn received_history(&self) -> Vec<u64> {
        lock(&self.inner.history).received.iter().copied().collect()
    }

    fn register_pending(&self, subject: &str, sink: ResponseSink) -> u64 {
        let pending = PendingOutbound::new(subject, sink);
        loop {
            let id = self
                .inner
                .ids
                .allocate(&|id| self.inner.sent.contains_key(&id));
            if let Entry::Vacant(slot) = self.inner.sent.entry(id) {
                slot.insert(pending);
                return id;
            }
            debug!("request id collision, allocating again: engine={}, id={id}", self.name());
        }
    }

    fn mark_sent(&self, id: u64) {
        if let Some(mut pending) = self.inner.sent.get_mut(&id) {
            pending.sent = true;
        }
        let mut history = lock(&self.inner.history);
        let limit = history.limit;
        History::push(&mut history.sent, limit, id);
    }

    fn ready_link(&self) -> Result<Arc<dyn Link>, UnisocError> {
        let link = read(&self.inner.link).clone();
        match link {
            Some(link) if link.is_connected() && self.state() == ConnectionState::Connected => Ok(link),
            _ => {
                if self.inner.lifecycle.ever_connected() {
                    self.notify_disconnected(Some(UnisocError::NotConnected.to_string()));
                }
                Err(UnisocError::NotConnected)
            }
        }
    }

    /// Normalize, run hooks and hand an envelope to the link.
    pub(crate) async fn transmit(
        &self,
        mut envelope: Envelope,
        fault: Option<Fault>,
    ) -> Result<(), UnisocError> {
        validate_subject(&envelope.subject)?;
        let link = self.ready_link()?;
        let fault = fault.or_else(|| {
            envelope
                .error
                .take()
                .filter(|e| !e.is_null())
                .map(Fault::Value)
        });
        if let Some(fault) = fault {
            if envelope.data.take().is_some() {
                warn!(
                    "envelope carries both data and error, discarding data: subject={}, id={}",
                    envelope.subject, envelope.id
                );
            }
            envelope.error = Some(self.inner.hooks.error_policy().normalize(&fault, envelope.id));
        }
        if let Some(hook) = self.inner.hooks.before_transmit() {
            hook(&mut envelope);
        }
        envelope.mark();
        let subject = envelope.subject.clone();
        let id = envelope.id;
        let observed = self
            .inner
            .hooks
            .after_transmit()
            .map(|hook| (hook, envelope.snapshot()));
        let result = if matches!(envelope.attachment, Some(Attachment::Composite(_))) {
            self.transmit_composite(link.as_ref(), envelope).await
        } else {
            link.transmit(envelope).await
        };
        match result {
            Ok(()) => {
                debug!("envelope transmitted: engine={}, subject={subject}, id={id}", self.name());
                metrics::inc_envelopes(Direction::Outbound);
                if let Some((hook, snapshot)) = observed {
                    hook(&snapshot);
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    "failed to transmit envelope: engine={}, subject={subject}, id={id}, error={e}",
                    self.name()
                );
                metrics::inc_errors();
                Err(e.into())
            }
        }
    }

    pub(crate) async fn send_response(
        &self,
        id: u64,
        target: String,
        peer: Option<SocketAddr>,
        result: HandlerResult,
    ) -> bool {
        let mut envelope = Envelope::response(id, target);
        envelope.peer = peer;
        let fault = match result {
            Ok(data) => {
                envelope.data = (!data.is_null()).then_some(data);
                None
            }
            Err(fault) => Some(fault),
        };
        let sent = match self.transmit(envelope, fault).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to send response: engine={}, id={id}, error={e}", self.name());
                false
            }
        };
        self.finish_inbound(id);
        sent
    }

    pub(crate) fn finish_inbound(&self, id: u64) {
        if self.inner.received.remove(&id).is_some() {
            self.inner.inbound.send_replace(self.inner.received.len());
        }
    }

    // ----- receiving -----

    /// Process one envelope produced by a transport.
    ///
    /// Responses are correlated with pending requests; requests and
    /// messages are dispatched to endpoints or listeners on spawned tasks.
    /// Must be called from within a Tokio runtime.
    pub fn receive(&self, envelope: Envelope) {
        if let Err(e) = validate_subject(&envelope.subject) {
            warn!("dropping envelope: engine={}, error={e}", self.name());
            return;
        }
        metrics::inc_envelopes(Direction::Inbound);
        if envelope.is_response() {
            if let Err(e) = self.receive_response(envelope) {
                warn!("{e}: engine={}", self.name());
            }
            return;
        }
        if envelope.id == 0 {
            self.dispatch(envelope, None);
            return;
        }
        let id = envelope.id;
        {
            let mut history = lock(&self.inner.history);
            let limit = history.limit;
            History::push(&mut history.received, limit, id);
        }
        let duplicate = match self.inner.received.entry(id) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                false
            }
        };
        if duplicate {
            warn!(
                "duplicate request id from peer: engine={}, subject={}, id={id}",
                self.name(),
                envelope.subject
            );
            self.reject_duplicate(envelope);
            return;
        }
        self.inner.inbound.send_replace(self.inner.received.len());
        let responder = Responder::remote(self.clone(), id, envelope.subject.clone(), envelope.peer);
        self.dispatch(envelope, Some(responder));
    }

    fn reject_duplicate(&self, envelope: Envelope) {
        let id = envelope.id;
        let mut response = Envelope::response(id, envelope.subject);
        response.peer = envelope.peer;
        let fault = Fault::Value(json!({
            "code": "EALREADY",
            "msg": format!(
                "You already have an outstanding request with ID {id}, please increment \
                 id or wait for response before requesting again"
            ),
        }));
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.transmit(response, Some(fault)).await {
                debug!("failed to reject duplicate request: id={id}, error={e}");
            }
        });
    }

    fn receive_response(&self, mut envelope: Envelope) -> Result<(), UnisocError> {
        let id = envelope.id;
        let repeat = match self.inner.sent.get(&id) {
            None => return Err(UnisocError::UnknownRequest(id)),
            Some(pending) => match &pending.sink {
                ResponseSink::Repeat(handler) => Some(Arc::clone(handler)),
                ResponseSink::Once(_) => None,
            },
        };
        if envelope.error.is_none()
            && let Some(hook) = self.inner.hooks.on_response()
        {
            hook(&envelope);
        }
        if let Some(handler) = repeat {
            if handler(Response::new(envelope)) == Flow::Cancel {
                self.cancel_request(id);
            }
            return Ok(());
        }
        if let Some((_, pending)) = self.inner.sent.remove(&id)
            && let ResponseSink::Once(tx) = pending.sink
        {
            let result = match envelope.error.take() {
                Some(error) => Err(UnisocError::Remote(crate::error::RemoteError::new(error))),
                None => Ok(envelope),
            };
            let _ = tx.send(result);
        }
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope, responder: Option<Responder>) {
        if let Some(endpoint) = self.endpoint(&envelope.subject) {
            self.invoke(endpoint, envelope, responder);
            return;
        }
        let subject = envelope.subject.clone();
        let id = envelope.id;
        let incoming = Incoming::new(envelope, responder.clone());
        if self.inner.listeners.emit(&incoming) > 0 {
            return;
        }
        warn!(
            "no endpoint or listener for subject: engine={}, subject={subject}, id={id}",
            self.name()
        );
        if let Some(responder) = responder {
            tokio::spawn(async move {
                responder.fail("404 Not Found").await;
            });
        }
    }

    fn invoke(&self, endpoint: Arc<Endpoint>, mut envelope: Envelope, responder: Option<Responder>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let subject = envelope.subject.clone();
            let id = envelope.id;
            let attachment = envelope.attachment.take();
            let snapshot = endpoint.injects_envelope().then(|| envelope.snapshot());
            let args = match endpoint.bind(Args::from(envelope.data.take())) {
                Ok(args) => args,
                Err(err) => {
                    warn!("rejecting call: engine={}, subject={subject}, id={id}, error={err}", engine.name());
                    if let Some(responder) = responder {
                        let fault = if err.code() == ErrorCode::Invalid {
                            Fault::Value(Value::String(err.to_string()))
                        } else {
                            Fault::from(err)
                        };
                        responder.respond(Err(fault)).await;
                    }
                    return;
                }
            };
            let call = Call {
                subject: subject.clone(),
                args,
                responder: if endpoint.injects_responder() { responder.clone() } else { None },
                envelope: snapshot,
                engine: endpoint.injects_engine().then(|| engine.clone()),
                attachment,
            };
            let result = match AssertUnwindSafe(endpoint.call(call)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let panic_msg = format_panic(panic);
                    // Emit via both `log` and `tracing` for tests that capture either.
                    error!("endpoint panicked: subject={subject}, id={id}, panic={panic_msg}");
                    tracing::error!(panic = %panic_msg, %subject, id, "endpoint panicked");
                    metrics::inc_errors();
                    Err(Fault::from("Internal Error"))
                }
            };
            match responder {
                Some(responder) if !endpoint.injects_responder() => {
                    responder.respond(result).await;
                }
                Some(responder) => {
                    if let Err(fault) = result
                        && responder.is_pending()
                    {
                        responder.respond(Err(fault)).await;
                    }
                }
                None => match result {
                    Ok(Value::Null) => {}
                    Ok(_) => info!(
                        "endpoint returned data but none was expected: subject={subject}"
                    ),
                    Err(fault) => error!(
                        "endpoint failed handling message: subject={subject}, error={fault}"
                    ),
                },
            }
        });
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct PendingGuard<'a> {
    engine: &'a Engine,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) { self.engine.inner.sent.remove(&self.id); }
}
