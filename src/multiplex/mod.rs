//! Transfer of composite resources across a handle-carrying channel.
//!
//! A [`Composite`] is split into one metadata piece and one piece per
//! underlying handle. The metadata names the transfer, the number of
//! pieces, the remote-callable operations the sender registered for the
//! resource and the subject its events are forwarded on. The receiver
//! reassembles the pieces in any order and delivers the original envelope
//! with a [`RemoteComposite`] attached.

mod process;
mod proxy;
mod reassembly;

use std::{collections::BTreeMap, fmt, time::Duration};

use log::{debug, warn};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
    task::AbortHandle,
};

pub use self::{
    process::{ExitStatus, STDERR, STDIN, STDOUT, Subprocess},
    proxy::RemoteProxy,
};
pub(crate) use self::reassembly::TransferTable;
use crate::{
    engine::{Engine, EndpointOptions, EventRoute, Handler, ResourceEvent, handler, to_data},
    envelope::{Attachment, Envelope, Handle},
    error::UnisocError,
    transport::{Link, TransportError},
};

/// Top-level field that marks a frame as a transfer piece.
pub const TRANSFER_FIELD: &str = "__unisoc_transfer";

/// Operation under a transfer's prefix that withdraws everything the
/// sender registered for it. Not listed among the proxy's methods.
pub(crate) const RELEASE_OP: &str = "__release";

const PREFIX_LEN: usize = 32;
const STALE_TRANSFER: Duration = Duration::from_secs(30);

/// A remote-callable operation exposed for a transferred resource.
pub struct Operation {
    name: String,
    options: EndpointOptions,
    handler: Handler,
}

impl Operation {
    pub fn new<F, Fut>(name: impl Into<String>, options: EndpointOptions, f: F) -> Self
    where
        F: Fn(crate::engine::Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::engine::HandlerResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            options,
            handler: handler(f),
        }
    }

    /// Read accessor for property `prop`, exposed as `prop/get`.
    pub fn getter<F, Fut>(prop: &str, f: F) -> Self
    where
        F: Fn(crate::engine::Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::engine::HandlerResult> + Send + 'static,
    {
        Self::new(format!("{prop}/get"), EndpointOptions::new(), f)
    }

    /// Write accessor for property `prop`, exposed as `prop/set`.
    pub fn setter<F, Fut>(prop: &str, f: F) -> Self
    where
        F: Fn(crate::engine::Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::engine::HandlerResult> + Send + 'static,
    {
        Self::new(format!("{prop}/set"), EndpointOptions::positional(1), f)
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("name", &self.name).finish_non_exhaustive()
    }
}

/// What a composite decomposes into when it is sent.
#[derive(Default)]
pub struct CompositeParts {
    /// One entry per slot; `None` marks a slot without a handle.
    pub handles: Vec<Option<Handle>>,
    pub operations: Vec<Operation>,
    pub events: Option<broadcast::Receiver<ResourceEvent>>,
}

/// A local resource made of several handles plus remote operations.
pub trait Composite: Send + 'static {
    /// Identifier shared by every piece of one transfer.
    fn transfer_id(&self) -> u32;

    /// Names of the handle slots, in slot order.
    fn slots(&self) -> &'static [&'static str];

    fn into_parts(self: Box<Self>) -> CompositeParts;
}

/// Receiving side of a composite transfer.
pub struct RemoteComposite {
    transfer: u32,
    handles: BTreeMap<usize, Handle>,
    proxy: Option<RemoteProxy>,
}

impl RemoteComposite {
    #[must_use]
    pub fn transfer_id(&self) -> u32 { self.transfer }

    /// Slots that still hold a handle.
    #[must_use]
    pub fn slots(&self) -> Vec<usize> { self.handles.keys().copied().collect() }

    pub fn take_handle(&mut self, slot: usize) -> Option<Handle> { self.handles.remove(&slot) }

    /// Take slot `slot` as a reader. A writer in that slot is left in place.
    pub fn take_reader(&mut self, slot: usize) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        match self.handles.remove(&slot)? {
            Handle::Reader(r) => Some(r),
            other => {
                self.handles.insert(slot, other);
                None
            }
        }
    }

    /// Take slot `slot` as a writer. A reader in that slot is left in place.
    pub fn take_writer(&mut self, slot: usize) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        match self.handles.remove(&slot)? {
            Handle::Writer(w) => Some(w),
            other => {
                self.handles.insert(slot, other);
                None
            }
        }
    }

    /// Proxy for the operations and events the sender exposed.
    #[must_use]
    pub fn proxy(&self) -> Option<&RemoteProxy> { self.proxy.as_ref() }
}

impl fmt::Debug for RemoteComposite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteComposite")
            .field("transfer", &self.transfer)
            .field("slots", &self.slots())
            .field("proxy", &self.proxy.as_ref().map(RemoteProxy::prefix))
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct PieceHeader {
    pub(crate) id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) pieces: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) slot: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) subject: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TransferPiece {
    #[serde(rename = "__unisoc_transfer")]
    pub(crate) header: PieceHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) payload: Option<Envelope>,
}

fn random_prefix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PREFIX_LEN)
        .map(char::from)
        .collect()
}

impl Engine {
    /// Register `operations` under `/{prefix}/{name}`.
    ///
    /// Returns the registered subjects. Operations whose subject is already
    /// taken are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fails when `prefix` yields an invalid subject.
    pub fn register_object_endpoints(
        &self,
        prefix: &str,
        operations: Vec<Operation>,
        secret: bool,
    ) -> Result<Vec<String>, UnisocError> {
        let mut registered = Vec::with_capacity(operations.len());
        for op in operations {
            let subject = format!("/{prefix}/{}", op.name);
            let options = if secret { op.options.secret() } else { op.options };
            match self.register_handler(&subject, options, op.handler) {
                Ok(()) => registered.push(subject),
                Err(UnisocError::InvalidSubject(s)) => return Err(UnisocError::InvalidSubject(s)),
                Err(e) => warn!("skipping object endpoint: subject={subject}, error={e}"),
            }
        }
        Ok(registered)
    }

    /// Send a one-way message carrying a composite resource.
    ///
    /// # Errors
    ///
    /// Fails when the link cannot carry handles or any piece fails.
    pub async fn send_composite<T: Serialize>(
        &self,
        subject: &str,
        data: T,
        composite: Box<dyn Composite>,
    ) -> Result<(), UnisocError> {
        let envelope = Envelope::message(subject, to_data(data)?)?
            .with_attachment(Attachment::Composite(composite));
        self.send_envelope(envelope).await
    }

    /// Send a request carrying a composite resource and await the response.
    ///
    /// # Errors
    ///
    /// As for [`send_composite`](Self::send_composite) plus request failures.
    pub async fn request_composite<T: Serialize>(
        &self,
        subject: &str,
        data: T,
        composite: Box<dyn Composite>,
    ) -> Result<Value, UnisocError> {
        let envelope = Envelope::message(subject, to_data(data)?)?
            .with_attachment(Attachment::Composite(composite));
        let timeout = self.config().request_timeout_duration();
        let response = self.request_envelope(envelope, timeout).await?;
        Ok(response.data.unwrap_or(Value::Null))
    }

    pub(crate) async fn transmit_composite(
        &self,
        link: &dyn Link,
        mut envelope: Envelope,
    ) -> Result<(), TransportError> {
        let Some(Attachment::Composite(composite)) = envelope.attachment.take() else {
            return link.transmit(envelope).await;
        };
        if !link.carries_handles() {
            return Err(TransportError::AttachmentUnsupported);
        }
        let id = composite.transfer_id();
        let slot_names = composite.slots();
        let parts = composite.into_parts();
        let prefix = random_prefix();

        let endpoints = self
            .register_object_endpoints(&prefix, parts.operations, true)
            .unwrap_or_else(|e| {
                warn!("failed to expose resource operations: transfer={id}, error={e}");
                Vec::new()
            });
        let forwarder = parts.events.map(|events| {
            self.extend_events(events, EventRoute::Subject(prefix.clone()), None)
                .abort_handle()
        });
        self.register_release(&prefix, endpoints.clone(), forwarder);

        let handles: Vec<(usize, Handle)> = parts
            .handles
            .into_iter()
            .enumerate()
            .filter_map(|(slot, h)| h.map(|h| (slot, h)))
            .collect();
        let total = handles.len() + 1;
        let mut failed = 0;

        let metadata = TransferPiece {
            header: PieceHeader {
                id,
                pieces: Some(total),
                endpoints,
                subject: Some(prefix),
                ..PieceHeader::default()
            },
            payload: Some(envelope),
        };
        if let Err(e) = send_piece(link, metadata, None).await {
            warn!("transfer metadata piece failed: transfer={id}, error={e}");
            failed += 1;
        }
        for (slot, handle) in handles {
            let piece = TransferPiece {
                header: PieceHeader {
                    id,
                    slot: Some(slot),
                    ..PieceHeader::default()
                },
                payload: None,
            };
            let name = slot_names.get(slot).copied().unwrap_or("?");
            if let Err(e) = send_piece(link, piece, Some(handle)).await {
                warn!("transfer piece failed: transfer={id}, slot={name}, error={e}");
                failed += 1;
            } else {
                debug!("transfer piece sent: transfer={id}, slot={name}");
            }
        }
        if failed > 0 {
            Err(TransportError::Partial { failed, total })
        } else {
            Ok(())
        }
    }

    /// Expose `/{prefix}/__release`, which unregisters `subjects` and
    /// itself and stops event forwarding once the receiver lets go.
    fn register_release(&self, prefix: &str, subjects: Vec<String>, forwarder: Option<AbortHandle>) {
        let release = format!("/{prefix}/{RELEASE_OP}");
        let own = release.clone();
        let registered = self.register_endpoint(
            &release,
            EndpointOptions::new().with_engine().secret(),
            move |call| {
                if let Some(engine) = call.engine() {
                    for subject in subjects.iter().chain([&own]) {
                        engine.unregister_endpoint(subject);
                    }
                    debug!("transfer released: engine={}, subject={own}", engine.name());
                }
                if let Some(forwarder) = &forwarder {
                    forwarder.abort();
                }
                async { Ok(Value::Null) }
            },
        );
        if let Err(e) = registered {
            warn!("failed to expose transfer release: subject={release}, error={e}");
        }
    }

    /// Accept one piece of an inbound transfer, delivering the envelope
    /// once every piece has arrived.
    pub(crate) fn receive_piece(&self, frame: Value, handle: Option<Handle>) {
        let piece: TransferPiece = match serde_json::from_value(frame) {
            Ok(piece) => piece,
            Err(e) => {
                warn!("dropping malformed transfer piece: engine={}, error={e}", self.name());
                return;
            }
        };
        let completed = {
            let mut table = self.transfers();
            let purged = table.purge_older_than(STALE_TRANSFER);
            if purged > 0 {
                warn!("discarded stale partial transfers: engine={}, count={purged}", self.name());
            }
            table.accept(piece, handle)
        };
        let Some(done) = completed else {
            return;
        };
        let proxy = done.subject.as_deref().map(|prefix| {
            let mut proxies = RemoteProxy::from_endpoints(self, &done.endpoints);
            let mut proxy = proxies
                .remove(prefix)
                .unwrap_or_else(|| RemoteProxy::empty(self, prefix));
            proxy.relay_events(prefix);
            proxy
        });
        let mut envelope = done.envelope;
        envelope.attachment = Some(Attachment::Remote(RemoteComposite {
            transfer: done.id,
            handles: done.handles,
            proxy,
        }));
        self.receive(envelope);
    }
}

/// Serialize `piece` up front so the returned future owns only the frame
/// and the handle.
fn send_piece(
    link: &dyn Link,
    piece: TransferPiece,
    handle: Option<Handle>,
) -> impl Future<Output = Result<(), TransportError>> + Send {
    let value = serde_json::to_value(&piece);
    async move { link.transmit_piece(value?, handle).await }
}

#[cfg(test)]
mod tests;
