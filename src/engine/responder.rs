//! Single-use response handles for inbound requests.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use log::warn;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{Engine, lock};
use crate::error::Fault;

enum Target {
    Remote { peer: Option<SocketAddr> },
    Local(oneshot::Sender<Result<Value, Fault>>),
}

struct Inner {
    engine: Engine,
    id: u64,
    subject: String,
    target: Mutex<Option<Target>>,
}

/// Sends the response to one inbound request.
///
/// Cloning is cheap and all clones share one slot: the first call to
/// [`respond`](Self::respond) wins and later calls only log a warning.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<Inner>,
}

impl Responder {
    pub(crate) fn remote(engine: Engine, id: u64, subject: String, peer: Option<SocketAddr>) -> Self {
        Self::with_target(engine, id, subject, Target::Remote { peer })
    }

    pub(crate) fn local(
        engine: Engine,
        subject: String,
        tx: oneshot::Sender<Result<Value, Fault>>,
    ) -> Self {
        Self::with_target(engine, 0, subject, Target::Local(tx))
    }

    fn with_target(engine: Engine, id: u64, subject: String, target: Target) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                id,
                subject,
                target: Mutex::new(Some(target)),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 { self.inner.id }

    #[must_use]
    pub fn subject(&self) -> &str { &self.inner.subject }

    /// Whether no response has been sent yet.
    #[must_use]
    pub fn is_pending(&self) -> bool { lock(&self.inner.target).is_some() }

    /// Send the response. Returns `true` if it was handed to the transport.
    pub async fn respond(&self, result: Result<Value, Fault>) -> bool {
        let Some(target) = lock(&self.inner.target).take() else {
            warn!(
                "response already sent, ignoring repeated call: subject={}, id={}",
                self.inner.subject, self.inner.id
            );
            return false;
        };
        match target {
            Target::Local(tx) => tx.send(result).is_ok(),
            Target::Remote { peer } => {
                self.inner
                    .engine
                    .send_response(self.inner.id, self.inner.subject.clone(), peer, result)
                    .await
            }
        }
    }

    pub async fn ok(&self, data: Value) -> bool { self.respond(Ok(data)).await }

    pub async fn fail(&self, fault: impl Into<Fault>) -> bool { self.respond(Err(fault.into())).await }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let unanswered = lock(&self.target).take();
        if let Some(Target::Remote { .. }) = unanswered {
            warn!(
                "request dropped without a response: subject={}, id={}",
                self.subject, self.id
            );
            self.engine.finish_inbound(self.id);
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.inner.id)
            .field("subject", &self.inner.subject)
            .field("pending", &self.is_pending())
            .finish()
    }
}
