//! Client-side view of operations a peer exposed for a resource.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use log::debug;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::RELEASE_OP;
use crate::{
    engine::{Engine, ListenerId, ResourceEvent, to_data},
    error::UnisocError,
};

const EVENT_BUFFER: usize = 64;

/// Remote operations grouped under one subject prefix.
///
/// Subjects of the form `/{prefix}/{method}` become methods and
/// `/{prefix}/{prop}/get` or `/{prefix}/{prop}/set` become properties.
#[derive(Clone)]
pub struct RemoteProxy {
    engine: Engine,
    prefix: String,
    methods: BTreeSet<String>,
    properties: BTreeSet<String>,
    events: broadcast::Sender<ResourceEvent>,
    lease: Option<Arc<Lease>>,
}

/// Ties a transferred resource's receiver-side state to the proxy. Dropped
/// with the last proxy clone.
struct Lease {
    engine: Engine,
    prefix: String,
    relay: ListenerId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.engine.off(self.relay);
        if !self.engine.is_connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime to release transfer: prefix={}", self.prefix);
            return;
        };
        let engine = self.engine.clone();
        let subject = format!("/{}/{RELEASE_OP}", self.prefix);
        runtime.spawn(async move {
            if let Err(e) = engine.send(&subject, ()).await {
                debug!("failed to release transfer: subject={subject}, error={e}");
            }
        });
    }
}

impl RemoteProxy {
    pub(crate) fn empty(engine: &Engine, prefix: &str) -> Self {
        Self {
            engine: engine.clone(),
            prefix: prefix.to_owned(),
            methods: BTreeSet::new(),
            properties: BTreeSet::new(),
            events: broadcast::channel(EVENT_BUFFER).0,
            lease: None,
        }
    }

    /// Build one proxy per prefix found in `subjects`.
    #[must_use]
    pub fn from_endpoints(engine: &Engine, subjects: &[String]) -> BTreeMap<String, RemoteProxy> {
        let mut proxies: BTreeMap<String, RemoteProxy> = BTreeMap::new();
        for subject in subjects {
            let parts: Vec<&str> = subject.trim_start_matches('/').split('/').collect();
            let (prefix, name, property) = match parts.as_slice() {
                [head @ .., prop, "get" | "set"] if !head.is_empty() => (head.join("/"), *prop, true),
                [head @ .., method] if !head.is_empty() => (head.join("/"), *method, false),
                _ => {
                    debug!("ignoring subject without prefix: subject={subject}");
                    continue;
                }
            };
            let proxy = proxies
                .entry(prefix.clone())
                .or_insert_with(|| RemoteProxy::empty(engine, &prefix));
            if property {
                proxy.properties.insert(name.to_owned());
            } else {
                proxy.methods.insert(name.to_owned());
            }
        }
        proxies
    }

    #[must_use]
    pub fn prefix(&self) -> &str { &self.prefix }

    #[must_use]
    pub fn methods(&self) -> Vec<&str> { self.methods.iter().map(String::as_str).collect() }

    #[must_use]
    pub fn properties(&self) -> Vec<&str> { self.properties.iter().map(String::as_str).collect() }

    /// Invoke a remote method with positional arguments.
    ///
    /// # Errors
    ///
    /// Fails for an unknown method or any request failure.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, UnisocError> {
        if !self.methods.contains(method) {
            return Err(UnisocError::UnknownEndpoint(format!("/{}/{method}", self.prefix)));
        }
        self.engine
            .request(&format!("/{}/{method}", self.prefix), Value::Array(args))
            .await
    }

    /// Read a remote property.
    ///
    /// # Errors
    ///
    /// Fails for an unknown property or any request failure.
    pub async fn get(&self, prop: &str) -> Result<Value, UnisocError> {
        self.require_property(prop)?;
        self.engine
            .request(&format!("/{}/{prop}/get", self.prefix), ())
            .await
    }

    /// Write a remote property.
    ///
    /// # Errors
    ///
    /// Fails for an unknown property or any request failure.
    pub async fn set<T: Serialize>(&self, prop: &str, value: T) -> Result<Value, UnisocError> {
        self.require_property(prop)?;
        let value = to_data(value)?.unwrap_or(Value::Null);
        self.engine
            .request(&format!("/{}/{prop}/set", self.prefix), vec![value])
            .await
    }

    /// Events the peer forwards for this resource.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> { self.events.subscribe() }

    /// Feed events arriving on `subject` as `[name, ...args]` into
    /// [`subscribe`](Self::subscribe) receivers until the last clone of
    /// this proxy is dropped, which also releases the sender's endpoints.
    pub(crate) fn relay_events(&mut self, subject: &str) {
        let events = self.events.clone();
        let relay = self.engine.on(subject, move |incoming| {
            let Some(Value::Array(mut items)) = incoming.data else {
                debug!("ignoring malformed resource event: subject={}", incoming.subject);
                return;
            };
            if items.is_empty() {
                return;
            }
            let Value::String(name) = items.remove(0) else {
                debug!("resource event without a name: subject={}", incoming.subject);
                return;
            };
            let _ = events.send(ResourceEvent::new(name, items));
        });
        self.lease = Some(Arc::new(Lease {
            engine: self.engine.clone(),
            prefix: self.prefix.clone(),
            relay,
        }));
    }

    fn require_property(&self, prop: &str) -> Result<(), UnisocError> {
        if self.properties.contains(prop) {
            Ok(())
        } else {
            Err(UnisocError::UnknownEndpoint(format!("/{}/{prop}", self.prefix)))
        }
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("prefix", &self.prefix)
            .field("methods", &self.methods)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
