//! Endpoint registration, argument binding and the endpoint tables.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use futures::{FutureExt, future::BoxFuture};
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{Engine, Responder, read, write};
use crate::{
    envelope::{Attachment, Envelope, validate_subject},
    error::{Fault, UnisocError},
    payload::Args,
};

pub type HandlerResult = Result<Value, Fault>;
pub type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

/// Parameter names that request injected values instead of arguments.
pub const RESERVED_PARAMS: [&str; 3] = ["callback", "payload", "unisoc"];

const MAX_SHARE_DEPTH: usize = 16;

#[derive(Clone, Debug)]
struct Param {
    name: String,
    default: Option<Value>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Injection {
    responder: bool,
    envelope: bool,
    engine: bool,
}

/// Binding descriptor for an endpoint.
///
/// Parameters are declared in order; optional ones carry a default and must
/// follow required ones. An endpoint created with
/// [`positional`](Self::positional) has no parameter names and rejects
/// named arguments.
#[derive(Clone, Debug)]
pub struct EndpointOptions {
    params: Option<Vec<Param>>,
    positional: usize,
    inject: Injection,
    description: Option<String>,
    secret: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self { Self::new() }
}

impl EndpointOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: Some(Vec::new()),
            positional: 0,
            inject: Injection::default(),
            description: None,
            secret: false,
        }
    }

    /// Endpoint whose parameter names are unknown; `required` positional
    /// arguments must be supplied.
    #[must_use]
    pub fn positional(required: usize) -> Self {
        Self {
            params: None,
            positional: required,
            ..Self::new()
        }
    }

    /// Declare a required parameter. The reserved names `callback`,
    /// `payload` and `unisoc` enable the matching injection instead.
    #[must_use]
    pub fn param(self, name: &str) -> Self { self.push_param(name, None) }

    #[must_use]
    pub fn optional(self, name: &str, default: Value) -> Self { self.push_param(name, Some(default)) }

    #[must_use]
    pub fn params<'a>(self, names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(self, Self::param)
    }

    fn push_param(mut self, name: &str, default: Option<Value>) -> Self {
        match name {
            "callback" => self.inject.responder = true,
            "payload" => self.inject.envelope = true,
            "unisoc" => self.inject.engine = true,
            _ => {
                if let Some(params) = self.params.as_mut() {
                    params.push(Param {
                        name: name.to_owned(),
                        default,
                    });
                } else {
                    self.positional += usize::from(default.is_none());
                }
            }
        }
        self
    }

    /// The handler receives the [`Responder`] and answers on its own.
    #[must_use]
    pub fn with_responder(mut self) -> Self {
        self.inject.responder = true;
        self
    }

    /// The handler receives a copy of the request envelope.
    #[must_use]
    pub fn with_envelope(mut self) -> Self {
        self.inject.envelope = true;
        self
    }

    /// The handler receives the engine that received the call.
    #[must_use]
    pub fn with_engine(mut self) -> Self {
        self.inject.engine = true;
        self
    }

    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Hide the endpoint from introspection listings.
    #[must_use]
    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// A registered endpoint.
pub struct Endpoint {
    subject: String,
    options: EndpointOptions,
    handler: Handler,
}

impl Endpoint {
    pub(crate) fn new(subject: String, options: EndpointOptions, handler: Handler) -> Self {
        Self {
            subject,
            options,
            handler,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str { &self.subject }

    #[must_use]
    pub fn is_secret(&self) -> bool { self.options.secret }

    #[must_use]
    pub fn description(&self) -> Option<&str> { self.options.description.as_deref() }

    /// Number of arguments that must be supplied.
    #[must_use]
    pub fn required_args(&self) -> usize {
        match &self.options.params {
            Some(params) => params.iter().filter(|p| p.default.is_none()).count(),
            None => self.options.positional,
        }
    }

    /// Human-readable argument listing, e.g. `a, b=1`, or the required
    /// count when names are unknown.
    #[must_use]
    pub fn arg_spec(&self) -> String {
        match &self.options.params {
            Some(params) => params
                .iter()
                .map(|p| match &p.default {
                    Some(default) => format!("{}={default}", p.name),
                    None => p.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            None => self.options.positional.to_string(),
        }
    }

    pub(crate) fn injects_responder(&self) -> bool { self.options.inject.responder }

    pub(crate) fn injects_envelope(&self) -> bool { self.options.inject.envelope }

    pub(crate) fn injects_engine(&self) -> bool { self.options.inject.engine }

    pub(crate) fn call(&self, call: Call) -> BoxFuture<'static, HandlerResult> { (self.handler)(call) }

    /// Map a payload onto the declared parameters.
    pub(crate) fn bind(&self, args: Args) -> Result<Vec<Value>, UnisocError> {
        let required = self.required_args();
        let mut values = match (args, &self.options.params) {
            (Args::None, _) => Vec::new(),
            (Args::Positional(values), _) => values,
            (Args::Single(value), _) => vec![value],
            (Args::Named(_), None) => {
                return Err(UnisocError::NamedArgsUnsupported(self.subject.clone()));
            }
            (Args::Named(mut map), Some(params)) => {
                let mut values = Vec::with_capacity(params.len());
                for param in params {
                    match map.remove(&param.name).or_else(|| param.default.clone()) {
                        Some(value) => values.push(value),
                        None => {
                            return Err(UnisocError::InvalidInput(format!(
                                "Command requires argument '{}'.",
                                param.name
                            )));
                        }
                    }
                }
                return Ok(values);
            }
        };
        if values.len() < required {
            return Err(UnisocError::InvalidInput(format!(
                "Command requires {required} args minimum, only got {}.",
                values.len()
            )));
        }
        if let Some(params) = &self.options.params {
            for param in params.iter().skip(values.len()) {
                values.push(param.default.clone().unwrap_or(Value::Null));
            }
        }
        Ok(values)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("subject", &self.subject)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Arguments and injected values for one endpoint invocation.
pub struct Call {
    pub(crate) subject: String,
    pub(crate) args: Vec<Value>,
    pub(crate) responder: Option<Responder>,
    pub(crate) envelope: Option<Envelope>,
    pub(crate) engine: Option<Engine>,
    pub(crate) attachment: Option<Attachment>,
}

impl Call {
    #[must_use]
    pub fn subject(&self) -> &str { &self.subject }

    #[must_use]
    pub fn args(&self) -> &[Value] { &self.args }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> { self.args.get(index) }

    /// Deserialize argument `index` into `T`.
    ///
    /// # Errors
    ///
    /// Fails with an invalid-input fault if the argument is missing or has
    /// the wrong shape.
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> Result<T, Fault> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            Fault::from(UnisocError::InvalidInput(format!(
                "argument {index} of '{}': {e}",
                self.subject
            )))
        })
    }

    #[must_use]
    pub fn into_args(self) -> Vec<Value> { self.args }

    #[must_use]
    pub fn responder(&self) -> Option<&Responder> { self.responder.as_ref() }

    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> { self.envelope.as_ref() }

    #[must_use]
    pub fn engine(&self) -> Option<&Engine> { self.engine.as_ref() }

    pub fn take_attachment(&mut self) -> Option<Attachment> { self.attachment.take() }
}

/// A fixed collection of endpoints that can be shared by several engines.
#[derive(Default)]
pub struct EndpointSet {
    endpoints: BTreeMap<String, Arc<Endpoint>>,
}

impl EndpointSet {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Add an endpoint.
    ///
    /// # Errors
    ///
    /// Fails on an invalid or duplicate subject.
    pub fn with<F, Fut>(
        mut self,
        subject: &str,
        options: EndpointOptions,
        f: F,
    ) -> Result<Self, UnisocError>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        validate_subject(subject)?;
        if self.endpoints.contains_key(subject) {
            return Err(UnisocError::DuplicateEndpoint(subject.to_owned()));
        }
        self.endpoints.insert(
            subject.to_owned(),
            Arc::new(Endpoint::new(subject.to_owned(), options, handler(f))),
        );
        Ok(self)
    }
}

/// A source of endpoints consulted after the local table.
#[derive(Clone)]
pub enum SharedEndpoints {
    /// Another engine, including whatever it shares in turn.
    Engine(Engine),
    Set(Arc<EndpointSet>),
}

#[derive(Default)]
pub(crate) struct EndpointTable {
    local: RwLock<HashMap<String, Arc<Endpoint>>>,
    shared: RwLock<Vec<SharedEndpoints>>,
}

impl EndpointTable {
    pub(crate) fn insert(&self, endpoint: Endpoint) -> Result<(), UnisocError> {
        let mut local = write(&self.local);
        if local.contains_key(&endpoint.subject) {
            return Err(UnisocError::DuplicateEndpoint(endpoint.subject));
        }
        local.insert(endpoint.subject.clone(), Arc::new(endpoint));
        Ok(())
    }

    pub(crate) fn remove(&self, subject: &str) -> bool { write(&self.local).remove(subject).is_some() }

    pub(crate) fn share(&self, source: SharedEndpoints) { write(&self.shared).push(source); }

    pub(crate) fn find(&self, subject: &str, depth: usize) -> Option<Arc<Endpoint>> {
        if let Some(endpoint) = read(&self.local).get(subject) {
            return Some(Arc::clone(endpoint));
        }
        if depth >= MAX_SHARE_DEPTH {
            warn!("endpoint sharing chain too deep, stopping lookup: subject={subject}");
            return None;
        }
        let shared = read(&self.shared).clone();
        shared.iter().find_map(|source| match source {
            SharedEndpoints::Engine(engine) => engine.inner.endpoints.find(subject, depth + 1),
            SharedEndpoints::Set(set) => set.endpoints.get(subject).cloned(),
        })
    }

    /// Visible endpoints keyed by subject; local entries shadow shared ones.
    pub(crate) fn visible(&self, depth: usize) -> BTreeMap<String, Arc<Endpoint>> {
        let mut out = BTreeMap::new();
        if depth < MAX_SHARE_DEPTH {
            let shared = read(&self.shared).clone();
            for source in shared.iter().rev() {
                let entries = match source {
                    SharedEndpoints::Engine(engine) => engine.inner.endpoints.visible(depth + 1),
                    SharedEndpoints::Set(set) => set
                        .endpoints
                        .iter()
                        .filter(|(_, e)| !e.is_secret())
                        .map(|(k, e)| (k.clone(), Arc::clone(e)))
                        .collect(),
                };
                out.extend(entries);
            }
        }
        for (subject, endpoint) in read(&self.local).iter() {
            if endpoint.is_secret() {
                out.remove(subject);
            } else {
                out.insert(subject.clone(), Arc::clone(endpoint));
            }
        }
        out
    }
}
