//! Pending outbound request bookkeeping.

use std::{sync::Arc, time::Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    envelope::Envelope,
    error::{RemoteError, UnisocError},
};

/// Returned by response handlers to keep or withdraw the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancel,
}

/// A response delivered to a handler-mode request.
#[derive(Debug)]
pub struct Response {
    pub id: u64,
    pub result: Result<Value, RemoteError>,
    /// The response envelope with `data` and `error` moved into `result`.
    pub envelope: Envelope,
}

impl Response {
    pub(crate) fn new(mut envelope: Envelope) -> Self {
        let result = match envelope.error.take() {
            Some(error) => Err(RemoteError::new(error)),
            None => Ok(envelope.data.take().unwrap_or(Value::Null)),
        };
        Self {
            id: envelope.id,
            result,
            envelope,
        }
    }
}

pub type ResponseHandler = Arc<dyn Fn(Response) -> Flow + Send + Sync>;

pub(crate) enum ResponseSink {
    /// Completes on the first response, then the entry is removed.
    Once(oneshot::Sender<Result<Envelope, UnisocError>>),
    /// Runs for every response until cancelled or timed out.
    Repeat(ResponseHandler),
}

pub(crate) struct PendingOutbound {
    pub(crate) sink: ResponseSink,
    pub(crate) subject: String,
    pub(crate) created: Instant,
    pub(crate) sent: bool,
}

impl PendingOutbound {
    pub(crate) fn new(subject: &str, sink: ResponseSink) -> Self {
        Self {
            sink,
            subject: subject.to_owned(),
            created: Instant::now(),
            sent: false,
        }
    }

    /// Fail a single-shot request; handler-mode entries are simply dropped.
    pub(crate) fn fail(self, err: UnisocError) {
        if let ResponseSink::Once(tx) = self.sink {
            let _ = tx.send(Err(err));
        }
    }
}
