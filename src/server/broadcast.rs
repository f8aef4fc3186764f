//! One-to-many delivery to connected peers.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::join_all;
use log::{debug, warn};
use serde_json::Value;

use super::{ConnectionId, Server, ServerError};
use crate::{
    engine::{Flow, Response, ResponseHandler},
    envelope::validate_subject,
};

/// What to broadcast and to whom.
///
/// Without a group every connected peer is targeted. When a group is given
/// and no subject, the group name is used as the subject.
#[derive(Clone, Default)]
pub struct Broadcast {
    subject: Option<String>,
    data: Option<Value>,
    group: Option<String>,
    exclude: Option<ConnectionId>,
    on_response: Option<ResponseHandler>,
    timeout: Option<Duration>,
}

impl Broadcast {
    /// Address every connected peer on `subject`.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    /// Address the members of `group` on the subject named after it.
    #[must_use]
    pub fn to_group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }

    /// Payload sent to each peer; `null` sends none.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = (!data.is_null()).then_some(data);
        self
    }

    /// Restrict the broadcast to the members of `group`.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Skip the peer with connection id `id`, typically the sender.
    #[must_use]
    pub fn exclude(mut self, id: ConnectionId) -> Self {
        self.exclude = Some(id);
        self
    }

    /// Send a request to each peer and pass every response to `handler`.
    #[must_use]
    pub fn on_response<F>(mut self, handler: F) -> Self
    where
        F: Fn(Response) -> Flow + Send + Sync + 'static,
    {
        self.on_response = Some(Arc::new(handler));
        self
    }

    /// Drop response handlers after `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("subject", &self.subject)
            .field("group", &self.group)
            .field("exclude", &self.exclude)
            .field("requests", &self.on_response.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Deliver a message, or a request when a response handler is set, to
    /// every targeted peer.
    ///
    /// Returns the number of peers reached. An empty target set resolves at
    /// once without sending anything.
    ///
    /// # Errors
    ///
    /// Fails without sending when no subject can be determined or the
    /// subject is invalid. Otherwise every peer is attempted and
    /// [`ServerError::Broadcast`] lists the ones that failed.
    pub async fn broadcast(&self, message: Broadcast) -> Result<usize, ServerError> {
        let subject = message
            .subject
            .clone()
            .or_else(|| message.group.clone())
            .ok_or(ServerError::NoSubject)?;
        validate_subject(&subject)?;

        let mut targets = match &message.group {
            Some(group) => self
                .group_members(group)
                .into_iter()
                .filter_map(|id| self.client(id).map(|engine| (id, engine)))
                .collect(),
            None => self.clients(),
        };
        if let Some(excluded) = message.exclude {
            targets.retain(|(id, _)| *id != excluded);
        }
        if targets.is_empty() {
            debug!("broadcast has no recipients: subject={subject}, group={:?}", message.group);
            return Ok(0);
        }

        let attempted = targets.len();
        let subject = subject.as_str();
        let message = &message;
        let results = join_all(targets.iter().map(|(id, engine)| async move {
            let result = match &message.on_response {
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    engine
                        .request_with_handler(subject, &message.data, message.timeout, move |r| {
                            handler(r)
                        })
                        .await
                        .map(|_| ())
                }
                None => engine.send(subject, &message.data).await,
            };
            (*id, result)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        if failures.is_empty() {
            Ok(attempted)
        } else {
            for (id, error) in &failures {
                warn!("broadcast to peer failed: subject={subject}, peer={id}, error={error}");
            }
            Err(ServerError::Broadcast {
                attempted,
                failures,
            })
        }
    }
}
