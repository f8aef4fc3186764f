//! Generic subject listeners used when no endpoint matches.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use super::{Responder, lock, read, write};
use crate::envelope::{Attachment, Envelope};

/// A message or request delivered to a listener.
///
/// Clones share the responder and the attachment; the first listener to
/// take the attachment owns it.
#[derive(Clone)]
pub struct Incoming {
    pub subject: String,
    pub id: u64,
    pub data: Option<Value>,
    pub peer: Option<SocketAddr>,
    responder: Option<Responder>,
    attachment: Arc<Mutex<Option<Attachment>>>,
}

impl Incoming {
    pub(crate) fn new(envelope: Envelope, responder: Option<Responder>) -> Self {
        Self {
            subject: envelope.subject,
            id: envelope.id,
            data: envelope.data,
            peer: envelope.peer,
            responder,
            attachment: Arc::new(Mutex::new(envelope.attachment)),
        }
    }

    /// Responder for requests; `None` for one-way messages.
    #[must_use]
    pub fn responder(&self) -> Option<&Responder> { self.responder.as_ref() }

    pub fn take_attachment(&self) -> Option<Attachment> { lock(&self.attachment).take() }
}

pub type Listener = Arc<dyn Fn(Incoming) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    subject: Option<String>,
    listener: Listener,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

impl Listeners {
    /// Register for one subject, or for every subject when `subject` is
    /// `None`.
    pub(crate) fn add(&self, subject: Option<String>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        write(&self.entries).push(Entry {
            id,
            subject,
            listener,
        });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = write(&self.entries);
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize { read(&self.entries).len() }

    /// Deliver to all matching listeners and return how many ran.
    pub(crate) fn emit(&self, incoming: &Incoming) -> usize {
        let matching: Vec<Listener> = read(&self.entries)
            .iter()
            .filter(|e| e.subject.as_deref().is_none_or(|s| s == incoming.subject))
            .map(|e| Arc::clone(&e.listener))
            .collect();
        for listener in &matching {
            listener(incoming.clone());
        }
        matching.len()
    }
}
