//! The protocol message envelope.
//!
//! Every message exchanged between two engines is an [`Envelope`]. Its
//! serialized form is a JSON object carrying the `__unisoc` marker so that
//! protocol traffic can be told apart from unrelated data sharing the same
//! channel.

use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::UnisocError,
    multiplex::{Composite, RemoteComposite},
};

/// Name of the marker field in the wire form.
pub const MARKER_FIELD: &str = "__unisoc";
/// Reserved subject carried by every response.
pub const RESPONSE_SUBJECT: &str = "__unisoc_response";
/// Subject of the notice sent to malformed-input senders.
pub const SYNTAX_ERROR_SUBJECT: &str = "SyntaxError";

/// A protocol message.
///
/// `id == 0` marks a one-way message; a non-zero id on any subject other
/// than [`RESPONSE_SUBJECT`] is a request expecting exactly one response.
#[derive(Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "__unisoc", default)]
    pub(crate) marker: bool,
    pub subject: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// On responses, the subject of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Remote address for connectionless transports.
    #[serde(skip)]
    pub peer: Option<SocketAddr>,
    /// Transferable resource travelling with this message.
    #[serde(skip)]
    pub attachment: Option<Attachment>,
}

impl Envelope {
    /// Build a one-way message after validating the subject.
    ///
    /// # Errors
    ///
    /// Returns [`UnisocError::InvalidSubject`] if the subject is unusable.
    pub fn message(subject: impl Into<String>, data: Option<Value>) -> Result<Self, UnisocError> {
        let subject = subject.into();
        validate_subject(&subject)?;
        Ok(Self {
            subject,
            data,
            ..Self::default()
        })
    }

    pub(crate) fn response(id: u64, target: String) -> Self {
        Self {
            subject: RESPONSE_SUBJECT.to_owned(),
            id,
            target: Some(target),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Whether the wire form carried the protocol marker.
    #[must_use]
    pub fn has_marker(&self) -> bool { self.marker }

    #[must_use]
    pub fn is_response(&self) -> bool { self.subject == RESPONSE_SUBJECT }

    /// True for requests: non-zero id on a non-response subject.
    #[must_use]
    pub fn expects_response(&self) -> bool { self.id != 0 && !self.is_response() }

    /// Copy every field except the attachment.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            marker: self.marker,
            subject: self.subject.clone(),
            id: self.id,
            data: self.data.clone(),
            error: self.error.clone(),
            target: self.target.clone(),
            peer: self.peer,
            attachment: None,
        }
    }

    pub(crate) fn mark(&mut self) { self.marker = true; }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("subject", &self.subject)
            .field("id", &self.id)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("target", &self.target)
            .field("peer", &self.peer)
            .field("attachment", &self.attachment.as_ref().map(Attachment::kind))
            .finish_non_exhaustive()
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.id == other.id
            && self.data == other.data
            && self.error == other.error
            && self.target == other.target
    }
}

/// Check that a subject can be routed.
///
/// Subjects must be non-empty. Subjects containing `undefined` are rejected
/// because they almost always come from an unresolved placeholder.
///
/// # Errors
///
/// Returns [`UnisocError::InvalidSubject`] on failure.
pub fn validate_subject(subject: &str) -> Result<(), UnisocError> {
    if subject.is_empty() || subject.contains("undefined") {
        return Err(UnisocError::InvalidSubject(subject.to_owned()));
    }
    Ok(())
}

/// A readable or writable OS-level resource that can travel over channels
/// able to carry handles.
pub enum Handle {
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Reader(_) => f.write_str("Handle::Reader"),
            Handle::Writer(_) => f.write_str("Handle::Writer"),
        }
    }
}

/// Out-of-band payload attached to an envelope.
pub enum Attachment {
    /// A single transferable handle.
    Handle(Handle),
    /// A local composite to be split into pieces on send.
    Composite(Box<dyn Composite>),
    /// A composite reassembled from received pieces.
    Remote(RemoteComposite),
}

impl Attachment {
    fn kind(&self) -> &'static str {
        match self {
            Attachment::Handle(_) => "handle",
            Attachment::Composite(_) => "composite",
            Attachment::Remote(_) => "remote",
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.kind()) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("")]
    #[case("undefined")]
    #[case("user/undefined/get")]
    fn unusable_subjects_are_rejected(#[case] subject: &str) {
        assert!(matches!(
            validate_subject(subject),
            Err(UnisocError::InvalidSubject(_))
        ));
    }

    #[test]
    fn wire_form_carries_marker_and_omits_empty_fields() {
        let mut env = Envelope::message("ping", Some(json!([1, 2]))).expect("valid subject");
        env.mark();
        let text = serde_json::to_value(&env).expect("serialize");
        assert_eq!(
            text,
            json!({"__unisoc": true, "subject": "ping", "id": 0, "data": [1, 2]})
        );
    }

    #[test]
    fn response_round_trips_through_json() {
        let mut env = Envelope::response(42, "sum".into());
        env.data = Some(json!(3));
        env.mark();
        let text = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, env);
        assert!(back.has_marker());
        assert!(back.is_response());
        assert!(!back.expects_response());
    }

    #[test]
    fn missing_marker_deserializes_as_unmarked() {
        let env: Envelope =
            serde_json::from_value(json!({"subject": "x", "id": 1})).expect("deserialize");
        assert!(!env.has_marker());
        assert!(env.expects_response());
    }
}
