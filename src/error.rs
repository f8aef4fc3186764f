//! Error types shared across the engine, transports and server.
//!
//! Local failures are reported through [`UnisocError`]. Failures produced by
//! endpoint handlers are expressed as [`Fault`] values which are normalized
//! by the connection's error policy before crossing the wire. Errors received
//! from a peer are surfaced as [`RemoteError`].

use std::{fmt, io, time::Duration};

use serde_json::{Value, json};
use thiserror::Error;

use crate::transport::TransportError;

/// Stable machine-readable error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid input such as a bad subject or missing arguments.
    Invalid,
    /// A resource with the same name already exists.
    Exists,
    /// The named resource does not exist.
    Fault,
    /// Named arguments were supplied to an endpoint that cannot map them.
    Mismatch,
    /// The connection is not open.
    NotConnected,
    /// A request did not receive a response in time.
    Timeout,
    /// A message arrived that does not fit the protocol sequence.
    Sequence,
    /// A pending request was withdrawn before it completed.
    Cancelled,
    /// The peer answered with an error.
    Remote,
    /// The transport or serializer failed.
    Io,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Invalid => "EINVAL",
            ErrorCode::Exists => "EEXISTS",
            ErrorCode::Fault => "EFAULT",
            ErrorCode::Mismatch => "EMISMATCH",
            ErrorCode::NotConnected => "EPIPE",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Sequence => "ESEQ",
            ErrorCode::Cancelled => "ECANCELED",
            ErrorCode::Remote => "EREMOTE",
            ErrorCode::Io => "EIO",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Errors raised by local protocol operations.
#[derive(Debug, Error)]
pub enum UnisocError {
    /// Subject was empty or otherwise unusable.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
    /// An endpoint with this subject is already registered locally.
    #[error("endpoint '{0}' already exists")]
    DuplicateEndpoint(String),
    /// No endpoint with this subject is registered.
    #[error("endpoint '{0}' doesn't exist")]
    UnknownEndpoint(String),
    /// Input did not satisfy the endpoint's argument contract.
    #[error("{0}")]
    InvalidInput(String),
    /// Named arguments were sent to an endpoint without parameter names.
    #[error("endpoint '{0}' does not accept named arguments")]
    NamedArgsUnsupported(String),
    /// The connection is not open.
    #[error("socket is not open, failed to send")]
    NotConnected,
    /// No response arrived before the deadline.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },
    /// A response referenced an id with no pending request.
    #[error("received response to non-existent request {0}")]
    UnknownRequest(u64),
    /// The pending request was removed before a response arrived.
    #[error("request {0} was cancelled")]
    Cancelled(u64),
    /// The peer answered with an error value.
    #[error("remote error: {0}")]
    Remote(RemoteError),
    /// The transport failed to carry a message.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A payload could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl UnisocError {
    /// Stable code describing this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            UnisocError::InvalidSubject(_) | UnisocError::InvalidInput(_) => ErrorCode::Invalid,
            UnisocError::DuplicateEndpoint(_) => ErrorCode::Exists,
            UnisocError::UnknownEndpoint(_) => ErrorCode::Fault,
            UnisocError::NamedArgsUnsupported(_) => ErrorCode::Mismatch,
            UnisocError::NotConnected => ErrorCode::NotConnected,
            UnisocError::Timeout { .. } => ErrorCode::Timeout,
            UnisocError::UnknownRequest(_) => ErrorCode::Sequence,
            UnisocError::Cancelled(_) => ErrorCode::Cancelled,
            UnisocError::Remote(_) => ErrorCode::Remote,
            UnisocError::Transport(_) | UnisocError::Serialize(_) => ErrorCode::Io,
        }
    }

    /// Return the remote error value if this error came from the peer.
    #[must_use]
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            UnisocError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// Error value received from a peer, already normalized by its policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteError {
    value: Value,
}

impl RemoteError {
    #[must_use]
    pub fn new(value: Value) -> Self { Self { value } }

    /// Raw error value as transmitted.
    #[must_use]
    pub fn value(&self) -> &Value { &self.value }

    #[must_use]
    pub fn into_value(self) -> Value { self.value }

    /// Error code if the peer sent a string or an object carrying `code`.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match &self.value {
            Value::Object(map) => map.get("code").and_then(Value::as_str),
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Human readable message, if one can be found.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match &self.value {
            Value::Object(map) => map
                .get("message")
                .or_else(|| map.get("msg"))
                .and_then(Value::as_str),
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.write_str(msg),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Failure produced by an endpoint handler.
#[derive(Debug)]
pub enum Fault {
    /// A plain value addressed to the peer.
    Value(Value),
    /// A native error raised locally.
    Error(Box<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    /// Wrap any native error.
    pub fn error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Fault::Error(Box::new(err))
    }

    /// Stable code for the `code` error policy.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self {
            Fault::Value(Value::Object(map)) => map
                .get("code")
                .and_then(Value::as_str)
                .map(str::to_owned),
            Fault::Value(Value::String(s)) => Some(s.clone()),
            Fault::Value(_) => None,
            Fault::Error(err) => Some(
                err.downcast_ref::<UnisocError>()
                    .map_or("error", |e| e.code().as_str())
                    .to_owned(),
            ),
        }
    }

    /// Whether the fault is a non-structured value.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Fault::Value(Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))
        )
    }

    /// Full serializable form: values pass through, native errors become
    /// `{code, message}` objects.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Fault::Value(value) => value.clone(),
            Fault::Error(err) => json!({
                "code": self.code().unwrap_or_else(|| "error".to_owned()),
                "message": err.to_string(),
            }),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Value(Value::String(s)) => f.write_str(s),
            Fault::Value(value) => write!(f, "{value}"),
            Fault::Error(err) => write!(f, "{err}"),
        }
    }
}

impl From<UnisocError> for Fault {
    fn from(err: UnisocError) -> Self { Fault::Error(Box::new(err)) }
}

impl From<io::Error> for Fault {
    fn from(err: io::Error) -> Self { Fault::Error(Box::new(err)) }
}

impl From<serde_json::Error> for Fault {
    fn from(err: serde_json::Error) -> Self { Fault::Error(Box::new(err)) }
}

impl From<Value> for Fault {
    fn from(value: Value) -> Self { Fault::Value(value) }
}

impl From<String> for Fault {
    fn from(msg: String) -> Self { Fault::Value(Value::String(msg)) }
}

impl From<&str> for Fault {
    fn from(msg: &str) -> Self { Fault::Value(Value::String(msg.to_owned())) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(UnisocError::InvalidSubject(String::new()), "EINVAL")]
    #[case(UnisocError::DuplicateEndpoint("a".into()), "EEXISTS")]
    #[case(UnisocError::NotConnected, "EPIPE")]
    #[case(UnisocError::UnknownRequest(3), "ESEQ")]
    #[case(UnisocError::Timeout { id: 1, timeout: Duration::from_secs(1) }, "timeout")]
    fn errors_map_to_codes(#[case] err: UnisocError, #[case] code: &str) {
        assert_eq!(err.code().as_str(), code);
    }

    #[test]
    fn native_fault_serializes_code_and_message() {
        let fault = Fault::from(UnisocError::NotConnected);
        assert_eq!(
            fault.to_value(),
            json!({"code": "EPIPE", "message": "socket is not open, failed to send"})
        );
    }

    #[test]
    fn remote_error_reads_legacy_msg_field() {
        let remote = RemoteError::new(json!({"code": "EALREADY", "msg": "busy"}));
        assert_eq!(remote.code(), Some("EALREADY"));
        assert_eq!(remote.to_string(), "busy");
    }
}
