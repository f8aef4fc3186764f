#![doc(html_root_url = "https://docs.rs/unisoc/latest")]
//! Public API for the `unisoc` library.
//!
//! A transport-agnostic request/response protocol. Two engines exchange
//! named messages and requests over byte streams, frame channels,
//! datagrams or in-process channels, correlating each response with the
//! request that caused it. A fan-out server tracks many peers, and
//! composite resources such as child processes can be handed across
//! channels that carry handles.

pub mod codec;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod multiplex;
pub mod panic;
pub mod payload;
pub mod server;
pub mod transport;

pub use config::{Config, ErrorPolicy};
pub use engine::{
    Call,
    ConnectionState,
    Endpoint,
    EndpointOptions,
    Engine,
    EngineBuilder,
    Flow,
    Incoming,
    Responder,
    Response,
};
pub use envelope::{Attachment, Envelope, Handle};
pub use error::{ErrorCode, Fault, RemoteError, UnisocError};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ENVELOPES_TOTAL, ERRORS_TOTAL};
pub use multiplex::{Composite, RemoteComposite, RemoteProxy, Subprocess};
pub use payload::Args;
pub use server::{Broadcast, ConnectionId, ListenTarget, Listening, Server, ServerEvent};
pub use transport::{
    ChannelConnection,
    DatagramConnection,
    FrameConnection,
    Killable,
    Link,
    Listenable,
    ReconnectingClient,
    StreamConnection,
    Transmittable,
    TransportError,
};
