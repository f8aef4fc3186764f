//! Test utilities for `unisoc`.
//!
//! Helpers for running engines over in-memory streams, a recording link
//! for driving an engine without a peer, and serialized access to the
//! captured `log` output.
//!
//! ```rust
//! use serde_json::json;
//! use unisoc::{Config, Engine, EndpointOptions};
//! use unisoc_testing::engine_pair;
//!
//! # async fn example() {
//! let server = Engine::new(Config::default());
//! server
//!     .register_endpoint("ping", EndpointOptions::new(), |_| async { Ok(json!("pong")) })
//!     .unwrap();
//! let (_server, client) = engine_pair(server, Engine::new(Config::default()));
//! assert_eq!(client.request("ping", ()).await.unwrap(), json!("pong"));
//! # }
//! ```

mod link;
mod logging;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

pub use link::MockLink;
pub use logging::{LoggerHandle, logger};
use unisoc::{Engine, StreamConnection, engine::IdAllocator};

/// Buffer size of the in-memory streams created by [`engine_pair`].
pub const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Run two engines against each other over a `tokio::io::duplex` stream.
///
/// Must be called inside a Tokio runtime.
pub fn engine_pair(left: Engine, right: Engine) -> (StreamConnection, StreamConnection) {
    let (near, far) = tokio::io::duplex(DUPLEX_CAPACITY);
    (
        StreamConnection::spawn(left, near, Some("left".into())),
        StreamConnection::spawn(right, far, Some("right".into())),
    )
}

/// Engine bound to a fresh [`MockLink`] and marked connected.
pub fn mock_engine(engine: Engine) -> (Engine, Arc<MockLink>) {
    let link = Arc::new(MockLink::new());
    engine.attach_link(Arc::clone(&link) as Arc<dyn unisoc::Link>);
    engine.notify_connected();
    (engine, link)
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Allocator that returns a scripted sequence of ids regardless of what is
/// in use, then falls back to probing upwards from the last scripted id.
#[derive(Debug, Default)]
pub struct ScriptedIds {
    script: Mutex<VecDeque<u64>>,
    last: Mutex<u64>,
}

impl ScriptedIds {
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(ids.into_iter().collect()),
            last: Mutex::new(0),
        }
    }
}

impl IdAllocator for ScriptedIds {
    fn allocate(&self, in_use: &dyn Fn(u64) -> bool) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            *last = id;
            return id;
        }
        let mut id = *last + 1;
        while in_use(id) {
            id += 1;
        }
        *last = id;
        id
    }
}
