//! Accept loops and their retry pacing.

mod accept;
mod backoff;

pub(super) use accept::{AcceptListener, accept_frames, accept_loop};
pub use backoff::BackoffConfig;
