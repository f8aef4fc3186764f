//! Metric names and recording helpers.
//!
//! With the `metrics` feature disabled every helper compiles to a no-op so
//! call sites need no feature gates of their own.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Gauge of connections currently attached to a transport.
pub const CONNECTIONS_ACTIVE: &str = "unisoc_connections_active";
/// Counter of envelopes moved, labelled by `direction`.
pub const ENVELOPES_TOTAL: &str = "unisoc_envelopes_total";
/// Counter of transport failures and handler panics.
pub const ERRORS_TOTAL: &str = "unisoc_errors_total";

/// Which way an envelope travelled.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

#[cfg(feature = "metrics")]
pub fn inc_envelopes(direction: Direction) {
    counter!(ENVELOPES_TOTAL, "direction" => direction.as_str()).increment(1);
}

#[cfg(feature = "metrics")]
pub fn inc_errors() { counter!(ERRORS_TOTAL).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn inc_envelopes(_direction: Direction) {}

#[cfg(not(feature = "metrics"))]
pub fn inc_errors() {}
