//! Connection configuration and the outgoing error policy.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use log::warn;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{codec::DEFAULT_EOM, error::Fault};

/// Transform applied by [`ErrorPolicy::Custom`].
pub type ErrorTransform = Arc<dyn Fn(&Fault) -> Value + Send + Sync>;

/// How errors are rendered before they are transmitted to a peer.
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Send the full serializable form.
    #[default]
    All,
    /// Send the error's string rendering.
    ToString,
    /// Send primitive values as-is and replace anything else with
    /// `"Internal Error"`.
    IfPrimitive,
    /// Send the fixed string `"error"`.
    None,
    /// Send the error's code, falling back to `"error"`.
    Code,
    /// Send whatever the closure returns.
    Custom(ErrorTransform),
}

impl ErrorPolicy {
    /// Render `fault` for transmission. `id` is only used for logging.
    #[must_use]
    pub fn normalize(&self, fault: &Fault, id: u64) -> Value {
        match self {
            ErrorPolicy::All => fault.to_value(),
            ErrorPolicy::ToString => Value::String(fault.to_string()),
            ErrorPolicy::IfPrimitive => {
                if fault.is_primitive() {
                    fault.to_value()
                } else {
                    warn!("withholding non-primitive error from peer: id={id}, error={fault}");
                    Value::String("Internal Error".to_owned())
                }
            }
            ErrorPolicy::None => Value::String("error".to_owned()),
            ErrorPolicy::Code => Value::String(fault.code().unwrap_or_else(|| "error".to_owned())),
            ErrorPolicy::Custom(transform) => transform(fault),
        }
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorPolicy::All => "All",
            ErrorPolicy::ToString => "ToString",
            ErrorPolicy::IfPrimitive => "IfPrimitive",
            ErrorPolicy::None => "None",
            ErrorPolicy::Code => "Code",
            ErrorPolicy::Custom(_) => "Custom(<fn>)",
        };
        f.write_str(name)
    }
}

/// Returned when a policy name is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown error policy '{0}'")]
pub struct UnknownPolicy(String);

impl FromStr for ErrorPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "true" => Ok(ErrorPolicy::All),
            "tostring" | "string" => Ok(ErrorPolicy::ToString),
            "ifprimitive" | "onlyprimitive" => Ok(ErrorPolicy::IfPrimitive),
            "none" | "false" => Ok(ErrorPolicy::None),
            "code" => Ok(ErrorPolicy::Code),
            _ => Err(UnknownPolicy(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for ErrorPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-connection settings.
///
/// Durations are stored in milliseconds; zero disables the corresponding
/// feature.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub eom: String,
    pub transmit_errors: ErrorPolicy,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub keepalive_ms: u64,
    pub reconnect_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eom: DEFAULT_EOM.to_owned(),
            transmit_errors: ErrorPolicy::All,
            request_timeout_ms: 0,
            connect_timeout_ms: 0,
            keepalive_ms: 0,
            reconnect_interval_ms: 0,
            shutdown_timeout_ms: 5000,
            history_limit: 1000,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> { (ms > 0).then(|| Duration::from_millis(ms)) }

impl Config {
    #[must_use]
    pub fn eom(mut self, eom: impl Into<String>) -> Self {
        self.eom = eom.into();
        self
    }

    #[must_use]
    pub fn transmit_errors(mut self, policy: ErrorPolicy) -> Self {
        self.transmit_errors = policy;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    #[must_use]
    pub fn request_timeout_duration(&self) -> Option<Duration> { millis(self.request_timeout_ms) }

    #[must_use]
    pub fn connect_timeout_duration(&self) -> Option<Duration> { millis(self.connect_timeout_ms) }

    #[must_use]
    pub fn keepalive_duration(&self) -> Option<Duration> { millis(self.keepalive_ms) }

    #[must_use]
    pub fn reconnect_interval_duration(&self) -> Option<Duration> {
        millis(self.reconnect_interval_ms)
    }

    #[must_use]
    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn duration_ms(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }
