use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use log::Level;
use logtest::Logger;
use rstest::fixture;

/// Exclusive handle to the process-wide captured log.
///
/// `logtest` installs a global logger, so every test that inspects log
/// output must go through this guard. Records left over from a previous
/// holder are discarded when the handle is acquired.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the captured log and clear stale records.
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger.lock().unwrap_or_else(PoisonError::into_inner);
        while guard.pop().is_some() {}

        Self { guard }
    }

    /// Drain captured records, returning `(level, message)` pairs.
    pub fn drain(&mut self) -> Vec<(Level, String)> {
        let mut out = Vec::new();
        while let Some(record) = self.guard.pop() {
            out.push((record.level(), record.args().to_owned()));
        }
        out
    }

    /// Drain the log and report whether a record at `level` contains
    /// every one of `needles`.
    pub fn contains(&mut self, level: Level, needles: &[&str]) -> bool {
        self.drain()
            .iter()
            .any(|(l, msg)| *l == level && needles.iter().all(|n| msg.contains(n)))
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
