//! Rendering of panic payloads caught from endpoint handlers.

use std::{any::Any, fmt};

/// Displays a panic payload as its message when it is a string.
///
/// ```
/// use unisoc::panic::format_panic;
/// let caught = std::panic::catch_unwind(|| panic!("handler exploded")).unwrap_err();
/// assert_eq!(format_panic(caught).to_string(), "handler exploded");
/// assert!(format_panic(Box::new(7_u8)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }
