//! Shape of request payloads as seen by endpoint binding.

use serde_json::{Map, Value};

/// Payload classified by shape.
///
/// An array is treated as positional arguments, an object as named
/// arguments, any other value as a single argument, and an absent payload
/// as no arguments at all.
#[derive(Clone, Debug, PartialEq)]
pub enum Args {
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
    Single(Value),
}

impl Args {
    /// Number of arguments supplied.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Args::None => 0,
            Args::Positional(values) => values.len(),
            Args::Named(map) => map.len(),
            Args::Single(_) => 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl From<Option<Value>> for Args {
    fn from(data: Option<Value>) -> Self {
        match data {
            None | Some(Value::Null) => Args::None,
            Some(Value::Array(values)) => Args::Positional(values),
            Some(Value::Object(map)) => Args::Named(map),
            Some(other) => Args::Single(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(None, 0)]
    #[case(Some(json!(null)), 0)]
    #[case(Some(json!([1, 2, 3])), 3)]
    #[case(Some(json!({"a": 1})), 1)]
    #[case(Some(json!("x")), 1)]
    fn payload_shape_determines_arity(#[case] data: Option<Value>, #[case] len: usize) {
        assert_eq!(Args::from(data).len(), len);
    }
}
