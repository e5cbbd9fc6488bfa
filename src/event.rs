//! Read access to the fields of a pipeline event.
//!
//! Field paths are dot-separated and walk nested objects, so `host.name`
//! resolves `{"host": {"name": "web-1"}}`. A flat key containing a dot is
//! tried first, so `{"host.name": "web-1"}` resolves as well.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::Value;

/// A structured event as seen by the limiter.
pub trait EventFields {
    /// The field's value if it is present and textual.
    fn text(&self, path: &str) -> Option<&str>;

    /// Any present value rendered as text.
    fn render(&self, path: &str) -> Option<Cow<'_, str>>;
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    if let Some(v) = object.get(path) {
        return Some(v);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

impl EventFields for Value {
    fn text(&self, path: &str) -> Option<&str> {
        lookup(self, path)?.as_str()
    }

    fn render(&self, path: &str) -> Option<Cow<'_, str>> {
        match lookup(self, path)? {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            other => Some(Cow::Owned(other.to_string())),
        }
    }
}

impl EventFields for HashMap<String, String> {
    fn text(&self, path: &str) -> Option<&str> {
        self.get(path).map(String::as_str)
    }

    fn render(&self, path: &str) -> Option<Cow<'_, str>> {
        self.text(path).map(Cow::Borrowed)
    }
}
