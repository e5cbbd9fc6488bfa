//! Selector rules: which quota applies to an event.

use std::fmt;

use crate::event::EventFields;

/// Separator between the parts of a match key.
const KEY_SEPARATOR: char = ':';

/// An immutable matcher made of required `field == value` equalities and the
/// limit granted when all of them hold.
///
/// A rule with no selectors matches every event and serves as the catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorRule {
    /// Selector field names, sorted
    field_names: Vec<String>,
    /// Expected values, aligned with `field_names`
    expected_values: Vec<String>,
    limit: u64,
    /// Text form of `limit`, computed once so matching never formats numbers
    key_prefix: String,
}

impl SelectorRule {
    /// Create a rule from an unordered set of selectors.
    pub fn new<I, K, V>(selectors: I, limit: u64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut pairs: Vec<(String, String)> = selectors
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let (field_names, expected_values): (Vec<String>, Vec<String>) = pairs.into_iter().unzip();

        Self {
            field_names,
            expected_values,
            limit,
            key_prefix: limit.to_string(),
        }
    }

    /// The catch-all rule granting `limit`.
    pub fn catch_all(limit: u64) -> Self {
        Self::new(std::iter::empty::<(String, String)>(), limit)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn expected_values(&self) -> &[String] {
        &self.expected_values
    }

    pub fn is_catch_all(&self) -> bool {
        self.field_names.is_empty()
    }

    /// Check `event` against every selector and, on success, append the match
    /// key `<limit>:<value>:<value>:...` (values in sorted field order) to
    /// `buf`.
    ///
    /// Missing fields, non-text fields and differing values all mean no match,
    /// in which case `buf` is left as it was.
    pub fn match_into<E: EventFields + ?Sized>(&self, event: &E, buf: &mut String) -> bool {
        let start = buf.len();
        buf.push_str(&self.key_prefix);
        buf.push(KEY_SEPARATOR);

        for (field, expected) in self.field_names.iter().zip(&self.expected_values) {
            match event.text(field) {
                Some(value) if value == expected => {
                    buf.push_str(value);
                    buf.push(KEY_SEPARATOR);
                }
                _ => {
                    buf.truncate(start);
                    return false;
                }
            }
        }
        true
    }

    /// Allocating form of [`match_into`](Self::match_into).
    pub fn match_key<E: EventFields + ?Sized>(&self, event: &E) -> Option<String> {
        let mut buf = String::with_capacity(self.key_prefix.len() + 16);
        self.match_into(event, &mut buf).then_some(buf)
    }
}

impl fmt::Display for SelectorRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "limit={} selectors={{", self.limit)?;
        for (i, (field, value)) in self.field_names.iter().zip(&self.expected_values).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        f.write_str("}")
    }
}
