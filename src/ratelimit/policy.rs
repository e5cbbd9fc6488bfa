//! Remote policy documents.
//!
//! A policy document names the identity field, the default limit and an
//! ordered list of selector rules:
//!
//! ```yaml
//! key: id
//! default_limit: 1000
//! rules:
//!   - limit: 100
//!     selectors:
//!       id: foo
//!       level: debug
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::rule::SelectorRule;
use crate::error::{FloodgateError, Result};

/// The document served by the policy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Field whose value separates independent quota scopes
    pub key: String,
    /// Limit of the implicit catch-all rule
    pub default_limit: u64,
    /// Rules in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// One rule as written in the policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Events per bucket granted by this rule
    pub limit: u64,
    /// Required field values
    #[serde(default)]
    pub selectors: HashMap<String, SelectorValue>,
}

/// A selector value. Any YAML scalar is accepted and kept as written, so
/// `code: 404` selects events whose `code` field is the string `"404"` and
/// `version: 1.10` keeps its trailing zero. A null value (`tag:`) selects the
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SelectorValue(String);

impl SelectorValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for SelectorValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Deserializing as a string takes the scalar's source text instead of
        // its resolved number or bool.
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(SelectorValue(value.unwrap_or_default()))
    }
}

impl fmt::Display for SelectorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SelectorValue {
    fn from(value: &str) -> Self {
        SelectorValue(value.to_string())
    }
}

impl PolicyDocument {
    /// Parse a policy document from YAML.
    ///
    /// `key` and `default_limit` are required.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Policy(format!("Failed to parse policy document: {}", e)))
    }

    /// Build the rule list: one rule per entry in document order, then the
    /// catch-all with `default_limit`.
    pub fn build(&self) -> ActivePolicy {
        let mut rules = Vec::with_capacity(self.rules.len() + 1);
        for entry in &self.rules {
            rules.push(SelectorRule::new(
                entry.selectors.iter().map(|(k, v)| (k.clone(), v.as_str())),
                entry.limit,
            ));
        }
        rules.push(SelectorRule::catch_all(self.default_limit));

        ActivePolicy {
            identity_field: self.key.clone(),
            rules,
        }
    }
}

/// The policy currently in force. Immutable; replaced as a whole on refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivePolicy {
    /// Field whose value separates independent quota scopes
    pub identity_field: String,
    /// Rules in evaluation order, catch-all last
    pub rules: Vec<SelectorRule>,
}

impl ActivePolicy {
    /// The state before any policy has loaded: no rules, every event admitted.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
