//! # Subscription Filter Compiler
//!
//! Translates the structured filter DSL into the attribute-filter query
//! language understood by the message bus.
//!
//! | Node | Compiled | Negated |
//! |------|----------|---------|
//! | `hasKey: k` | `attributes:"k"` | `NOT attributes:"k"` |
//! | `keyEquals: {k, v}` | `attributes."k" = "v"` | `attributes."k" != "v"` |
//! | `startsWith: {k, v}` | `hasPrefix(attributes."k", "v")` | `NOT hasPrefix(...)` |
//!
//! Children are appended as `<self> AND (<child>) AND (<child>)` or the
//! `OR` equivalent. Empty child lists are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a filter tree cannot be compiled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A node carries none of `hasKey`, `keyEquals`, `startsWith`.
    #[error("A SubscriptionFilter must have one of {{hasKey, keyEquals, startsWith}}")]
    MissingPredicate,

    /// A node carries more than one base predicate.
    #[error("A SubscriptionFilter must have only one of {{hasKey, keyEquals, startsWith}}, found {found}")]
    MultiplePredicates { found: usize },

    /// A node carries non-empty `$and` and `$or` lists at once.
    #[error("A SubscriptionFilter cannot combine non-empty $and and $or lists")]
    AmbiguousCombinator,
}

/// Attribute key and the value it is compared with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One node of the filter tree.
///
/// Exactly one of `has_key`, `key_equals`, `starts_with` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    /// `attributes:"{has_key}"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_key: Option<String>,

    /// `attributes."{key}" = "{value}"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_equals: Option<KeyValue>,

    /// `hasPrefix(attributes."{key}", "{value}")`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<KeyValue>,

    /// `NOT` / `!=`
    #[serde(default)]
    pub is_negated: bool,

    /// this AND (that) AND (that)
    #[serde(rename = "$and", default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<SubscriptionFilter>,

    /// this OR (that) OR (that)
    #[serde(rename = "$or", default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<SubscriptionFilter>,
}

impl SubscriptionFilter {
    /// Match messages carrying the attribute `key`.
    #[must_use]
    pub fn has_key(key: impl Into<String>) -> Self {
        Self {
            has_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Match messages whose attribute `key` equals `value`.
    #[must_use]
    pub fn key_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key_equals: Some(KeyValue {
                key: key.into(),
                value: value.into(),
            }),
            ..Self::default()
        }
    }

    /// Match messages whose attribute `key` starts with `value`.
    #[must_use]
    pub fn starts_with(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            starts_with: Some(KeyValue {
                key: key.into(),
                value: value.into(),
            }),
            ..Self::default()
        }
    }

    /// Invert this node's own predicate.
    #[must_use]
    pub fn negated(mut self) -> Self {
        self.is_negated = true;
        self
    }

    /// Conjoin this node with `children`.
    #[must_use]
    pub fn and(mut self, children: Vec<SubscriptionFilter>) -> Self {
        self.all_of = children;
        self
    }

    /// Disjoin this node with `children`.
    #[must_use]
    pub fn or(mut self, children: Vec<SubscriptionFilter>) -> Self {
        self.any_of = children;
        self
    }

    /// Compile the tree into a bus filter query.
    ///
    /// # Errors
    ///
    /// - `FilterError::MissingPredicate` - a node has no base predicate
    /// - `FilterError::MultiplePredicates` - a node has several base predicates
    /// - `FilterError::AmbiguousCombinator` - a node has both `$and` and `$or`
    pub fn compile(&self) -> Result<String, FilterError> {
        let mut query = self.predicate()?;

        let (operator, children) = match (self.all_of.is_empty(), self.any_of.is_empty()) {
            (true, true) => return Ok(query),
            (false, false) => return Err(FilterError::AmbiguousCombinator),
            (false, true) => ("AND", &self.all_of),
            (true, false) => ("OR", &self.any_of),
        };

        for child in children {
            let compiled = child.compile()?;
            query.push_str(&format!(" {operator} ({compiled})"));
        }
        Ok(query)
    }

    fn predicate(&self) -> Result<String, FilterError> {
        let found = usize::from(self.has_key.is_some())
            + usize::from(self.key_equals.is_some())
            + usize::from(self.starts_with.is_some());
        if found > 1 {
            return Err(FilterError::MultiplePredicates { found });
        }

        let not = if self.is_negated { "NOT " } else { "" };
        if let Some(key) = &self.has_key {
            return Ok(format!("{not}attributes:{}", quote(key)));
        }
        if let Some(KeyValue { key, value }) = &self.key_equals {
            let op = if self.is_negated { "!=" } else { "=" };
            return Ok(format!("attributes.{} {op} {}", quote(key), quote(value)));
        }
        if let Some(KeyValue { key, value }) = &self.starts_with {
            return Ok(format!(
                "{not}hasPrefix(attributes.{}, {})",
                quote(key),
                quote(value)
            ));
        }
        Err(FilterError::MissingPredicate)
    }
}

/// Double-quote `raw`, escaping backslashes and quotes.
fn quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
