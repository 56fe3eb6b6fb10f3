//! Filter types for memory search
//!
//! Narrows search results by exact metadata values, such as a memory's kind
//! or tier.

use serde_json::Value;

use crate::memory::types::Metadata;

/// Metadata equality filter.
///
/// Every listed key must be present with exactly the given value. An empty
/// filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    equals: Metadata,
}

impl MetadataFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}
