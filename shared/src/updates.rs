//! Pending Update Map
//!
//! Latest payload per unique key, last write wins. Entries are never expired
//! here; consumers decide how to merge and retain them.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::envelope::FeedUpdate;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingUpdates {
    entries: BTreeMap<String, Value>,
}

impl PendingUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update, returning the payload it replaced (if any)
    pub fn insert(&mut self, update: FeedUpdate) -> Option<Value> {
        self.entries.insert(update.key, update.data)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}
