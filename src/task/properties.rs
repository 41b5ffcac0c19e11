//! Per-task key/value store.
//!
//! Keys are strings, values are `serde_json::Value` so callers get a typed
//! variant instead of an unchecked downcast. Writes are last-write-wins per
//! key; reads hand out copies, never aliases into the live map.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::util::lock_unpoisoned;

/// Snapshot type returned by [`PropertyBag::snapshot`].
pub type PropertyMap = HashMap<String, Value>;

/// Thread-safe property store owned by a task.
#[derive(Debug, Default)]
pub struct PropertyBag {
    entries: Mutex<PropertyMap>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a single property.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        lock_unpoisoned(&self.entries).insert(key.into(), value);
    }

    /// Insert or overwrite every entry of `values`.
    pub fn extend(&self, values: PropertyMap) {
        lock_unpoisoned(&self.entries).extend(values);
    }

    /// Copy of the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.entries).get(key).cloned()
    }

    /// Remove the entry stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.entries).remove(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    /// Point-in-time copy of the whole bag. Later writes do not show up in
    /// the returned map.
    pub fn snapshot(&self) -> PropertyMap {
        lock_unpoisoned(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.entries).is_empty()
    }
}
