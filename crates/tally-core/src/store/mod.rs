//! Observable key/value store.
//!
//! Values are JSON. Writes that change something publish a `StoreChange`
//! to every subscriber; writes that leave the value as it was publish
//! nothing.

pub mod keys;
mod merge;
mod publisher;

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

pub use merge::{merge_json, strip_nulls};
pub use publisher::{Publisher, Subscription, SubscriptionId};

/// One effective write, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    /// Collection prefix when the write touched collection members,
    /// otherwise the key itself.
    pub target: String,
    /// New value per affected key. `None` means the key was removed.
    pub changed: BTreeMap<String, Option<Value>>,
}

/// A serializable store write, carried by requests and scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StoreUpdate {
    Set { key: String, value: Value },
    Merge { key: String, value: Value },
    #[serde(rename_all = "camelCase")]
    MergeCollection {
        collection: String,
        entries: BTreeMap<String, Value>,
    },
    Remove { key: String },
}

#[derive(Default)]
pub struct Store {
    values: BTreeMap<String, Value>,
    collections: BTreeSet<String>,
    changes: Publisher<StoreChange>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the client's standard collections registered.
    pub fn with_default_collections() -> Self {
        let mut store = Self::new();
        for prefix in keys::COLLECTIONS {
            store.collections.insert((*prefix).to_string());
        }
        store
    }

    pub fn register_collection(&mut self, prefix: &str) -> StoreResult<()> {
        if prefix.is_empty() {
            return Err(StoreError::EmptyCollection);
        }
        self.collections.insert(prefix.to_string());
        Ok(())
    }

    /// Longest registered collection prefix that `key` is a member of.
    pub fn collection_of(&self, key: &str) -> Option<&str> {
        self.collections
            .iter()
            .filter(|prefix| keys::member_id(prefix, key).is_some())
            .max_by_key(|prefix| prefix.len())
            .map(String::as_str)
    }

    /// Receive every change.
    pub fn subscribe(&mut self) -> Subscription<StoreChange> {
        self.changes.subscribe()
    }

    /// Receive changes for one key or one collection prefix.
    pub fn subscribe_to(&mut self, target: &str) -> Subscription<StoreChange> {
        let target = target.to_string();
        self.changes
            .subscribe_filtered(move |change: &StoreChange| change.target == target)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Borrowed view of every member of a collection, keyed by full key.
    pub fn collection(&self, prefix: &str) -> BTreeMap<&str, &Value> {
        self.values
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| key.len() > prefix.len())
            .map(|(key, value)| (key.as_str(), value))
            .collect()
    }

    pub fn get_collection(&self, prefix: &str) -> BTreeMap<String, Value> {
        self.collection(prefix)
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    /// Replace the value at `key`. A JSON `null` removes it.
    /// Returns whether anything changed.
    pub fn set(&mut self, key: &str, value: Value) -> bool {
        let new = if value.is_null() {
            None
        } else {
            Some(strip_nulls(&value))
        };
        match self.write(key, new) {
            Some(change) => {
                self.publish_single(key, change);
                true
            }
            None => false,
        }
    }

    pub fn set_serialized<T: Serialize>(&mut self, key: &str, value: &T) -> StoreResult<bool> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(key, value))
    }

    /// Deep-merge `patch` into the value at `key`.
    pub fn merge(&mut self, key: &str, patch: &Value) -> bool {
        let new = merged(self.values.get(key), patch);
        match self.write(key, new) {
            Some(change) => {
                self.publish_single(key, change);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.set(key, Value::Null)
    }

    /// Merge many members of one collection, publishing a single change.
    /// A `null` entry removes that member. Returns the number of members
    /// that changed.
    pub fn merge_collection(
        &mut self,
        prefix: &str,
        entries: &BTreeMap<String, Value>,
    ) -> StoreResult<usize> {
        if prefix.is_empty() {
            return Err(StoreError::EmptyCollection);
        }
        if let Some(bad) = entries
            .keys()
            .find(|key| keys::member_id(prefix, key).is_none())
        {
            return Err(StoreError::KeyOutsideCollection {
                collection: prefix.to_string(),
                key: bad.clone(),
            });
        }

        let mut changed = BTreeMap::new();
        for (key, patch) in entries {
            let new = if patch.is_null() {
                None
            } else {
                merged(self.values.get(key), patch)
            };
            if let Some(value) = self.write(key, new) {
                changed.insert(key.clone(), value);
            }
        }

        let count = changed.len();
        if count > 0 {
            self.changes.publish(&StoreChange {
                target: prefix.to_string(),
                changed,
            });
        }
        Ok(count)
    }

    pub fn apply(&mut self, update: &StoreUpdate) -> StoreResult<()> {
        match update {
            StoreUpdate::Set { key, value } => {
                self.set(key, value.clone());
            }
            StoreUpdate::Merge { key, value } => {
                self.merge(key, value);
            }
            StoreUpdate::MergeCollection {
                collection,
                entries,
            } => {
                self.merge_collection(collection, entries)?;
            }
            StoreUpdate::Remove { key } => {
                self.remove(key);
            }
        }
        Ok(())
    }

    pub fn apply_all(&mut self, updates: &[StoreUpdate]) -> StoreResult<()> {
        for update in updates {
            self.apply(update)?;
        }
        Ok(())
    }

    /// Write without publishing. Returns `Some(new_value)` if the stored
    /// value changed.
    fn write(&mut self, key: &str, new: Option<Value>) -> Option<Option<Value>> {
        if self.values.get(key) == new.as_ref() {
            return None;
        }
        match &new {
            Some(value) => {
                self.values.insert(key.to_string(), value.clone());
            }
            None => {
                self.values.remove(key);
            }
        }
        Some(new)
    }

    fn publish_single(&mut self, key: &str, value: Option<Value>) {
        let target = self.collection_of(key).unwrap_or(key).to_string();
        let mut changed = BTreeMap::new();
        changed.insert(key.to_string(), value);
        self.changes.publish(&StoreChange { target, changed });
    }
}

fn merged(existing: Option<&Value>, patch: &Value) -> Option<Value> {
    let mut value = existing.cloned().unwrap_or(Value::Null);
    merge_json(&mut value, patch);
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}
