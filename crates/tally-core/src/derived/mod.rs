//! Derived values: named, pure computations over store collections that are
//! kept current as those collections change.
//!
//! A derivation is computed in full once, then recomputed on every change to
//! one of its dependencies with the changed members passed as
//! `source_values`. Implementations may use them to rebuild only the
//! affected entries, but the result must equal a full computation over the
//! same store state.

mod engine;
mod index;
pub mod report_metadata;
pub mod report_violations;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::store::{keys, Store, StoreChange};

pub use engine::{DerivedState, DerivedValueEngine};
pub use index::ForeignKeyIndex;
pub use report_metadata::{ReportMetadata, ReportMetadataDerivation, ReportMetadataMap};
pub use report_violations::{
    ReportViolationsDerivation, ReportViolationsMap, TransactionViolations,
};

/// Something a derivation reads from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Every member of a collection prefix.
    Collection(String),
    /// A single key.
    Key(String),
}

impl Dependency {
    pub fn collection(prefix: &str) -> Self {
        Dependency::Collection(prefix.to_string())
    }

    pub fn key(key: &str) -> Self {
        Dependency::Key(key.to_string())
    }

    /// Name the changed members are grouped under in `SourceValues`.
    pub fn id(&self) -> &str {
        match self {
            Dependency::Collection(prefix) => prefix,
            Dependency::Key(key) => key,
        }
    }

    /// Whether a write to `key` is a write to this dependency. Collection
    /// membership is by prefix, whether or not the store registered it.
    pub fn reads(&self, key: &str) -> bool {
        match self {
            Dependency::Collection(prefix) => keys::member_id(prefix, key).is_some(),
            Dependency::Key(own) => own == key,
        }
    }

    pub fn matches(&self, change: &StoreChange) -> bool {
        change.changed.keys().any(|key| self.reads(key))
    }

    /// The members of `change` this dependency reads.
    pub fn changed_members(&self, change: &StoreChange) -> BTreeMap<String, Option<Value>> {
        change
            .changed
            .iter()
            .filter(|(key, _)| self.reads(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Changed members per dependency id, for one recomputation.
/// `None` marks a member that was removed.
pub type SourceValues = BTreeMap<String, BTreeMap<String, Option<Value>>>;

/// What the engine passes alongside the dependency values.
pub struct ComputeContext<'a, O> {
    /// The previous result, absent on the first run.
    pub current_value: Option<&'a O>,
    /// Members that changed since the previous result, absent on a full
    /// computation.
    pub source_values: Option<&'a SourceValues>,
}

impl<O> Clone for ComputeContext<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for ComputeContext<'_, O> {}

impl<'a, O> ComputeContext<'a, O> {
    /// Context for a from-scratch computation.
    pub fn full() -> Self {
        Self {
            current_value: None,
            source_values: None,
        }
    }

    /// Changed member keys of one dependency.
    pub fn changed_keys(&self, dependency: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.source_values
            .and_then(|sources| sources.get(dependency))
            .into_iter()
            .flat_map(|changed| changed.keys().map(String::as_str))
    }

    /// Both a previous result and a delta are available.
    pub fn delta(&self) -> Option<(&'a O, &'a SourceValues)> {
        self.current_value.zip(self.source_values)
    }
}

static EMPTY_COLLECTION: BTreeMap<&'static str, &'static Value> = BTreeMap::new();

enum DependencyValue<'a> {
    Collection(BTreeMap<&'a str, &'a Value>),
    Key(Option<&'a Value>),
}

/// Current values of a derivation's dependencies, in declaration order.
/// Missing keys and empty collections read as empty, never as errors.
pub struct DependencyValues<'a> {
    values: Vec<DependencyValue<'a>>,
}

impl<'a> DependencyValues<'a> {
    pub fn from_store(store: &'a Store, dependencies: &[Dependency]) -> Self {
        let values = dependencies
            .iter()
            .map(|dep| match dep {
                Dependency::Collection(prefix) => DependencyValue::Collection(store.collection(prefix)),
                Dependency::Key(key) => DependencyValue::Key(store.get(key)),
            })
            .collect();
        Self { values }
    }

    /// Members of the collection at `index`. Empty if the dependency at
    /// `index` is not a collection.
    pub fn collection(&self, index: usize) -> &BTreeMap<&'a str, &'a Value> {
        match self.values.get(index) {
            Some(DependencyValue::Collection(members)) => members,
            _ => &EMPTY_COLLECTION,
        }
    }

    /// Value of the key at `index`, if present.
    pub fn key(&self, index: usize) -> Option<&'a Value> {
        match self.values.get(index) {
            Some(DependencyValue::Key(value)) => *value,
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A named, pure computation over store dependencies.
///
/// `compute` runs synchronously inside store notification handling and must
/// not panic; treat absent data as empty instead.
pub trait DerivedValue: Send + 'static {
    type Output: Clone + PartialEq + Serialize + Send + 'static;

    fn key(&self) -> &str;

    fn dependencies(&self) -> Vec<Dependency>;

    fn compute(
        &self,
        dependencies: &DependencyValues<'_>,
        context: ComputeContext<'_, Self::Output>,
    ) -> Self::Output;
}

/// Read a string or integer field as a string id.
pub(crate) fn id_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn str_field<'v>(value: &'v Value, field: &str) -> Option<&'v str> {
    value.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dependency_values_read_absent_as_empty() {
        let store = Store::with_default_collections();
        let deps = vec![Dependency::collection("report_"), Dependency::key("session")];
        let values = DependencyValues::from_store(&store, &deps);
        assert_eq!(values.len(), 2);
        assert!(values.collection(0).is_empty());
        assert!(values.key(1).is_none());
        // Mismatched accessors fall back to empty too
        assert!(values.collection(1).is_empty());
        assert!(values.key(0).is_none());
        assert!(values.collection(7).is_empty());
    }

    #[test]
    fn dependency_values_follow_declaration_order() {
        let mut store = Store::with_default_collections();
        store.set("session", json!({"accountID": 1}));
        store.set("report_1", json!({"reportID": "1"}));
        let deps = vec![Dependency::key("session"), Dependency::collection("report_")];
        let values = DependencyValues::from_store(&store, &deps);
        assert_eq!(values.key(0), Some(&json!({"accountID": 1})));
        assert_eq!(values.collection(1).len(), 1);
    }

    #[test]
    fn context_exposes_changed_keys() {
        let mut sources = SourceValues::new();
        sources
            .entry("report_".to_string())
            .or_default()
            .insert("report_1".to_string(), None);
        let current = 5u32;
        let ctx = ComputeContext {
            current_value: Some(&current),
            source_values: Some(&sources),
        };
        assert_eq!(ctx.changed_keys("report_").collect::<Vec<_>>(), vec!["report_1"]);
        assert_eq!(ctx.changed_keys("other_").count(), 0);
        assert!(ctx.delta().is_some());
        assert!(ComputeContext::<u32>::full().delta().is_none());
    }

    #[test]
    fn dependencies_match_by_changed_member() {
        let mut changed = BTreeMap::new();
        changed.insert("report_1".to_string(), Some(json!({"reportID": "1"})));
        // Target is the bare key when the store has no such collection
        let change = StoreChange {
            target: "report_1".to_string(),
            changed,
        };
        assert!(Dependency::collection("report_").matches(&change));
        assert!(Dependency::key("report_1").matches(&change));
        assert!(!Dependency::key("report_2").matches(&change));
        assert!(!Dependency::collection("reportActions_").matches(&change));
        assert!(!Dependency::collection("report_1").matches(&change));
    }

    #[test]
    fn changed_members_keep_only_what_the_dependency_reads() {
        let mut changed = BTreeMap::new();
        changed.insert("report_1".to_string(), Some(json!(1)));
        changed.insert("report_2".to_string(), None);
        let change = StoreChange {
            target: "report_".to_string(),
            changed,
        };
        let members = Dependency::key("report_2").changed_members(&change);
        assert_eq!(members.len(), 1);
        assert_eq!(members.get("report_2"), Some(&None));
        assert_eq!(Dependency::collection("report_").changed_members(&change).len(), 2);
    }

    #[test]
    fn id_field_accepts_strings_and_numbers() {
        let value = json!({"a": "7", "b": 8, "c": "", "d": true});
        assert_eq!(id_field(&value, "a").as_deref(), Some("7"));
        assert_eq!(id_field(&value, "b").as_deref(), Some("8"));
        assert_eq!(id_field(&value, "c"), None);
        assert_eq!(id_field(&value, "d"), None);
        assert_eq!(id_field(&value, "missing"), None);
    }
}
