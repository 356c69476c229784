use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::TallyConfig;
use crate::derived::{
    DerivedValue, DerivedValueEngine, ReportMetadataDerivation, ReportViolationsDerivation,
};
use crate::error::{DeriveError, DeriveResult};
use crate::metrics::Metrics;
use crate::store::{Store, StoreChange, StoreUpdate, Subscription};

/// The client's store together with the engine keeping its derived values
/// current. Every write runs the engine before returning, so derived values
/// are never observed out of date.
pub struct ClientState {
    store: Store,
    engine: DerivedValueEngine,
}

impl ClientState {
    /// Store with the standard collections and both report derivations.
    pub fn new(config: &TallyConfig) -> DeriveResult<Self> {
        let mut engine = DerivedValueEngine::new(&config.derived).with_metrics(Metrics::new());
        engine.register(ReportMetadataDerivation)?;
        engine.register(ReportViolationsDerivation)?;
        Self::with_engine(Store::with_default_collections(), engine)
    }

    /// Wrap an existing store and engine. Initializes the engine.
    pub fn with_engine(mut store: Store, mut engine: DerivedValueEngine) -> DeriveResult<Self> {
        engine.init(&mut store)?;
        Ok(Self { store, engine })
    }

    /// Register another derivation and compute it immediately.
    pub fn register<D: DerivedValue>(&mut self, config: D) -> DeriveResult<()> {
        self.engine.register(config)?;
        self.engine.init(&mut self.store)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn engine(&self) -> &DerivedValueEngine {
        &self.engine
    }

    pub fn derived<D: DerivedValue>(&self, key: &str) -> Option<&D::Output> {
        self.engine.get::<D>(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.store.get(key)
    }

    pub fn subscribe_to(&mut self, target: &str) -> Subscription<StoreChange> {
        self.store.subscribe_to(target)
    }

    pub fn set(&mut self, key: &str, value: Value) -> DeriveResult<bool> {
        let changed = self.store.set(key, value);
        self.settle()?;
        Ok(changed)
    }

    pub fn merge(&mut self, key: &str, patch: &Value) -> DeriveResult<bool> {
        let changed = self.store.merge(key, patch);
        self.settle()?;
        Ok(changed)
    }

    pub fn merge_collection(
        &mut self,
        prefix: &str,
        entries: &BTreeMap<String, Value>,
    ) -> DeriveResult<usize> {
        let changed = self.store.merge_collection(prefix, entries)?;
        self.settle()?;
        Ok(changed)
    }

    pub fn remove(&mut self, key: &str) -> DeriveResult<bool> {
        let changed = self.store.remove(key);
        self.settle()?;
        Ok(changed)
    }

    pub fn apply(&mut self, update: &StoreUpdate) -> DeriveResult<()> {
        self.store.apply(update)?;
        self.settle()
    }

    /// Apply every update, then recompute once.
    pub fn apply_all(&mut self, updates: &[StoreUpdate]) -> DeriveResult<()> {
        let applied = self.store.apply_all(updates).map_err(DeriveError::from);
        // Recompute whatever did land before reporting a failed update
        self.settle()?;
        applied
    }

    pub fn teardown(&mut self) {
        self.engine.teardown(&mut self.store);
    }

    fn settle(&mut self) -> DeriveResult<()> {
        self.engine.process(&mut self.store).map(|_| ())
    }
}
