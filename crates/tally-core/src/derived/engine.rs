use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, error, info};

use super::{ComputeContext, Dependency, DependencyValues, DerivedValue, SourceValues};
use crate::config::DerivedConfig;
use crate::error::{DeriveError, DeriveResult, StoreResult};
use crate::metrics::Metrics;
use crate::store::{keys, Store, StoreChange, Subscription};

/// Lifecycle of one derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedState {
    Uninitialized,
    Computed,
}

/// Type-erased registered derivation.
trait Derivation: Send {
    fn key(&self) -> &str;
    fn dependencies(&self) -> &[Dependency];
    fn state(&self) -> DerivedState;
    /// Recompute and return the serialized result if it differs from the
    /// previous one.
    fn recompute(
        &mut self,
        store: &Store,
        sources: Option<&SourceValues>,
    ) -> StoreResult<Option<Value>>;
    fn reset(&mut self);
    fn as_any(&self) -> &dyn Any;
}

struct Slot<D: DerivedValue> {
    config: D,
    key: String,
    dependencies: Vec<Dependency>,
    current: Option<D::Output>,
}

impl<D: DerivedValue> Derivation for Slot<D> {
    fn key(&self) -> &str {
        &self.key
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn state(&self) -> DerivedState {
        if self.current.is_some() {
            DerivedState::Computed
        } else {
            DerivedState::Uninitialized
        }
    }

    fn recompute(
        &mut self,
        store: &Store,
        sources: Option<&SourceValues>,
    ) -> StoreResult<Option<Value>> {
        let next = {
            let values = DependencyValues::from_store(store, &self.dependencies);
            let context = ComputeContext {
                current_value: self.current.as_ref(),
                source_values: sources,
            };
            self.config.compute(&values, context)
        };

        if self.current.as_ref() == Some(&next) {
            return Ok(None);
        }
        let json = serde_json::to_value(&next)?;
        // Replaced in one assignment; readers never see a partial result.
        self.current = Some(next);
        Ok(Some(json))
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Keeps registered derived values consistent with the store.
///
/// The engine is an ordinary store subscriber. `process` drains pending
/// store changes, recomputes each affected derivation once per round with
/// the accumulated delta, and writes changed results back under
/// `derived_{key}`. Those write-backs may feed other derivations, so
/// processing repeats until the store is quiet or the round limit is hit.
///
/// Single-threaded: a derivation always finishes before the next change
/// for it is looked at.
///
/// A failed computation resets that derivation, and every one still waiting
/// in the same round, to `Uninitialized`. The next `process` recomputes them
/// in full before handling new changes.
pub struct DerivedValueEngine {
    slots: Vec<Box<dyn Derivation>>,
    index: HashMap<String, usize>,
    stale: BTreeSet<usize>,
    subscription: Option<Subscription<StoreChange>>,
    max_rounds: u32,
    metrics: Option<Metrics>,
}

impl DerivedValueEngine {
    pub fn new(config: &DerivedConfig) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            stale: BTreeSet::new(),
            subscription: None,
            max_rounds: config.max_propagation_rounds.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a derivation. It stays `Uninitialized` until the next `init`.
    pub fn register<D: DerivedValue>(&mut self, config: D) -> DeriveResult<()> {
        let key = config.key().to_string();
        if self.index.contains_key(&key) {
            return Err(DeriveError::DuplicateKey(key));
        }
        let dependencies = config.dependencies();
        if dependencies.is_empty() {
            return Err(DeriveError::NoDependencies(key));
        }

        debug!(%key, dependencies = ?dependencies, "derived value registered");
        self.index.insert(key.clone(), self.slots.len());
        self.slots.push(Box::new(Slot {
            config,
            key,
            dependencies,
            current: None,
        }));
        Ok(())
    }

    /// Subscribe to `store` (first call only), fully compute every
    /// uninitialized derivation, then settle any cascades.
    #[tracing::instrument(skip_all, fields(derivations = self.slots.len()))]
    pub fn init(&mut self, store: &mut Store) -> DeriveResult<()> {
        if self.subscription.is_none() {
            self.subscription = Some(store.subscribe());
        }

        for i in 0..self.slots.len() {
            if self.slots[i].state() == DerivedState::Uninitialized {
                if let Err(e) = self.run(i, store, None) {
                    self.mark_stale(&[i]);
                    return Err(e);
                }
                self.stale.remove(&i);
            }
        }

        self.process(store)?;
        info!(derivations = self.slots.len(), "derived values initialized");
        Ok(())
    }

    /// Recompute derivations affected by pending store changes. Returns the
    /// number of computations run.
    #[tracing::instrument(skip_all)]
    pub fn process(&mut self, store: &mut Store) -> DeriveResult<usize> {
        if self.subscription.is_none() {
            return Ok(0);
        }
        let mut computed = self.recover(store)?;

        for _ in 0..self.max_rounds {
            let events = match &self.subscription {
                Some(subscription) => subscription.drain(),
                None => return Ok(computed),
            };
            if events.is_empty() {
                return Ok(computed);
            }

            let pending: Vec<(usize, SourceValues)> =
                self.collect_sources(&events).into_iter().collect();
            for (n, (i, sources)) in pending.iter().enumerate() {
                if let Err(e) = self.run(*i, store, Some(sources)) {
                    let unfinished: Vec<usize> = pending[n..].iter().map(|(j, _)| *j).collect();
                    self.mark_stale(&unfinished);
                    return Err(e);
                }
                computed += 1;
            }
        }

        let quiet = self
            .subscription
            .as_ref()
            .map_or(true, Subscription::is_empty);
        if quiet {
            return Ok(computed);
        }
        error!(
            rounds = self.max_rounds,
            "derived values did not settle, dependency cycle?"
        );
        Err(DeriveError::PropagationLimit {
            rounds: self.max_rounds,
        })
    }

    /// Full recompute of derivations a failed round left behind.
    fn recover(&mut self, store: &mut Store) -> DeriveResult<usize> {
        let mut computed = 0;
        while let Some(i) = self.stale.pop_first() {
            if let Err(e) = self.run(i, store, None) {
                self.stale.insert(i);
                return Err(e);
            }
            info!(key = %self.slots[i].key(), "derived value recovered");
            computed += 1;
        }
        Ok(computed)
    }

    fn mark_stale(&mut self, slots: &[usize]) {
        for &i in slots {
            self.slots[i].reset();
            self.stale.insert(i);
        }
        let keys: Vec<&str> = slots.iter().map(|&i| self.slots[i].key()).collect();
        error!(?keys, "derived value computation failed, marked for full recompute");
    }

    /// Merge changes into one delta per affected, already computed
    /// derivation, in registration order.
    fn collect_sources(&self, events: &[StoreChange]) -> BTreeMap<usize, SourceValues> {
        let mut pending: BTreeMap<usize, SourceValues> = BTreeMap::new();
        for event in events {
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.state() != DerivedState::Computed {
                    continue;
                }
                for dep in slot.dependencies() {
                    let members = dep.changed_members(event);
                    if members.is_empty() {
                        continue;
                    }
                    pending
                        .entry(i)
                        .or_default()
                        .entry(dep.id().to_string())
                        .or_default()
                        .extend(members);
                }
            }
        }
        pending
    }

    fn run(
        &mut self,
        i: usize,
        store: &mut Store,
        sources: Option<&SourceValues>,
    ) -> DeriveResult<()> {
        let slot = &mut self.slots[i];
        let changed = slot.recompute(store, sources)?;
        let key = slot.key().to_string();

        if let Some(metrics) = &self.metrics {
            metrics.record_recompute(&key, sources.is_some());
        }
        debug!(
            %key,
            mode = if sources.is_some() { "delta" } else { "full" },
            changed = changed.is_some(),
            "derived value computed"
        );

        if let Some(value) = changed {
            store.set(&keys::derived_key(&key), value);
        }
        Ok(())
    }

    /// Typed read of a derived value.
    pub fn get<D: DerivedValue>(&self, key: &str) -> Option<&D::Output> {
        let slot = self.slots.get(*self.index.get(key)?)?;
        slot.as_any()
            .downcast_ref::<Slot<D>>()?
            .current
            .as_ref()
    }

    pub fn state(&self, key: &str) -> Option<DerivedState> {
        let i = *self.index.get(key)?;
        Some(self.slots[i].state())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.key())
    }

    /// Unsubscribe from `store` and forget all results. Registrations are
    /// kept; a later `init` recomputes everything from scratch.
    pub fn teardown(&mut self, store: &mut Store) {
        if let Some(subscription) = self.subscription.take() {
            store.unsubscribe(subscription.id());
        }
        for slot in &mut self.slots {
            slot.reset();
        }
        self.stale.clear();
        info!("derived values torn down");
    }
}
