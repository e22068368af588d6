//! Incremental adapters over keyed mappings.
//!
//! A workspace-sized mapping changes a few keys at a time. These adapters
//! bound per-edit work to the keys actually touched: [`diff_maps`] computes
//! the added/changed/removed delta between successive snapshots,
//! [`Signal::map_entries`] applies exactly that delta to a derived mapping,
//! and [`Signal::join_entries`] resolves a mapping whose values are
//! themselves signals into one signal of the resolved mapping.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::SignalError;
use crate::signal::{Level, Signal, SignalNode, Try, Value};

/// Delta between two mapping snapshots, keyed by stable identity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapDelta<K: Ord, V> {
    /// Keys present only in the current snapshot.
    pub added: BTreeMap<K, V>,
    /// Keys present in both snapshots with unequal values, as
    /// `(previous, current)` pairs.
    pub changed: BTreeMap<K, (V, V)>,
    /// Keys present only in the previous snapshot.
    pub removed: BTreeMap<K, V>,
}

impl<K: Ord, V> MapDelta<K, V> {
    /// Returns true if the snapshots were equal.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compute the added/changed/removed delta between two snapshots.
pub fn diff_maps<K, V>(prev: &BTreeMap<K, V>, curr: &BTreeMap<K, V>) -> MapDelta<K, V>
where
    K: Ord + Clone,
    V: PartialEq + Clone,
{
    let mut delta = MapDelta {
        added: BTreeMap::new(),
        changed: BTreeMap::new(),
        removed: BTreeMap::new(),
    };
    for (key, curr_value) in curr {
        match prev.get(key) {
            None => {
                delta.added.insert(key.clone(), curr_value.clone());
            }
            Some(prev_value) if prev_value != curr_value => {
                delta
                    .changed
                    .insert(key.clone(), (prev_value.clone(), curr_value.clone()));
            }
            Some(_) => {}
        }
    }
    for (key, prev_value) in prev {
        if !curr.contains_key(key) {
            delta.removed.insert(key.clone(), prev_value.clone());
        }
    }
    delta
}

impl<K, V> Signal<BTreeMap<K, V>>
where
    K: Ord + Clone + 'static,
    V: Value,
{
    /// Derived mapping applying `f` per key, recomputing only the keys that
    /// were added or changed since the previous snapshot and dropping the
    /// removed ones. Untouched keys keep their previous output, so a
    /// single-key edit costs one call to `f` regardless of mapping size.
    pub fn map_entries<U: Value>(
        &self,
        f: impl Fn(&K, &V) -> U + 'static,
    ) -> Signal<BTreeMap<K, U>> {
        let prev: RefCell<(BTreeMap<K, V>, BTreeMap<K, U>)> = RefCell::new(Default::default());
        self.map(move |curr| {
            let output = {
                let prev = prev.borrow();
                let delta = diff_maps(&prev.0, curr);
                let mut output = prev.1.clone();
                for key in delta.removed.keys() {
                    output.remove(key);
                }
                for (key, (_, value)) in &delta.changed {
                    output.insert(key.clone(), f(key, value));
                }
                for (key, value) in &delta.added {
                    output.insert(key.clone(), f(key, value));
                }
                output
            };
            *prev.borrow_mut() = (curr.clone(), output.clone());
            output
        })
    }
}

impl<K, V> Signal<BTreeMap<K, Signal<V>>>
where
    K: Ord + Clone + 'static,
    V: Value,
{
    /// Resolve a mapping of signals into one signal of the resolved
    /// mapping.
    ///
    /// The adapter tracks each entry's signal and its last observed
    /// version: while the outer mapping is unchanged, entries are merely
    /// re-reconciled and the output is rebuilt only when some tracked
    /// version moved. Removed keys stop being tracked. Any entry's failure
    /// fails the whole mapping; when several entries fail in the same
    /// pass, the first in key order is reported.
    pub fn join_entries(&self) -> Signal<BTreeMap<K, V>> {
        Signal::from_node(Rc::new(JoinEntriesNode {
            parent: self.clone(),
            state: RefCell::new(JoinEntriesState {
                value: Err(SignalError::Unreconciled),
                version: 0,
                level: 0,
                parent_version: 0,
                entries: BTreeMap::new(),
                versions: BTreeMap::new(),
            }),
        }))
    }
}

struct JoinEntriesState<K: Ord, V> {
    value: Try<BTreeMap<K, V>>,
    version: u64,
    level: Level,
    parent_version: u64,
    entries: BTreeMap<K, Signal<V>>,
    versions: BTreeMap<K, u64>,
}

struct JoinEntriesNode<K: Ord, V> {
    parent: Signal<BTreeMap<K, Signal<V>>>,
    state: RefCell<JoinEntriesState<K, V>>,
}

impl<K, V> JoinEntriesNode<K, V>
where
    K: Ord + Clone + 'static,
    V: Value,
{
    /// Rebuild the resolved mapping from the tracked entries, recording
    /// each entry's version. Fails with the first failing entry.
    fn resolve(entries: &BTreeMap<K, Signal<V>>) -> (Try<BTreeMap<K, V>>, BTreeMap<K, u64>) {
        let versions = entries
            .iter()
            .map(|(key, signal)| (key.clone(), signal.version()))
            .collect();
        let value = entries
            .iter()
            .map(|(key, signal)| signal.value().map(|value| (key.clone(), value)))
            .collect();
        (value, versions)
    }
}

impl<K, V> SignalNode<BTreeMap<K, V>> for JoinEntriesNode<K, V>
where
    K: Ord + Clone + 'static,
    V: Value,
{
    fn reconcile(&self, level: Level) {
        {
            let mut state = self.state.borrow_mut();
            if state.level == level {
                return;
            }
            state.level = level;
        }
        self.parent.reconcile(level);
        let parent_version = self.parent.version();

        if self.state.borrow().parent_version == parent_version {
            // Same key set: re-reconcile the tracked entries and rebuild
            // only if some version moved.
            let entries = self.state.borrow().entries.clone();
            for signal in entries.values() {
                signal.reconcile(level);
            }
            let unchanged = {
                let state = self.state.borrow();
                entries
                    .iter()
                    .all(|(key, signal)| state.versions.get(key) == Some(&signal.version()))
            };
            if unchanged {
                return;
            }
            let (value, versions) = Self::resolve(&entries);
            let mut state = self.state.borrow_mut();
            state.versions = versions;
            if value != state.value {
                state.value = value;
                state.version += 1;
            }
        } else {
            let value;
            let entries;
            let versions;
            match self.parent.value() {
                Ok(mapping) => {
                    for signal in mapping.values() {
                        signal.reconcile(level);
                    }
                    let resolved = Self::resolve(&mapping);
                    value = resolved.0;
                    versions = resolved.1;
                    entries = mapping;
                }
                Err(err) => {
                    value = Err(err);
                    entries = BTreeMap::new();
                    versions = BTreeMap::new();
                }
            }
            let mut state = self.state.borrow_mut();
            state.parent_version = parent_version;
            state.entries = entries;
            state.versions = versions;
            if value != state.value {
                state.value = value;
                state.version += 1;
            }
        }
    }

    fn value(&self) -> Try<BTreeMap<K, V>> {
        self.state.borrow().value.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().version
    }
}
