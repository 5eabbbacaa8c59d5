//! The in-memory keyed store (`Cache`) and the delta-recording wrapper around it
//! (`ChangeAwareCache`) that every operator builds its state on top of.

use std::{
    collections::HashMap,
    hash::Hash,
};

use crate::change::{Change, ChangeReason, ChangeSet};

/// A mutable map from `K` to `V` with no change tracking. The building block every operator's
/// shadow state and every source cache is built from.
#[derive(Debug, Clone)]
pub struct Cache<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// An empty cache.
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Inserts or overwrites the value for `key`, returning the previous value, if any.
    pub fn add_or_update(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Removes `key`, returning its value, if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    /// Looks up the value for `key`.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The number of entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(key, value)` pairs. Insertion order is not observable.
    pub fn key_values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Iterates over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Applies every change in `changes` to this cache, in order, using the same mutation rules
    /// as `add_or_update`/`remove`/`refresh`. Lets a pipeline stage "replay" an upstream change
    /// set into a local cache.
    pub fn clone_from_change_set(&mut self, changes: &ChangeSet<K, V>)
    where
        V: Clone,
    {
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    self.add_or_update(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.remove(change.key());
                }
                ChangeReason::Moved => {}
            }
        }
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A pending per-key delta recorded by a [`ChangeAwareCache`] between two calls to
/// `capture_changes`.
#[derive(Clone)]
enum Pending<V> {
    Add(V),
    Update { current: V, original_previous: V },
    Remove(V),
    Refresh(V),
}

/// A [`Cache`] that additionally records each mutation as a pending change and can atomically
/// drain the accumulated deltas as a [`ChangeSet`].
///
/// The coalescing rules below guarantee that a downstream observer never sees an intermediate
/// state that no longer exists in the cache by the time `capture_changes` runs.
pub struct ChangeAwareCache<K, V> {
    cache: Cache<K, V>,
    pending: HashMap<K, Pending<V>>,
    /// First-touch order of keys in the current capture cycle, so `capture_changes` is
    /// deterministic even though the backing map is not ordered.
    touch_order: Vec<K>,
}

impl<K, V> ChangeAwareCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// An empty cache-aware cache.
    pub fn new() -> Self {
        Self { cache: Cache::new(), pending: HashMap::new(), touch_order: Vec::new() }
    }

    /// A read-only view of the underlying cache.
    pub fn cache(&self) -> &Cache<K, V> {
        &self.cache
    }

    /// Looks up the value for `key`.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.cache.lookup(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// The number of entries.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Iterates over `(key, value)` pairs.
    pub fn key_values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.cache.key_values()
    }

    /// Iterates over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.cache.keys()
    }

    fn touch(&mut self, key: &K) {
        if !self.pending.contains_key(key) {
            self.touch_order.push(key.clone());
        }
    }

    /// Inserts or overwrites the value for `key`, recording a normalized pending change.
    pub fn add_or_update(&mut self, key: K, value: V)
    where
        V: Clone,
    {
        self.touch(&key);
        let previous_in_cache = self.cache.lookup(&key).cloned();
        self.cache.add_or_update(key.clone(), value.clone());

        let next = match self.pending.remove(&key) {
            None => match previous_in_cache {
                Some(prev) => Pending::Update { current: value, original_previous: prev },
                None => Pending::Add(value),
            },
            Some(Pending::Add(_)) => Pending::Add(value),
            Some(Pending::Update { original_previous, .. }) => {
                Pending::Update { current: value, original_previous }
            }
            Some(Pending::Remove(removed)) => Pending::Update { current: value, original_previous: removed },
            Some(Pending::Refresh(previous)) => Pending::Update { current: value, original_previous: previous },
        };
        self.pending.insert(key, next);
    }

    /// Removes `key`, recording a normalized pending change. No-op if `key` was not present and
    /// had no pending `Add`.
    pub fn remove(&mut self, key: &K)
    where
        V: Clone,
    {
        let Some(removed) = self.cache.remove(key) else {
            return;
        };
        self.touch(key);

        match self.pending.remove(key) {
            None => {
                self.pending.insert(key.clone(), Pending::Remove(removed));
            }
            Some(Pending::Add(_)) => {
                // the add/remove cancel out; nothing to report downstream.
            }
            Some(Pending::Update { original_previous, .. }) => {
                self.pending.insert(key.clone(), Pending::Remove(original_previous));
            }
            Some(Pending::Remove(original)) => {
                // already removed and recorded; restore it (defensive — should not happen since
                // `self.cache.remove` above would have returned `None` the second time).
                self.pending.insert(key.clone(), Pending::Remove(original));
            }
            Some(Pending::Refresh(previous)) => {
                self.pending.insert(key.clone(), Pending::Remove(previous));
            }
        }
    }

    /// Records a `Refresh` hint for `key`: appended only if no pending change already exists for
    /// the key, and only if the key is currently present.
    pub fn refresh(&mut self, key: &K)
    where
        V: Clone,
    {
        if self.pending.contains_key(key) {
            return;
        }
        let Some(current) = self.cache.lookup(key).cloned() else {
            return;
        };
        self.touch(key);
        self.pending.insert(key.clone(), Pending::Refresh(current));
    }

    /// Removes every entry, recording a `Remove` for each previously-present key.
    pub fn clear(&mut self)
    where
        V: Clone,
    {
        let keys: Vec<K> = self.cache.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Applies every change in `changes`, in order, via the same mutation rules, so a pipeline
    /// stage can replay an upstream change set into a local cache while still recording deltas.
    pub fn clone_from_change_set(&mut self, changes: &ChangeSet<K, V>)
    where
        V: Clone,
    {
        for change in changes.iter() {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(change.key().clone(), change.current().clone());
                }
                ChangeReason::Refresh => {
                    self.refresh(change.key());
                }
                ChangeReason::Remove => {
                    self.remove(change.key());
                }
                ChangeReason::Moved => {}
            }
        }
    }

    /// Atomically drains every pending change and returns it as a [`ChangeSet`], in first-touch
    /// order. After this call the pending buffer is empty.
    pub fn capture_changes(&mut self) -> ChangeSet<K, V> {
        let touch_order = std::mem::take(&mut self.touch_order);
        let mut out = Vec::with_capacity(touch_order.len());
        for key in touch_order {
            let Some(pending) = self.pending.remove(&key) else { continue };
            let change = match pending {
                Pending::Add(v) => Change::add(key, v),
                Pending::Update { current, original_previous } => Change::update(key, current, original_previous),
                Pending::Remove(v) => Change::remove(key, v),
                Pending::Refresh(v) => Change::refresh(key, v),
            };
            out.push(change);
        }
        debug_assert!(self.pending.is_empty());
        #[cfg(feature = "tracing-unstable")]
        if !out.is_empty() {
            tracing::trace!(changes = out.len(), "captured pending changes");
        }
        ChangeSet::new(out)
    }
}

impl<K, V> Default for ChangeAwareCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn captured(cache: &mut ChangeAwareCache<i32, &'static str>) -> Vec<(i32, ChangeReason)> {
        cache.capture_changes().iter().map(|c| (*c.key(), c.reason())).collect()
    }

    #[test]
    fn add_then_update_coalesces_to_add() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.add_or_update(1, "b");
        assert_eq!(captured(&mut cache), vec![(1, ChangeReason::Add)]);
        assert_eq!(cache.lookup(&1), Some(&"b"));
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.remove(&1);
        assert!(captured(&mut cache).is_empty());
        assert!(cache.lookup(&1).is_none());
    }

    #[test]
    fn update_then_remove_reports_original_previous() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.capture_changes();
        cache.add_or_update(1, "b");
        cache.remove(&1);
        let set = cache.capture_changes();
        assert_eq!(set.len(), 1);
        let change = set.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Remove);
        assert_eq!(change.current(), &"a");
    }

    #[test]
    fn remove_then_add_is_an_update() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.capture_changes();
        cache.remove(&1);
        cache.add_or_update(1, "b");
        let set = cache.capture_changes();
        let change = set.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Update);
        assert_eq!(change.current(), &"b");
        assert_eq!(change.previous(), Some(&"a"));
    }

    #[test]
    fn refresh_is_dropped_if_another_change_is_pending() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.capture_changes();
        cache.add_or_update(1, "b");
        cache.refresh(&1);
        let set = cache.capture_changes();
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().reason(), ChangeReason::Update);
    }

    #[test]
    fn refresh_on_present_key_with_no_pending_change_captures_as_refresh() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(1, "a");
        cache.capture_changes();
        cache.refresh(&1);
        let set = cache.capture_changes();
        assert_eq!(set.len(), 1);
        let change = set.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Refresh);
        assert_eq!(change.current(), &"a");
    }

    #[test]
    fn refresh_on_absent_key_is_ignored() {
        let mut cache: ChangeAwareCache<i32, &str> = ChangeAwareCache::new();
        cache.refresh(&1);
        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn capture_changes_preserves_first_touch_order() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update(2, "b");
        cache.add_or_update(1, "a");
        cache.add_or_update(2, "b2");
        let set = cache.capture_changes();
        let keys: Vec<_> = set.iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![2, 1]);
    }

    #[test]
    fn clone_from_change_set_replays_mutations() {
        let mut upstream = ChangeAwareCache::new();
        upstream.add_or_update(1, "a");
        let set = upstream.capture_changes();

        let mut downstream = ChangeAwareCache::new();
        downstream.clone_from_change_set(&set);
        assert_eq!(downstream.lookup(&1), Some(&"a"));
    }
}
