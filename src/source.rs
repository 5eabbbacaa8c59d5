//! The root of every pipeline: a cache with an edit API and an observable stream of the
//! change sets that edits produce.

use std::{fmt, hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::ChangeAwareCache,
    change::ChangeSet,
    error::{Error, Result},
    observable::{snapshot_then_live, Broadcaster, Event, Subscription},
    sync::Gate,
};

type KeySelector<K, V> = dyn Fn(&V) -> K + Send + Sync;

/// A root keyed cache. Mutations go through [`SourceCache::edit`]; the resulting change sets are
/// published to every live [`SourceCache::connect`] subscription and to the preview channel.
///
/// Edits are serialized by a single writer lock (the operator gate): concurrent calls to `edit`
/// from different tasks block on each other rather than interleave. There is no separate
/// "nested edit" API — the [`CacheUpdater`] handed to the closure already exposes every mutation
/// method directly, so composing several logical edits into one published batch is just calling
/// more of those methods on the one updater you were given. A second, genuinely independent call
/// to `edit` (from another task holding a clone of this `SourceCache`) correctly queues on the
/// writer lock instead of silently interleaving with the first.
pub struct SourceCache<K, V> {
    gate: Gate<ChangeAwareCache<K, V>>,
    changes: Broadcaster<ChangeSet<K, V>>,
    preview: Broadcaster<ChangeSet<K, V>>,
    key_selector: Option<Arc<KeySelector<K, V>>>,
}

impl<K, V> fmt::Debug for SourceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCache").finish_non_exhaustive()
    }
}

impl<K, V> SourceCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// An empty source cache with no key selector configured. `add_or_update` calls in `edit`
    /// that don't supply an explicit key will fail with [`Error::key_selector_missing`].
    pub fn new() -> Self {
        Self {
            gate: Gate::new(ChangeAwareCache::new()),
            changes: Broadcaster::new(64),
            preview: Broadcaster::new(16),
            key_selector: None,
        }
    }

    /// A source cache that derives a value's key via `key_selector` whenever `edit` callers add
    /// or remove by value rather than by explicit key.
    pub fn with_key_selector(key_selector: impl Fn(&V) -> K + Send + Sync + 'static) -> Self {
        Self {
            gate: Gate::new(ChangeAwareCache::new()),
            changes: Broadcaster::new(64),
            preview: Broadcaster::new(16),
            key_selector: Some(Arc::new(key_selector)),
        }
    }

    /// Applies `f` to a [`CacheUpdater`] view of the underlying cache, then — if and only if the
    /// edit produced at least one change — publishes it to the preview channel followed by the
    /// live change-set channel, atomically with respect to every other call to `edit` and to
    /// every concurrent `connect` subscription's initial snapshot.
    pub fn edit<R>(&self, f: impl FnOnce(&mut CacheUpdater<'_, K, V>) -> R) -> R {
        let key_selector = self.key_selector.clone();
        self.gate.with(|cache| {
            let mut updater = CacheUpdater { cache: &mut *cache, key_selector: key_selector.as_deref() };
            let result = f(&mut updater);
            let produced = cache.capture_changes();
            if !produced.is_empty() {
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(changes = produced.len(), "source cache edit produced changes");
                self.preview.publish(produced.clone());
                self.changes.publish(produced);
            }
            result
        })
    }

    /// Looks up the value for `key` under the writer lock, observing a consistent snapshot.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.gate.with(|cache| cache.lookup(key).cloned())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.gate.with(|cache| cache.contains_key(key))
    }

    /// The number of entries.
    pub fn count(&self) -> usize {
        self.gate.with(|cache| cache.count())
    }

    /// A snapshot of the current keys.
    pub fn keys(&self) -> Vec<K> {
        self.gate.with(|cache| cache.keys().cloned().collect())
    }

    /// The exact change set each `edit` is about to publish, observed before subscribers of
    /// [`SourceCache::connect`] see it. Does not receive the synthetic initial snapshot.
    pub fn preview(&self) -> Subscription<ChangeSet<K, V>> {
        Subscription::new(self.preview.subscribe_stream())
    }

    /// Subscribes to this cache: the returned stream first emits a synthetic initial change set
    /// (every current entry as `Add`, filtered by `predicate` if supplied), then forwards
    /// subsequently published live change sets, dropping empty ones if `suppress_empty` is set.
    pub fn connect(
        &self,
        predicate: Option<Arc<dyn Fn(&K, &V) -> bool + Send + Sync>>,
        suppress_empty: bool,
    ) -> Subscription<ChangeSet<K, V>> {
        let (initial, live) = self.gate.with(|cache| {
            let initial: ChangeSet<K, V> = cache
                .key_values()
                .filter(|&(k, v)| predicate.as_ref().is_none_or(|p| p(k, v)))
                .map(|(k, v)| crate::change::Change::add(k.clone(), v.clone()))
                .collect();
            (initial, self.changes.subscribe_stream())
        });

        let live: std::pin::Pin<Box<dyn futures_core::Stream<Item = Event<ChangeSet<K, V>>> + Send>> =
            if suppress_empty {
                Box::pin(live.filter(|event| {
                    let keep = !matches!(event, Event::Next(cs) if cs.is_empty());
                    async move { keep }
                }))
            } else {
                live
            };

        Subscription::new(snapshot_then_live(initial, live))
    }
}

impl<K, V> Default for SourceCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The mutation surface an `edit` closure receives. Every method here updates the cache and
/// records a normalized pending change in the same step, per [`ChangeAwareCache`]'s coalescing
/// rules — `edit` captures and publishes them once the closure returns.
pub struct CacheUpdater<'a, K, V> {
    cache: &'a mut ChangeAwareCache<K, V>,
    key_selector: Option<&'a KeySelector<K, V>>,
}

impl<'a, K, V> CacheUpdater<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Inserts or overwrites `value` at the explicit `key`.
    pub fn add_or_update(&mut self, key: K, value: V) {
        self.cache.add_or_update(key, value);
    }

    /// Inserts or overwrites `value`, deriving its key from the configured key selector.
    /// Fails with [`Error::key_selector_missing`] if no selector was configured.
    pub fn add_or_update_keyed(&mut self, value: V) -> Result<()> {
        let key = self.get_key(&value)?;
        self.cache.add_or_update(key, value);
        Ok(())
    }

    /// Removes the entry at `key`.
    pub fn remove(&mut self, key: &K) {
        self.cache.remove(key);
    }

    /// Removes the entry whose key the configured key selector derives from `value`.
    pub fn remove_value(&mut self, value: &V) -> Result<()> {
        let key = self.get_key(value)?;
        self.cache.remove(&key);
        Ok(())
    }

    /// Removes every key in `keys`.
    pub fn remove_many<I: IntoIterator<Item = K>>(&mut self, keys: I) {
        for key in keys {
            self.cache.remove(&key);
        }
    }

    /// Records a `Refresh` hint for `key`: a no-op if the key is absent or already has another
    /// pending change this edit.
    pub fn refresh(&mut self, key: &K) {
        self.cache.refresh(key);
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Replays an externally-produced change set into this cache, using the same mutation rules
    /// as every other method here.
    pub fn clone_from_change_set(&mut self, changes: &ChangeSet<K, V>) {
        self.cache.clone_from_change_set(changes);
    }

    /// Looks up the current value for `key`, including mutations made earlier in this same edit.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.cache.lookup(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// The number of entries, including mutations made earlier in this same edit.
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

    /// Derives the key for `value` via the configured key selector.
    pub fn get_key(&self, value: &V) -> Result<K> {
        self.key_selector.map(|selector| selector(value)).ok_or_else(Error::key_selector_missing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;

    use super::*;
    use crate::{change::ChangeReason, observable::test_support::collect};

    #[tokio::test]
    async fn connect_emits_initial_snapshot_then_live_changes() {
        let source: SourceCache<i32, &'static str> = SourceCache::new();
        source.edit(|u| u.add_or_update(1, "a"));

        let sub = source.connect(None, false);
        source.edit(|u| u.add_or_update(2, "b"));

        let sets = collect(sub, 2).await;
        assert_eq!(sets[0].len(), 1);
        assert_eq!(sets[0].iter().next().unwrap().reason(), ChangeReason::Add);
        assert_eq!(*sets[0].iter().next().unwrap().key(), 1);
        assert_eq!(*sets[1].iter().next().unwrap().key(), 2);
    }

    #[tokio::test]
    async fn connect_filters_initial_snapshot_by_predicate() {
        let source: SourceCache<i32, i32> = SourceCache::new();
        source.edit(|u| {
            u.add_or_update(1, 3);
            u.add_or_update(2, 10);
        });

        let predicate: Arc<dyn Fn(&i32, &i32) -> bool + Send + Sync> = Arc::new(|_, v| *v < 5);
        let mut sub = source.connect(Some(predicate), false);
        let initial = sub.next().await.unwrap().next().unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(*initial.iter().next().unwrap().key(), 1);
    }

    #[tokio::test]
    async fn suppress_empty_drops_empty_live_batches() {
        let source: SourceCache<i32, i32> = SourceCache::new();
        let mut sub = source.connect(None, true);
        let _ = sub.next().await; // initial empty snapshot still delivered once

        // An edit with no net effect publishes nothing (capture_changes is empty), so no event
        // should arrive at all; assert indirectly via a subsequent real edit being the very next
        // item received.
        source.edit(|u| {
            u.add_or_update(1, 1);
            u.remove(&1);
        });
        source.edit(|u| u.add_or_update(2, 2));

        let next = sub.next().await.unwrap().next().unwrap();
        assert_eq!(*next.iter().next().unwrap().key(), 2);
    }

    #[tokio::test]
    async fn add_or_update_keyed_fails_without_key_selector() {
        let source: SourceCache<i32, i32> = SourceCache::new();
        let result = source.edit(|u| u.add_or_update_keyed(5));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn with_key_selector_derives_keys() {
        let source: SourceCache<i32, i32> = SourceCache::with_key_selector(|v| *v);
        source.edit(|u| u.add_or_update_keyed(5).unwrap());
        assert_eq!(source.lookup(&5), Some(5));
    }

    #[tokio::test]
    async fn preview_observes_the_same_batch_as_the_live_channel() {
        let source: SourceCache<i32, &'static str> = SourceCache::new();
        let mut preview = source.preview();
        source.edit(|u| u.add_or_update(1, "a"));
        let previewed = preview.next().await.unwrap().next().unwrap();
        assert_eq!(previewed.len(), 1);
        assert_eq!(*previewed.iter().next().unwrap().key(), 1);
    }
}
