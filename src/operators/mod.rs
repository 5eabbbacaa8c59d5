//! The operator algebra: each submodule is one composable transformation from an upstream
//! change-set stream to a downstream one, built on the same shadow-cache-plus-broadcaster shape
//! as [`crate::source::SourceCache`] so that subscribing to any operator, at any point in a
//! pipeline, yields the same "synthetic snapshot then live changes" contract.

pub mod combine;
pub mod dispose_many;
pub mod expire;
pub mod filter;
pub mod group;
pub mod join;
pub mod merge_many;
pub mod sort;
pub mod transform;
pub mod transform_many;
pub mod tree;

use std::hash::Hash;

use crate::{
    cache::Cache,
    change::{Change, ChangeSet},
    observable::{snapshot_then_live, Broadcaster, Subscription},
    source::SourceCache,
    sync::Gate,
};

/// Anything that can be subscribed to for a stream of `ChangeSet<K, V>` — a [`SourceCache`] or
/// the output of another operator. Operators are generic over this rather than over a concrete
/// upstream type, so they compose without caring whether their input is a root cache or three
/// operators deep.
pub trait ChangeStream<K, V>: Send + Sync {
    /// Subscribes, receiving a synthetic initial snapshot followed by live change sets.
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>>;
}

impl<K, V> ChangeStream<K, V> for SourceCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.connect(None, false)
    }
}

/// The shadow state and multicast hub shared by every operator: a gate-guarded [`Cache`] mirror
/// of what the operator has published downstream, plus the broadcaster fresh subscribers replay
/// a snapshot of that mirror from. An operator's background task is the only writer; publishing
/// a batch and updating the mirror happen together so a subscription racing a live emission can
/// never observe the mirror and the broadcast stream disagree.
pub(crate) struct Downstream<K, V> {
    mirror: Gate<Cache<K, V>>,
    changes: Broadcaster<ChangeSet<K, V>>,
}

impl<K, V> Downstream<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self { mirror: Gate::new(Cache::new()), changes: Broadcaster::new(64) }
    }

    /// Applies `batch` to the shadow mirror and publishes it, unless it is empty.
    pub(crate) fn publish(&self, batch: ChangeSet<K, V>) {
        if batch.is_empty() {
            return;
        }
        #[cfg(feature = "tracing-unstable")]
        tracing::trace!(changes = batch.len(), "publishing operator batch");
        self.mirror.with(|cache| cache.clone_from_change_set(&batch));
        self.changes.publish(batch);
    }

    pub(crate) fn fail(&self, error: crate::error::Error) {
        #[cfg(feature = "tracing-unstable")]
        tracing::warn!(%error, "operator stream failed");
        self.changes.fail(error);
    }

    pub(crate) fn complete(&self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!("operator stream completed");
        self.changes.complete();
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.mirror.with(|cache| cache.contains_key(key))
    }

    pub(crate) fn lookup(&self, key: &K) -> Option<V> {
        self.mirror.with(|cache| cache.lookup(key).cloned())
    }

    pub(crate) fn subscribe(&self) -> Subscription<ChangeSet<K, V>> {
        let (initial, live) = (
            self.mirror.with(|cache| {
                cache.key_values().map(|(k, v)| Change::add(k.clone(), v.clone())).collect::<ChangeSet<K, V>>()
            }),
            self.changes.subscribe_stream(),
        );
        Subscription::new(snapshot_then_live(initial, live))
    }

    /// A snapshot of the current mirrored entries, for operators whose own processing needs to
    /// consult "what has downstream already seen" (e.g. the dynamic filter's full re-evaluation).
    pub(crate) fn snapshot(&self) -> Vec<(K, V)> {
        self.mirror.with(|cache| cache.key_values().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
