//! Combines the destination observables produced per source entry into a single destination
//! stream, picking one "best" candidate value per destination key across every entry that
//! currently contributes to it.

use std::{cmp::Ordering, collections::HashMap, hash::Hash, sync::Arc};

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
    sync::Gate,
};

/// Orders two candidate values for the same destination key; the least under this ordering wins.
pub type Comparator<V2> = Arc<dyn Fn(&V2, &V2) -> Ordering + Send + Sync>;

/// Decides whether a re-selected value counts as "changed" for emission purposes. Defaults to
/// "always different" when not supplied, so every re-selection emits.
pub type EqComparator<V2> = Arc<dyn Fn(&V2, &V2) -> bool + Send + Sync>;

struct Candidate<K, V2> {
    source: K,
    value: V2,
}

struct MergeState<K, K2, V2> {
    candidates: HashMap<K2, Vec<Candidate<K, V2>>>,
    contributed: HashMap<K, Vec<K2>>,
    subscriptions: HashMap<K, TaskHandle<()>>,
    nested_sources: HashMap<K, Arc<dyn ChangeStream<K2, V2>>>,
}

impl<K, K2, V2> MergeState<K, K2, V2>
where
    K: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            candidates: HashMap::new(),
            contributed: HashMap::new(),
            subscriptions: HashMap::new(),
            nested_sources: HashMap::new(),
        }
    }
}

enum MergeEvent<K, K2, V2> {
    Changes(K, ChangeSet<K2, V2>),
}

fn upsert_candidate<K, K2, V2>(state: &mut MergeState<K, K2, V2>, source: &K, dest_key: K2, value: V2)
where
    K: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
{
    let candidates = state.candidates.entry(dest_key).or_default();
    if let Some(existing) = candidates.iter_mut().find(|c| &c.source == source) {
        existing.value = value;
    } else {
        candidates.push(Candidate { source: source.clone(), value });
    }
}

fn remove_candidate<K, K2, V2>(state: &mut MergeState<K, K2, V2>, source: &K, dest_key: &K2)
where
    K: Eq + Hash,
    K2: Eq + Hash,
{
    if let Some(candidates) = state.candidates.get_mut(dest_key) {
        candidates.retain(|c| &c.source != source);
        if candidates.is_empty() {
            state.candidates.remove(dest_key);
        }
    }
}

fn best<'a, K, V2>(candidates: &'a [Candidate<K, V2>], comparator: &Comparator<V2>) -> Option<&'a V2> {
    candidates.iter().map(|c| &c.value).min_by(|a, b| comparator(a, b))
}

fn reselect<K, K2, V2>(
    state: &MergeState<K, K2, V2>,
    downstream: &Downstream<K2, V2>,
    dest_key: &K2,
    comparator: &Comparator<V2>,
    equal: &EqComparator<V2>,
    out: &mut ChangeSet<K2, V2>,
) where
    K2: Eq + Hash + Clone,
    V2: Clone,
{
    let selected = state.candidates.get(dest_key).and_then(|c| best(c, comparator).cloned());
    let published = downstream.lookup(dest_key);
    match (selected, published) {
        (Some(value), Some(prev)) => {
            if !equal(&value, &prev) {
                out.push(Change::update(dest_key.clone(), value, prev));
            }
        }
        (Some(value), None) => out.push(Change::add(dest_key.clone(), value)),
        (None, Some(prev)) => out.push(Change::remove(dest_key.clone(), prev)),
        (None, None) => {}
    }
}

/// Drops `key`'s nested subscription and bulk-removes every destination entry it contributed,
/// re-selecting and publishing the fallout.
fn remove_source<K, K2, V2>(
    state: &Gate<MergeState<K, K2, V2>>,
    key: &K,
    downstream: &Downstream<K2, V2>,
    comparator: &Comparator<V2>,
    equal: &EqComparator<V2>,
) where
    K: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
    V2: Clone,
{
    let mut out = ChangeSet::empty();
    state.with(|state| {
        state.subscriptions.remove(key);
        state.nested_sources.remove(key);
        if let Some(dest_keys) = state.contributed.remove(key) {
            for dest_key in dest_keys {
                remove_candidate(state, key, &dest_key);
                reselect(state, downstream, &dest_key, comparator, equal, &mut out);
            }
        }
    });
    downstream.publish(out);
}

/// Merges per-source-entry destination observables into one keyed destination stream.
pub struct MergeManyChangeSets<K, V, K2, V2> {
    downstream: Arc<Downstream<K2, V2>>,
    _recompute_worker: TaskHandle<()>,
    _source_worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V, K2, V2> MergeManyChangeSets<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    /// Builds the operator. `to_stream` derives the nested destination observable for a source
    /// entry; `comparator` orders candidate values for a destination key, least wins, ties broken
    /// by source insertion order. `equal`, if supplied, suppresses a re-selection emission when
    /// the newly-selected value is equivalent to what's already published.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        to_stream: impl Fn(&V, &K) -> Arc<dyn ChangeStream<K2, V2>> + Send + Sync + 'static,
        comparator: Comparator<V2>,
        equal: Option<EqComparator<V2>>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let state: Arc<Gate<MergeState<K, K2, V2>>> = Arc::new(Gate::new(MergeState::new()));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<MergeEvent<K, K2, V2>>();
        let to_stream: Arc<dyn Fn(&V, &K) -> Arc<dyn ChangeStream<K2, V2>> + Send + Sync> = Arc::new(to_stream);
        // Absent an explicit equality comparator, two candidates tying under `comparator` count
        // as the same value, so a reselection that keeps the incumbent doesn't re-emit it.
        let equal: EqComparator<V2> = equal.unwrap_or_else(|| {
            let default_comparator = comparator.clone();
            Arc::new(move |a: &V2, b: &V2| default_comparator(a, b) == Ordering::Equal)
        });

        let recompute_downstream = downstream.clone();
        let recompute_state = state.clone();
        let recompute_comparator = comparator.clone();
        let recompute_equal = equal.clone();
        let recompute_worker = spawn_task(async move {
            while let Some(MergeEvent::Changes(source, batch)) = event_rx.recv().await {
                let mut out = ChangeSet::empty();
                recompute_state.with(|state| {
                    for change in batch.iter() {
                        let dest_key = change.key().clone();
                        match change.reason() {
                            ChangeReason::Remove => remove_candidate(state, &source, &dest_key),
                            _ => {
                                upsert_candidate(state, &source, dest_key.clone(), change.current().clone());
                                let list = state.contributed.entry(source.clone()).or_default();
                                if !list.contains(&dest_key) {
                                    list.push(dest_key.clone());
                                }
                            }
                        }
                        reselect(state, &recompute_downstream, &dest_key, &recompute_comparator, &recompute_equal, &mut out);
                    }
                });
                recompute_downstream.publish(out);
            }
        });

        let mut upstream_sub = upstream.subscribe_changes();
        let source_downstream = downstream.clone();
        let source_state = state;
        let source_worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        for change in batch {
                            let key = change.key().clone();
                            match change.reason() {
                                ChangeReason::Remove => {
                                    remove_source(&source_state, &key, &source_downstream, &comparator, &equal);
                                }
                                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                                    remove_source(&source_state, &key, &source_downstream, &comparator, &equal);
                                    let nested = to_stream(change.current(), &key);
                                    let mut nested_sub = nested.subscribe_changes();
                                    let task_tx = event_tx.clone();
                                    let task_key = key.clone();
                                    let handle = spawn_task(async move {
                                        while let Some(event) = nested_sub.next().await {
                                            let Event::Next(changes) = event else { break };
                                            if task_tx.send(MergeEvent::Changes(task_key.clone(), changes)).is_err() {
                                                break;
                                            }
                                        }
                                    });
                                    source_state.with(|s| {
                                        s.subscriptions.insert(key.clone(), handle);
                                        s.nested_sources.insert(key, nested);
                                    });
                                }
                                ChangeReason::Moved => {}
                            }
                        }
                    }
                    Event::Error(error) => {
                        source_downstream.fail(error);
                        break;
                    }
                    Event::Completed => {
                        source_downstream.complete();
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            downstream,
            _recompute_worker: recompute_worker,
            _source_worker: source_worker,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<K, V, K2, V2> ChangeStream<K2, V2> for MergeManyChangeSets<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K2, V2>> {
        self.downstream.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{observable::test_support::collect, source::SourceCache};

    fn single_entry_stream(value: i32) -> Arc<dyn ChangeStream<i32, i32>> {
        let nested: SourceCache<i32, i32> = SourceCache::new();
        nested.edit(|u| u.add_or_update(0, value));
        Arc::new(nested)
    }

    #[tokio::test]
    async fn best_value_wins_then_reselects_on_removal() {
        let source: Arc<SourceCache<&'static str, i32>> = Arc::new(SourceCache::new());
        let comparator: Comparator<i32> = Arc::new(|a, b| a.cmp(b));
        let merged = MergeManyChangeSets::new(
            source.clone() as Arc<dyn ChangeStream<&'static str, i32>>,
            |value, _key| single_entry_stream(*value),
            comparator,
            None,
        );
        let sub = merged.subscribe_changes();

        source.edit(|u| u.add_or_update("a", 5));
        source.edit(|u| u.add_or_update("b", 9));
        // sets[0]: empty synthetic snapshot. sets[1]: "a" is the only candidate (5). sets[2]: "b"
        // joins but 9 > 5, published value unchanged so merge emits nothing for it -- the third
        // awaited event is instead produced by the subsequent removal below.
        source.edit(|u| u.remove(&"a"));
        let sets = collect(sub, 3).await;
        assert_eq!(*sets[1].iter().next().unwrap().current(), 5);
        let after_removal = sets[2].iter().next().unwrap();
        assert_eq!(after_removal.reason(), ChangeReason::Update);
        assert_eq!(*after_removal.current(), 9);
    }

    #[tokio::test]
    async fn removing_every_contributor_empties_the_destination_entry() {
        let nested_a: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let nested_b: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let upstream: Arc<SourceCache<&'static str, Arc<SourceCache<i32, i32>>>> = Arc::new(SourceCache::new());
        upstream.edit(|u| {
            u.add_or_update("a", nested_a.clone());
            u.add_or_update("b", nested_b.clone());
        });

        let comparator: Comparator<i32> = Arc::new(|a, b| a.cmp(b));
        let merged = MergeManyChangeSets::new(
            upstream as Arc<dyn ChangeStream<&'static str, Arc<SourceCache<i32, i32>>>>,
            |nested, _key| nested.clone() as Arc<dyn ChangeStream<i32, i32>>,
            comparator,
            None,
        );
        let sub = merged.subscribe_changes();

        nested_a.edit(|u| u.add_or_update(1, 5));
        nested_b.edit(|u| u.add_or_update(1, 9));
        nested_a.edit(|u| u.remove(&1));
        nested_b.edit(|u| u.remove(&1));

        // sets[0]: empty synthetic snapshot. sets[1]: "a" contributes 5, the only candidate.
        // nested_b's add ties under the comparator against the already-published 5, so it emits
        // nothing on its own. sets[2]: "a" withdraws, "b"'s 9 becomes the sole candidate. sets[3]:
        // "b" withdraws too, leaving no candidate at all.
        let sets = collect(sub, 4).await;
        assert_eq!(*sets[1].iter().next().unwrap().current(), 5);
        let reselected = sets[2].iter().next().unwrap();
        assert_eq!(reselected.reason(), ChangeReason::Update);
        assert_eq!(*reselected.current(), 9);
        let removed = sets[3].iter().next().unwrap();
        assert_eq!(removed.reason(), ChangeReason::Remove);
        assert_eq!(*removed.current(), 9);
    }
}
