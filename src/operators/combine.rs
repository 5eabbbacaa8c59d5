//! Logical set algebra (`And`/`Or`/`Xor`/`Except`) over N source streams sharing a key space,
//! plus a dynamic variant whose set of sources is itself observable.

use std::{hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
};

/// Which combinator governs membership in the combined cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOperator {
    /// Present in every source.
    And,
    /// Present in at least one source.
    Or,
    /// Present in exactly one source.
    Xor,
    /// Present in the first source and in none of the others.
    Except,
}

impl CombineOperator {
    fn includes(self, present_in: usize, total_sources: usize) -> bool {
        match self {
            CombineOperator::And => present_in == total_sources,
            CombineOperator::Or => present_in >= 1,
            CombineOperator::Xor => present_in == 1,
            CombineOperator::Except => unreachable!("Except is evaluated by presence in the first source, not a count"),
        }
    }
}

struct CombineState<K, V> {
    per_source: Vec<Cache<K, V>>,
}

impl<K, V> CombineState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(source_count: usize) -> Self {
        Self { per_source: (0..source_count).map(|_| Cache::new()).collect() }
    }

    /// The representative value for `key` under `op`, or `None` if it is not included.
    fn evaluate(&self, op: CombineOperator, key: &K) -> Option<&V> {
        if op == CombineOperator::Except {
            let in_first = self.per_source[0].contains_key(key);
            let in_others = self.per_source[1..].iter().any(|c| c.contains_key(key));
            return if in_first && !in_others { self.per_source[0].lookup(key) } else { None };
        }
        let present_in = self.per_source.iter().filter(|c| c.contains_key(key)).count();
        if !op.includes(present_in, self.per_source.len()) {
            return None;
        }
        self.per_source.iter().find_map(|c| c.lookup(key))
    }
}

fn apply_source_change<K, V>(
    state: &mut CombineState<K, V>,
    downstream: &Downstream<K, V>,
    op: CombineOperator,
    source_index: usize,
    change: Change<K, V>,
    out: &mut ChangeSet<K, V>,
) where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    let key = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => {
            state.per_source[source_index].remove(&key);
        }
        ChangeReason::Moved => {
            out.push(change);
            return;
        }
        _ => {
            state.per_source[source_index].add_or_update(key.clone(), change.current().clone());
        }
    }

    let included = state.evaluate(op, &key);
    let published = downstream.lookup(&key);
    match (included, published) {
        (Some(value), Some(prev)) => {
            if *value != prev {
                out.push(Change::update(key, value.clone(), prev));
            }
        }
        (Some(value), None) => out.push(Change::add(key, value.clone())),
        (None, Some(prev)) => out.push(Change::remove(key, prev)),
        (None, None) => {}
    }
}

/// Combines N source streams sharing a key space via `op`. `Refresh` always forwards to the
/// combined stream unconditionally when the key is currently included, regardless of whether the
/// representative value changed.
pub struct Combine<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _worker: TaskHandle<()>,
}

enum CombineEvent<K, V> {
    Changes(usize, ChangeSet<K, V>),
    Failed(crate::error::Error),
    Completed(usize),
}

impl<K, V> Combine<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds the operator over a fixed set of sources. Each source is forwarded to the worker
    /// through one shared channel rather than polled directly, so the worker stays a plain
    /// `recv` loop regardless of source count.
    pub fn new(sources: Vec<Arc<dyn ChangeStream<K, V>>>, op: CombineOperator) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let worker_downstream = downstream.clone();
        let source_count = sources.len();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<CombineEvent<K, V>>();
        let mut forwarders = Vec::with_capacity(source_count);
        for (index, source) in sources.into_iter().enumerate() {
            let mut sub = source.subscribe_changes();
            let task_tx = event_tx.clone();
            forwarders.push(spawn_task(async move {
                loop {
                    match sub.next().await {
                        Some(Event::Next(batch)) => {
                            if task_tx.send(CombineEvent::Changes(index, batch)).is_err() {
                                break;
                            }
                        }
                        Some(Event::Error(error)) => {
                            let _ = task_tx.send(CombineEvent::Failed(error));
                            break;
                        }
                        Some(Event::Completed) | None => {
                            let _ = task_tx.send(CombineEvent::Completed(index));
                            break;
                        }
                    }
                }
            }));
        }
        drop(event_tx);

        let worker = spawn_task(async move {
            let _forwarders = forwarders;
            let mut state: CombineState<K, V> = CombineState::new(source_count);
            let mut done = vec![false; source_count];

            while let Some(event) = event_rx.recv().await {
                let mut out = ChangeSet::empty();
                match event {
                    CombineEvent::Changes(source_index, batch) => {
                        for change in batch {
                            if change.reason() == ChangeReason::Refresh {
                                let key = change.key().clone();
                                state.per_source[source_index].add_or_update(key.clone(), change.current().clone());
                                if state.evaluate(op, &key).is_some() {
                                    out.push(Change::refresh(key, change.current().clone()));
                                }
                                continue;
                            }
                            apply_source_change(&mut state, &worker_downstream, op, source_index, change, &mut out);
                        }
                    }
                    CombineEvent::Failed(error) => {
                        worker_downstream.fail(error);
                        return;
                    }
                    CombineEvent::Completed(source_index) => {
                        done[source_index] = true;
                        if done.iter().all(|&d| d) {
                            worker_downstream.publish(out);
                            worker_downstream.complete();
                            return;
                        }
                    }
                }
                worker_downstream.publish(out);
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

impl<K, V> ChangeStream<K, V> for Combine<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

/// A change to the set of sources feeding a [`DynamicCombiner`]: a source joining or leaving.
pub enum SourceChange<K, V> {
    /// A new source stream joins the combination.
    Added(Arc<dyn ChangeStream<K, V>>),
    /// The source at this index (in join order) leaves the combination.
    Removed(usize),
}

/// Like [`Combine`], but the set of contributing sources is itself observable: adding or
/// removing a source re-evaluates membership for every key it contributed.
pub struct DynamicCombiner<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _worker: TaskHandle<()>,
}

enum DynamicEvent<K, V> {
    SourceChanges(usize, ChangeSet<K, V>),
    SourceFailed(crate::error::Error),
    SourceCompleted(usize),
}

impl<K, V> DynamicCombiner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds the operator, starting from no sources.
    pub fn new(op: CombineOperator, source_changes: Subscription<SourceChange<K, V>>) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let worker_downstream = downstream.clone();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<DynamicEvent<K, V>>();
        let mut sources_sub = source_changes;

        let worker = spawn_task(async move {
            let mut state: CombineState<K, V> = CombineState::new(0);
            let mut slots: Vec<Option<TaskHandle<()>>> = Vec::new();

            loop {
                tokio::select! {
                    event = sources_sub.next() => {
                        match event {
                            Some(Event::Next(SourceChange::Added(stream))) => {
                                let index = state.per_source.len();
                                state.per_source.push(Cache::new());
                                let mut nested_sub = stream.subscribe_changes();
                                let task_tx = event_tx.clone();
                                let handle = spawn_task(async move {
                                    loop {
                                        match nested_sub.next().await {
                                            Some(Event::Next(batch)) => {
                                                if task_tx.send(DynamicEvent::SourceChanges(index, batch)).is_err() {
                                                    break;
                                                }
                                            }
                                            Some(Event::Error(error)) => {
                                                let _ = task_tx.send(DynamicEvent::SourceFailed(error));
                                                break;
                                            }
                                            Some(Event::Completed) | None => {
                                                let _ = task_tx.send(DynamicEvent::SourceCompleted(index));
                                                break;
                                            }
                                        }
                                    }
                                });
                                slots.push(Some(handle));
                            }
                            Some(Event::Next(SourceChange::Removed(index))) => {
                                if let Some(slot) = slots.get_mut(index) {
                                    *slot = None;
                                }
                                let mut out = ChangeSet::empty();
                                let keys: Vec<K> = state.per_source.get(index).map(|c| c.keys().cloned().collect()).unwrap_or_default();
                                if let Some(cache) = state.per_source.get_mut(index) {
                                    cache.clear();
                                }
                                for key in keys {
                                    let included = state.evaluate(op, &key);
                                    match (included, worker_downstream.lookup(&key)) {
                                        (Some(value), Some(prev)) if *value != prev => out.push(Change::update(key.clone(), value.clone(), prev)),
                                        (None, Some(prev)) => out.push(Change::remove(key, prev)),
                                        _ => {}
                                    }
                                }
                                worker_downstream.publish(out);
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => {}
                        }
                    }
                    event = event_rx.recv() => {
                        match event {
                            Some(DynamicEvent::SourceChanges(index, batch)) => {
                                let mut out = ChangeSet::empty();
                                for change in batch {
                                    apply_source_change(&mut state, &worker_downstream, op, index, change, &mut out);
                                }
                                worker_downstream.publish(out);
                            }
                            Some(DynamicEvent::SourceFailed(error)) => {
                                worker_downstream.fail(error);
                                return;
                            }
                            Some(DynamicEvent::SourceCompleted(_)) | None => {}
                        }
                    }
                }
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

impl<K, V> ChangeStream<K, V> for DynamicCombiner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{observable::test_support::collect, source::SourceCache};

    #[tokio::test]
    async fn and_requires_presence_in_every_source() {
        let a: Arc<SourceCache<i32, &'static str>> = Arc::new(SourceCache::new());
        let b: Arc<SourceCache<i32, &'static str>> = Arc::new(SourceCache::new());
        a.edit(|u| u.add_or_update(1, "a"));
        let combined = Combine::new(
            vec![a.clone() as Arc<dyn ChangeStream<i32, &'static str>>, b.clone() as Arc<dyn ChangeStream<i32, &'static str>>],
            CombineOperator::And,
        );
        let sub = combined.subscribe_changes();

        b.edit(|u| u.add_or_update(1, "b"));

        // sets[0]: empty synthetic snapshot. Neither source's own initial replay produces an
        // emission (key 1 only in `a`, `And` needs both, and an empty change set never
        // broadcasts) -- the next real broadcast is `b`'s live add, which completes `And` and
        // is represented by the first source that still holds the key.
        let sets = collect(sub, 2).await;
        let change = sets[1].iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Add);
        assert_eq!(*change.current(), "a");
    }

    #[tokio::test]
    async fn except_excludes_keys_present_in_other_sources() {
        let a: Arc<SourceCache<i32, &'static str>> = Arc::new(SourceCache::new());
        let b: Arc<SourceCache<i32, &'static str>> = Arc::new(SourceCache::new());
        a.edit(|u| u.add_or_update(1, "a"));
        let combined = Combine::new(
            vec![a.clone() as Arc<dyn ChangeStream<i32, &'static str>>, b.clone() as Arc<dyn ChangeStream<i32, &'static str>>],
            CombineOperator::Except,
        );
        let sub = combined.subscribe_changes();

        b.edit(|u| u.add_or_update(1, "b"));
        let sets = collect(sub, 3).await;
        assert_eq!(sets[1].iter().next().unwrap().reason(), ChangeReason::Add);
        assert_eq!(sets[2].iter().next().unwrap().reason(), ChangeReason::Remove);
    }

    #[tokio::test]
    async fn and_across_three_sources_narrows_to_the_common_key() {
        let a: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let b: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let c: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        a.edit(|u| {
            u.add_or_update(1, 1);
            u.add_or_update(2, 2);
        });
        b.edit(|u| {
            u.add_or_update(2, 2);
            u.add_or_update(3, 3);
        });
        c.edit(|u| {
            u.add_or_update(2, 2);
            u.add_or_update(4, 4);
        });
        let combined = Combine::new(
            vec![
                a.clone() as Arc<dyn ChangeStream<i32, i32>>,
                b.clone() as Arc<dyn ChangeStream<i32, i32>>,
                c.clone() as Arc<dyn ChangeStream<i32, i32>>,
            ],
            CombineOperator::And,
        );
        let sub = combined.subscribe_changes();

        b.edit(|u| u.remove(&2));

        // sets[0]: empty synthetic snapshot. The three sources' own initial replay settles on key
        // 2 as the only one present in all three, which is the first live broadcast the
        // subscription observes; the subsequent removal from `b` is the second.
        let sets = collect(sub, 2).await;
        let settled = sets[0].iter().next().unwrap();
        assert_eq!(settled.reason(), ChangeReason::Add);
        assert_eq!(*settled.key(), 2);
        let removed = sets[1].iter().next().unwrap();
        assert_eq!(removed.reason(), ChangeReason::Remove);
        assert_eq!(*removed.key(), 2);
    }
}
