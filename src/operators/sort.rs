//! Maintains a sorted projection of a keyed stream, annotating each change with its position,
//! plus a windowing layer on top driven by an observable virtual-scroll request.

use std::{cmp::Ordering, hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
    sync::Gate,
};

/// Orders two values for the sorted projection.
pub type Comparator<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Above how many changes in one upstream batch [`Sort`] abandons incremental binary
/// insert/remove and rebuilds its entire order from scratch.
const DEFAULT_RESET_THRESHOLD: usize = 64;

struct SortState<K, V> {
    values: Cache<K, V>,
    order: Vec<K>,
    comparator: Comparator<V>,
}

impl<K, V> SortState<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new(comparator: Comparator<V>) -> Self {
        Self { values: Cache::new(), order: Vec::new(), comparator }
    }

    fn position_of(&self, key: &K) -> Option<usize> {
        self.order.iter().position(|k| k == key)
    }

    fn insertion_point(&self, value: &V) -> usize {
        self.order.partition_point(|k| {
            let existing = self.values.lookup(k).expect("every ordered key has a mirrored value");
            (self.comparator)(existing, value) != Ordering::Greater
        })
    }

    fn rebuild(&mut self) {
        let mut order: Vec<K> = self.values.keys().cloned().collect();
        order.sort_by(|a, b| {
            let va = self.values.lookup(a).expect("key present in mirror");
            let vb = self.values.lookup(b).expect("key present in mirror");
            (self.comparator)(va, vb)
        });
        self.order = order;
    }
}

/// Sorts a keyed stream by `comparator`, annotating each emitted change with its position in the
/// sorted order via [`Change::with_indices`]. A batch larger than `reset_threshold` is applied by
/// rebuilding the whole order rather than one binary insert/remove per change.
pub struct Sort<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _worker: TaskHandle<()>,
}

impl<K, V> Sort<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds the operator with a fixed comparator and the default reset threshold.
    pub fn new(upstream: Arc<dyn ChangeStream<K, V>>, comparator: Comparator<V>) -> Arc<Self> {
        Self::with_reset_threshold(upstream, comparator, None, DEFAULT_RESET_THRESHOLD)
    }

    /// Builds the operator. `comparator_changes`, if supplied, triggers a reorder pass (positions
    /// recomputed, membership untouched) each time a new comparator arrives.
    pub fn with_reset_threshold(
        upstream: Arc<dyn ChangeStream<K, V>>,
        comparator: Comparator<V>,
        comparator_changes: Option<Subscription<Comparator<V>>>,
        reset_threshold: usize,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state = SortState::new(comparator);
            let mut comparator_sub = comparator_changes;

            loop {
                tokio::select! {
                    event = upstream_sub.next() => {
                        match event {
                            Some(Event::Next(batch)) => {
                                let out = if batch.len() > reset_threshold {
                                    apply_batch_by_rebuild(&mut state, batch)
                                } else {
                                    apply_batch_incremental(&mut state, batch)
                                };
                                worker_downstream.publish(out);
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => { worker_downstream.complete(); return; }
                        }
                    }
                    event = next_comparator(&mut comparator_sub) => {
                        let Some(new_comparator) = event else { continue };
                        let previous_order = state.order.clone();
                        state.comparator = new_comparator;
                        state.rebuild();
                        let mut out = ChangeSet::empty();
                        for (new_index, key) in state.order.iter().enumerate() {
                            let old_index = previous_order.iter().position(|k| k == key);
                            if old_index != Some(new_index) {
                                let value = state.values.lookup(key).expect("key present in mirror").clone();
                                out.push(Change::moved(key.clone(), value).with_indices(Some(new_index), old_index));
                            }
                        }
                        worker_downstream.publish(out);
                    }
                }
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

async fn next_comparator<V>(sub: &mut Option<Subscription<Comparator<V>>>) -> Option<Comparator<V>>
where
    V: Send + Sync + 'static,
{
    match sub {
        Some(s) => match s.next().await {
            Some(Event::Next(comparator)) => Some(comparator),
            _ => None,
        },
        None => std::future::pending().await,
    }
}

fn apply_batch_incremental<K, V>(state: &mut SortState<K, V>, batch: ChangeSet<K, V>) -> ChangeSet<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let mut out = ChangeSet::empty();
    for change in batch {
        let key = change.key().clone();
        match change.reason() {
            ChangeReason::Remove => {
                let old_index = state.position_of(&key);
                if let Some(index) = old_index {
                    state.order.remove(index);
                }
                state.values.remove(&key);
                out.push(Change::remove(key, change.into_parts().1).with_indices(None, old_index));
            }
            ChangeReason::Add => {
                let value = change.current().clone();
                let index = state.insertion_point(&value);
                state.order.insert(index, key.clone());
                state.values.add_or_update(key.clone(), value.clone());
                out.push(Change::add(key, value).with_indices(Some(index), None));
            }
            ChangeReason::Update => {
                let old_index = state.position_of(&key);
                if let Some(index) = old_index {
                    state.order.remove(index);
                }
                let (key, current, previous) = change.into_parts();
                let previous = previous.expect("Update always carries a previous value");
                state.values.add_or_update(key.clone(), current.clone());
                let new_index = state.insertion_point(&current);
                state.order.insert(new_index, key.clone());
                out.push(Change::update(key, current, previous).with_indices(Some(new_index), old_index));
            }
            ChangeReason::Refresh => {
                let index = state.position_of(&key);
                state.values.add_or_update(key.clone(), change.current().clone());
                out.push(change.with_indices(index, index));
            }
            ChangeReason::Moved => out.push(change),
        }
    }
    out
}

fn apply_batch_by_rebuild<K, V>(state: &mut SortState<K, V>, batch: ChangeSet<K, V>) -> ChangeSet<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let previous_published: Vec<K> = state.order.clone();
    let mut removed_values: std::collections::HashMap<K, V> = std::collections::HashMap::new();
    for change in batch.iter() {
        match change.reason() {
            ChangeReason::Remove => {
                if let Some(value) = state.values.remove(change.key()) {
                    removed_values.insert(change.key().clone(), value);
                }
            }
            ChangeReason::Moved => {}
            _ => {
                state.values.add_or_update(change.key().clone(), change.current().clone());
            }
        }
    }
    state.rebuild();

    let mut out = ChangeSet::empty();
    for key in &previous_published {
        if let Some(value) = removed_values.remove(key) {
            out.push(Change::remove(key.clone(), value));
        }
    }
    for (new_index, key) in state.order.iter().enumerate() {
        let value = state.values.lookup(key).expect("key present in mirror").clone();
        let old_index = previous_published.iter().position(|k| k == key);
        match old_index {
            None => out.push(Change::add(key.clone(), value).with_indices(Some(new_index), None)),
            Some(old_index) if old_index != new_index => {
                out.push(Change::moved(key.clone(), value).with_indices(Some(new_index), Some(old_index)))
            }
            Some(_) => {}
        }
    }
    out
}

impl<K, V> ChangeStream<K, V> for Sort<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

/// A virtual-scroll window request: show `size` entries starting at sorted position `start`.
/// Invalid requests (`size == 0`) are ignored by [`SortAndVirtualize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRequest {
    /// The first sorted position to include in the window.
    pub start: u32,
    /// The number of entries to include, starting at `start`. Must be at least 1.
    pub size: u32,
}

/// The metadata attached to each [`SortAndVirtualize`] emission: the total size of the sorted
/// projection and the window currently in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualContext {
    /// The number of entries in the full sorted projection, not just the window.
    pub total_size: usize,
    /// The window this change set's contents are relative to.
    pub request: VirtualRequest,
}

/// Layers a virtual-scroll window on top of a [`Sort`]ed projection: an observable
/// [`VirtualRequest`] selects which slice of the sorted order is in view, and only changes
/// affecting that slice (entries entering, leaving, or updating in-window) are emitted.
pub struct SortAndVirtualize<K, V> {
    downstream: Arc<Downstream<K, V>>,
    context: Arc<Gate<VirtualContext>>,
    _worker: TaskHandle<()>,
}

struct VirtualState<K, V> {
    sorted: SortState<K, V>,
    request: VirtualRequest,
}

fn windowed_keys<K: Clone, V>(sorted: &SortState<K, V>, request: &VirtualRequest) -> Vec<K> {
    let start = request.start as usize;
    let end = start.saturating_add(request.size as usize).min(sorted.order.len());
    if start >= sorted.order.len() {
        return Vec::new();
    }
    sorted.order[start..end].to_vec()
}

fn emit_window<K, V>(
    downstream: &Downstream<K, V>,
    sorted: &SortState<K, V>,
    request: &VirtualRequest,
) -> ChangeSet<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    let window: Vec<K> = windowed_keys(sorted, request);
    let window_set: std::collections::HashSet<&K> = window.iter().collect();
    let mut out = ChangeSet::empty();

    let published_keys: Vec<K> = downstream.snapshot().into_iter().map(|(k, _)| k).collect();
    for key in &published_keys {
        if !window_set.contains(key) {
            if let Some(prev) = downstream.lookup(key) {
                out.push(Change::remove(key.clone(), prev));
            }
        }
    }
    for key in &window {
        let value = sorted.values.lookup(key).expect("windowed key present in mirror").clone();
        match downstream.lookup(key) {
            None => out.push(Change::add(key.clone(), value)),
            Some(prev) if prev != value => out.push(Change::update(key.clone(), value, prev)),
            Some(_) => {}
        }
    }
    out
}

impl<K, V> SortAndVirtualize<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds the operator. `requests` must emit at least one valid request before any window is
    /// shown; invalid requests (`size == 0`) are ignored, per the `VirtualRequest` contract.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        comparator: Comparator<V>,
        mut requests: Subscription<VirtualRequest>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let context = Arc::new(Gate::new(VirtualContext {
            total_size: 0,
            request: VirtualRequest { start: 0, size: 0 },
        }));
        let worker_context = context.clone();

        let worker = spawn_task(async move {
            let mut state = VirtualState { sorted: SortState::new(comparator), request: VirtualRequest { start: 0, size: 0 } };

            loop {
                tokio::select! {
                    event = upstream_sub.next() => {
                        match event {
                            Some(Event::Next(batch)) => {
                                let _ = apply_batch_incremental(&mut state.sorted, batch);
                                worker_context.with(|ctx| ctx.total_size = state.sorted.order.len());
                                if state.request.size > 0 {
                                    let out = emit_window(&worker_downstream, &state.sorted, &state.request);
                                    worker_downstream.publish(out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => { worker_downstream.complete(); return; }
                        }
                    }
                    event = requests.next() => {
                        match event {
                            Some(Event::Next(request)) if request.size >= 1 => {
                                state.request = request;
                                worker_context.with(|ctx| ctx.request = request);
                                let out = emit_window(&worker_downstream, &state.sorted, &state.request);
                                worker_downstream.publish(out);
                            }
                            Some(Event::Next(_)) => {}
                            Some(Event::Error(_)) | Some(Event::Completed) | None => {}
                        }
                    }
                }
            }
        });

        Arc::new(Self { downstream, context, _worker: worker })
    }

    /// The total size of the sorted projection and the window last requested, as of the most
    /// recently processed event.
    pub fn context(&self) -> VirtualContext {
        self.context.with(|ctx| *ctx)
    }
}

impl<K, V> ChangeStream<K, V> for SortAndVirtualize<K, V>
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
    async fn incremental_insert_reports_position() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let comparator: Comparator<i32> = Arc::new(|a, b| a.cmp(b));
        let sorted = Sort::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, comparator);
        let sub = sorted.subscribe_changes();

        source.edit(|u| {
            u.add_or_update(1, 30);
            u.add_or_update(2, 10);
            u.add_or_update(3, 20);
        });

        // sets[0]: empty synthetic snapshot. sets[1]: the one batch of three adds, each carrying
        // its insertion index in ascending-value order (10, 20, 30 -> indices 0, 1, 2).
        let sets = collect(sub, 2).await;
        let mut by_key: Vec<_> = sets[1].iter().map(|c| (*c.key(), c.current_index())).collect();
        by_key.sort_by_key(|(k, _)| *k);
        assert_eq!(by_key, vec![(1, Some(2)), (2, Some(0)), (3, Some(1))]);
    }

    #[tokio::test]
    async fn virtualized_window_only_emits_in_window_entries() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let comparator: Comparator<i32> = Arc::new(|a, b| a.cmp(b));
        let (tx, rx) = tokio::sync::broadcast::channel::<Event<VirtualRequest>>(4);
        let request_sub = Subscription::new(Box::pin(tokio_stream::wrappers::BroadcastStream::new(rx).map(
            |r| match r {
                Ok(event) => event,
                Err(_) => Event::Error(crate::error::Error::from(crate::error::ErrorKind::Internal {
                    message: "lagged".into(),
                })),
            },
        )));

        let virtualized =
            SortAndVirtualize::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, comparator, request_sub);
        let sub = virtualized.subscribe_changes();

        // Establish the window (over an still-empty sorted projection, so this produces no
        // emission) before the source gains any entries, so the ordering between the request and
        // the first real batch is deterministic.
        tx.send(Event::Next(VirtualRequest { start: 0, size: 2 })).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        source.edit(|u| {
            u.add_or_update(1, 30);
            u.add_or_update(2, 10);
            u.add_or_update(3, 20);
        });

        // sets[0]: empty synthetic snapshot. sets[1]: the source batch lands, sorted ascending by
        // value (10, 20, 30 -> keys 2, 3, 1), and the size-2 window starting at 0 admits only the
        // first two: keys 2 and 3.
        let sets = collect(sub, 2).await;
        let keys: std::collections::HashSet<i32> = sets[1].iter().map(|c| *c.key()).collect();
        assert!(keys.contains(&2) && keys.contains(&3) && !keys.contains(&1));
    }

    #[tokio::test]
    async fn shifting_the_window_removes_vacated_keys_then_adds_entering_ones() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        source.edit(|u| {
            for key in 1..=10 {
                u.add_or_update(key, key);
            }
        });
        let comparator: Comparator<i32> = Arc::new(|a, b| a.cmp(b));
        let (tx, rx) = tokio::sync::broadcast::channel::<Event<VirtualRequest>>(4);
        let request_sub = Subscription::new(Box::pin(tokio_stream::wrappers::BroadcastStream::new(rx).map(
            |r| match r {
                Ok(event) => event,
                Err(_) => Event::Error(crate::error::Error::from(crate::error::ErrorKind::Internal {
                    message: "lagged".into(),
                })),
            },
        )));

        let virtualized =
            SortAndVirtualize::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, comparator, request_sub);
        let mut sub = virtualized.subscribe_changes();

        // The empty synthetic snapshot, taken before the worker has replayed the source's one
        // batch of ten adds; no window has been requested yet, so that replay publishes nothing.
        let _ = sub.next().await;

        tx.send(Event::Next(VirtualRequest { start: 3, size: 4 })).unwrap();
        // The first window request, over keys 1..10 sorted by their own value, admits positions
        // 3..6 -> keys 4..7.
        let first_window: std::collections::HashSet<i32> =
            sub.next().await.unwrap().next().unwrap().iter().map(|c| *c.key()).collect();
        assert_eq!(first_window, std::collections::HashSet::from([4, 5, 6, 7]));

        tx.send(Event::Next(VirtualRequest { start: 5, size: 4 })).unwrap();
        // Shifting to positions 5..8 -> keys 6..9 drops keys 4 and 5 and admits keys 8 and 9,
        // removals ordered before additions.
        let shifted = sub.next().await.unwrap().next().unwrap();
        let ops: Vec<(i32, ChangeReason)> = shifted.iter().map(|c| (*c.key(), c.reason())).collect();
        let remove_positions: Vec<usize> =
            ops.iter().enumerate().filter(|(_, (_, r))| *r == ChangeReason::Remove).map(|(i, _)| i).collect();
        let add_positions: Vec<usize> =
            ops.iter().enumerate().filter(|(_, (_, r))| *r == ChangeReason::Add).map(|(i, _)| i).collect();
        assert!(remove_positions.iter().max().copied().unwrap_or(0) < add_positions.iter().min().copied().unwrap_or(usize::MAX));
        let removed: std::collections::HashSet<i32> =
            ops.iter().filter(|(_, r)| *r == ChangeReason::Remove).map(|(k, _)| *k).collect();
        let added: std::collections::HashSet<i32> =
            ops.iter().filter(|(_, r)| *r == ChangeReason::Add).map(|(k, _)| *k).collect();
        assert_eq!(removed, std::collections::HashSet::from([4, 5]));
        assert_eq!(added, std::collections::HashSet::from([8, 9]));
    }
}
