//! Fans each source entry out to a collection of destination entries, diffing successive
//! collections by destination key on `Update`.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    error::{Error, ErrorKind, OperatorError, Result},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
    sync::Gate,
    BoxFuture,
};

/// Per-source-key bookkeeping: the last snapshot of destination entries it produced.
type Snapshot<K2, V2> = Vec<(K2, V2)>;

/// Maps each source entry to a collection of destination entries via `f`. An `Update` of a
/// source key diffs the previous destination snapshot against the new one by destination key:
/// entries leaving the snapshot are removed, entries entering it are added, entries present in
/// both with a different value (compared with `PartialEq`) are updated, and unchanged entries
/// produce no emission.
pub struct TransformMany<K, V, K2, V2> {
    downstream: Arc<Downstream<K2, V2>>,
    _worker: TaskHandle<()>,
}

impl<K, V, K2, V2> TransformMany<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds the operator. `f` must be deterministic: the same `(V, K)` always yields the same
    /// destination collection, since the diff on `Update` assumes no hidden state.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        f: impl Fn(&V, &K) -> Vec<(K2, V2)> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let snapshots: Arc<Gate<HashMap<K, Snapshot<K2, V2>>>> = Arc::new(Gate::new(HashMap::new()));

        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let worker_snapshots = snapshots;

        let worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut out = ChangeSet::empty();
                        for change in batch.iter() {
                            let key = change.key().clone();
                            match change.reason() {
                                ChangeReason::Remove => {
                                    if let Some(old) = worker_snapshots.with(|s| s.remove(&key)) {
                                        for (k2, v2) in old {
                                            out.push(Change::remove(k2, v2));
                                        }
                                    }
                                }
                                ChangeReason::Add => {
                                    let produced = f(change.current(), &key);
                                    for (k2, v2) in produced.iter() {
                                        out.push(Change::add(k2.clone(), v2.clone()));
                                    }
                                    worker_snapshots.with(|s| s.insert(key, produced));
                                }
                                ChangeReason::Update => {
                                    let produced = f(change.current(), &key);
                                    let previous = worker_snapshots.with(|s| s.insert(key.clone(), produced.clone()));
                                    diff(previous.unwrap_or_default(), produced, &mut out);
                                }
                                ChangeReason::Refresh => {
                                    let produced = f(change.current(), &key);
                                    for (k2, v2) in produced.iter() {
                                        out.push(Change::refresh(k2.clone(), v2.clone()));
                                    }
                                    worker_snapshots.with(|s| s.insert(key, produced));
                                }
                                ChangeReason::Moved => {}
                            }
                        }
                        worker_downstream.publish(out);
                    }
                    Event::Error(error) => {
                        worker_downstream.fail(error);
                        break;
                    }
                    Event::Completed => {
                        worker_downstream.complete();
                        break;
                    }
                }
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

fn diff<K2: Eq + Hash + Clone, V2: Clone + PartialEq>(
    previous: Snapshot<K2, V2>,
    current: Snapshot<K2, V2>,
    out: &mut ChangeSet<K2, V2>,
) {
    let mut previous: HashMap<K2, V2> = previous.into_iter().collect();
    for (key, value) in current {
        match previous.remove(&key) {
            None => out.push(Change::add(key, value)),
            Some(prev) if prev != value => out.push(Change::update(key, value, prev)),
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        out.push(Change::remove(key, value));
    }
}

impl<K, V, K2, V2> ChangeStream<K2, V2> for TransformMany<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K2, V2>> {
        self.downstream.subscribe()
    }
}

/// The async-transform variant: `f` returns a future resolving to the destination collection,
/// rather than the collection itself. Per-key failures are isolated: a key whose future resolves
/// to `Err` contributes an empty destination snapshot instead of tearing down the pipeline, and
/// is reported through `error_callback` if one is installed.
pub struct TransformManyAsync<K, V, K2, V2> {
    downstream: Arc<Downstream<K2, V2>>,
    _worker: TaskHandle<()>,
}

impl<K, V, K2, V2> TransformManyAsync<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds the operator.
    pub fn new<F>(
        upstream: Arc<dyn ChangeStream<K, V>>,
        f: impl Fn(V, K) -> F + Send + Sync + 'static,
        error_callback: Option<Arc<dyn Fn(OperatorError<K, V>) + Send + Sync>>,
    ) -> Arc<Self>
    where
        F: std::future::Future<Output = Result<Vec<(K2, V2)>>> + Send + 'static,
    {
        let downstream = Arc::new(Downstream::new());
        let snapshots: Arc<Gate<HashMap<K, Snapshot<K2, V2>>>> = Arc::new(Gate::new(HashMap::new()));
        let resolving: Arc<Gate<HashMap<K, u64>>> = Arc::new(Gate::new(HashMap::new()));

        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let worker_snapshots = snapshots.clone();
        let worker_f: Arc<dyn Fn(V, K) -> BoxFuture<'static, Result<Vec<(K2, V2)>>> + Send + Sync> =
            Arc::new(move |v, k| Box::pin(f(v, k)));

        let worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        for change in batch {
                            let key = change.key().clone();
                            if change.reason() == ChangeReason::Remove {
                                let mut out = ChangeSet::empty();
                                if let Some(old) = worker_snapshots.with(|s| s.remove(&key)) {
                                    for (k2, v2) in old {
                                        out.push(Change::remove(k2, v2));
                                    }
                                }
                                worker_downstream.publish(out);
                                continue;
                            }
                            let (_, current, _) = change.into_parts();
                            let generation = resolving.with(|r| {
                                let entry = r.entry(key.clone()).or_insert(0);
                                *entry += 1;
                                *entry
                            });
                            let task_downstream = worker_downstream.clone();
                            let task_snapshots = worker_snapshots.clone();
                            let task_resolving = resolving.clone();
                            let task_f = worker_f.clone();
                            let task_errors = error_callback.clone();
                            let task_key = key.clone();
                            tokio::spawn(async move {
                                let result = task_f(current, task_key.clone()).await;
                                let still_current = task_resolving.with(|r| r.get(&task_key).copied() == Some(generation));
                                if !still_current {
                                    return;
                                }
                                let produced = match result {
                                    Ok(produced) => produced,
                                    Err(cause) => {
                                        if let Some(callback) = &task_errors {
                                            callback(OperatorError::new(cause, task_key.clone(), None));
                                        }
                                        Vec::new()
                                    }
                                };
                                let mut out = ChangeSet::empty();
                                let previous = task_snapshots.with(|s| s.insert(task_key, produced.clone()));
                                diff(previous.unwrap_or_default(), produced, &mut out);
                                task_downstream.publish(out);
                            });
                        }
                    }
                    Event::Error(error) => {
                        worker_downstream.fail(error);
                        break;
                    }
                    Event::Completed => {
                        worker_downstream.complete();
                        break;
                    }
                }
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

impl<K, V, K2, V2> ChangeStream<K2, V2> for TransformManyAsync<K, V, K2, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    K2: Eq + Hash + Clone + Send + Sync + 'static,
    V2: Clone + PartialEq + Send + Sync + 'static,
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

    #[tokio::test]
    async fn add_fans_out_every_destination_entry() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let many = TransformMany::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |v, _| {
            (0..*v).map(|i| (i, i)).collect()
        });
        let sub = many.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 3));
        let sets = collect(sub, 2).await;
        assert_eq!(sets[1].len(), 3);
    }

    #[tokio::test]
    async fn update_diffs_destination_snapshots() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        source.edit(|u| u.add_or_update(1, 2));
        let many = TransformMany::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |v, _| {
            (0..*v).map(|i| (i, i)).collect()
        });
        let sub = many.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 3));
        // sets[0]: empty synthetic snapshot. sets[1]: replay of the upstream's own initial
        // snapshot (Add 1->2, fanned out to destinations 0 and 1). sets[2]: the diff against the
        // live update (1->3), which only adds destination 2.
        let sets = collect(sub, 3).await;
        assert_eq!(sets[2].len(), 1);
        assert_eq!(sets[2].iter().next().unwrap().reason(), ChangeReason::Add);
    }
}
