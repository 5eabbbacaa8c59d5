//! Static and dynamic membership filters over a change-set stream.

use std::{hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
    sync::Gate,
};

/// Filters a change-set stream by a predicate fixed at construction time.
///
/// Per-key membership (`was_included`) is read directly off the downstream mirror rather than
/// tracked separately, since a key is included in the mirror exactly when the predicate last
/// held for it.
pub struct Filter<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _worker: TaskHandle<()>,
}

impl<K, V> Filter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a filter over `upstream`, keeping only entries for which `predicate` holds.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut out = ChangeSet::empty();
                        for change in batch {
                            apply_one(&worker_downstream, &predicate, change, &mut out);
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

fn apply_one<K, V>(
    downstream: &Downstream<K, V>,
    predicate: &(impl Fn(&K, &V) -> bool + ?Sized),
    change: Change<K, V>,
    out: &mut ChangeSet<K, V>,
) where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let was = downstream.contains_key(change.key());
    match change.reason() {
        ChangeReason::Add => {
            if predicate(change.key(), change.current()) {
                out.push(Change::add(change.key().clone(), change.current().clone()));
            }
        }
        ChangeReason::Update => {
            let is = predicate(change.key(), change.current());
            let (key, current, previous) = change.into_parts();
            let previous = previous.expect("Update change always carries a previous value");
            if is && !was {
                out.push(Change::add(key, current));
            } else if is && was {
                out.push(Change::update(key, current, previous));
            } else if !is && was {
                out.push(Change::remove(key, previous));
            }
        }
        ChangeReason::Remove => {
            if was {
                out.push(Change::remove(change.key().clone(), change.current().clone()));
            }
        }
        ChangeReason::Refresh => {
            let is = predicate(change.key(), change.current());
            if is && !was {
                out.push(Change::add(change.key().clone(), change.current().clone()));
            } else if !is && was {
                out.push(Change::remove(change.key().clone(), change.current().clone()));
            } else if is && was {
                out.push(Change::refresh(change.key().clone(), change.current().clone()));
            }
        }
        ChangeReason::Moved => out.push(change),
    }
}

impl<K, V> ChangeStream<K, V> for Filter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

/// A filter whose predicate depends on an externally-observed state `S` (e.g. a search term) in
/// addition to each entry's value. Re-evaluates every currently-seen entry whenever `state`
/// emits, producing `Add`/`Remove` for membership flips — never `Refresh`, per the dynamic
/// filter's contract.
pub struct DynamicFilter<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _values_worker: TaskHandle<()>,
    _state_worker: TaskHandle<()>,
}

struct Completion {
    values_done: bool,
    state_done: bool,
    state_was_ever_valid: bool,
}

impl<K, V> DynamicFilter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a dynamic filter. If `suppress_until_valid` is set and `state` completes having
    /// never emitted a value, the downstream stream completes immediately rather than ever
    /// publishing the unfiltered upstream.
    pub fn new<S>(
        upstream: Arc<dyn ChangeStream<K, V>>,
        state: Subscription<S>,
        predicate: impl Fn(&V, &S) -> bool + Send + Sync + 'static,
        suppress_until_valid: bool,
    ) -> Arc<Self>
    where
        S: Clone + Send + Sync + 'static,
    {
        let downstream = Arc::new(Downstream::new());
        let source_mirror: Arc<Gate<Cache<K, V>>> = Arc::new(Gate::new(Cache::new()));
        let latest_state: Arc<Gate<Option<S>>> = Arc::new(Gate::new(None));
        let completion = Arc::new(Gate::new(Completion {
            values_done: false,
            state_done: false,
            state_was_ever_valid: false,
        }));
        let predicate = Arc::new(predicate);

        let mut value_sub = upstream.subscribe_changes();
        let mut state_sub = state;

        let values_downstream = downstream.clone();
        let values_mirror = source_mirror.clone();
        let values_state = latest_state.clone();
        let values_predicate = predicate.clone();
        let values_completion = completion.clone();

        let values_worker = spawn_task(async move {
            while let Some(event) = value_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut out = ChangeSet::empty();
                        for change in batch.iter() {
                            values_mirror.with(|mirror| match change.reason() {
                                ChangeReason::Remove => {
                                    mirror.remove(change.key());
                                }
                                _ => {
                                    mirror.add_or_update(change.key().clone(), change.current().clone());
                                }
                            });
                            let is_now = values_state.with(|state| {
                                state.as_ref().is_some_and(|s| values_predicate(change.current(), s))
                            });
                            let was = values_downstream.contains_key(change.key());
                            if change.reason() == ChangeReason::Remove {
                                if was {
                                    out.push(Change::remove(change.key().clone(), change.current().clone()));
                                }
                            } else if is_now && !was {
                                out.push(Change::add(change.key().clone(), change.current().clone()));
                            } else if !is_now && was {
                                out.push(Change::remove(change.key().clone(), change.current().clone()));
                            }
                        }
                        values_downstream.publish(out);
                    }
                    Event::Error(error) => {
                        values_downstream.fail(error);
                        return;
                    }
                    Event::Completed => break,
                }
            }
            let should_complete = values_completion.with(|c| {
                c.values_done = true;
                c.state_done
            });
            if should_complete {
                values_downstream.complete();
            }
        });

        let state_downstream = downstream.clone();
        let state_mirror = source_mirror;
        let state_latest = latest_state;
        let state_predicate = predicate;
        let state_completion = completion;

        let state_worker = spawn_task(async move {
            while let Some(event) = state_sub.next().await {
                match event {
                    Event::Next(new_state) => {
                        state_latest.with(|s| *s = Some(new_state.clone()));
                        state_completion.with(|c| c.state_was_ever_valid = true);
                        let mut out = ChangeSet::empty();
                        state_mirror.with(|mirror| {
                            for (key, value) in mirror.key_values() {
                                let is_now = state_predicate(value, &new_state);
                                let was = state_downstream.contains_key(key);
                                if is_now && !was {
                                    out.push(Change::add(key.clone(), value.clone()));
                                } else if !is_now && was {
                                    out.push(Change::remove(key.clone(), value.clone()));
                                }
                            }
                        });
                        state_downstream.publish(out);
                    }
                    Event::Error(error) => {
                        state_downstream.fail(error);
                        return;
                    }
                    Event::Completed => break,
                }
            }
            let should_complete = state_completion.with(|c| {
                c.state_done = true;
                c.values_done || (suppress_until_valid && !c.state_was_ever_valid)
            });
            if should_complete {
                state_downstream.complete();
            }
        });

        Arc::new(Self { downstream, _values_worker: values_worker, _state_worker: state_worker })
    }
}

impl<K, V> ChangeStream<K, V> for DynamicFilter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
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
    async fn add_passes_through_when_predicate_holds() {
        let source: SourceCache<i32, i32> = SourceCache::new();
        let filter = Filter::new(Arc::new(source) as Arc<dyn ChangeStream<i32, i32>>, |_, v| *v < 5);
        let sub = filter.subscribe_changes();
        let sets = collect(sub, 1).await;
        assert!(sets[0].is_empty());
    }

    #[tokio::test]
    async fn update_flips_membership_both_ways() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        source.edit(|u| u.add_or_update(1, 3));
        let filter = Filter::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |_, v| *v < 5);
        let sub = filter.subscribe_changes();

        source.edit(|u| u.add_or_update(1, 10));

        // sets[0] is the subscription's own (empty) synthetic snapshot, taken before the
        // background worker has replayed anything from upstream.
        let sets = collect(sub, 3).await;
        assert_eq!(sets[1].iter().next().unwrap().reason(), ChangeReason::Add);
        assert_eq!(sets[2].iter().next().unwrap().reason(), ChangeReason::Remove);
    }
}
