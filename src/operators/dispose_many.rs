//! Ties a value's lifetime to its presence in a keyed stream: disposes it on `Remove`, disposes
//! the superseded value on `Update`, and disposes everything still cached when the stream ends,
//! whether it completes normally or with an error. The batches themselves pass through untouched.

use std::{hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    cache::Cache,
    change::ChangeReason,
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
};

/// A value whose lifetime is tied to its presence in a [`DisposeMany`]-wrapped stream.
pub trait Disposable {
    /// Releases whatever resource this value holds. Called at most once per value by
    /// [`DisposeMany`].
    fn dispose(&self);
}

/// Wraps an upstream change-set stream, disposing values as they leave the cache (or as the
/// stream itself ends) and otherwise forwarding every batch unchanged.
pub struct DisposeMany<K, V> {
    downstream: Arc<Downstream<K, V>>,
    _worker: TaskHandle<()>,
}

impl<K, V> DisposeMany<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + Disposable + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeStream<K, V>>) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut values: Cache<K, V> = Cache::new();

            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        for change in batch.iter() {
                            match change.reason() {
                                ChangeReason::Remove => change.current().dispose(),
                                ChangeReason::Update => {
                                    if let Some(previous) = change.previous() {
                                        previous.dispose();
                                    }
                                }
                                ChangeReason::Add | ChangeReason::Refresh | ChangeReason::Moved => {}
                            }
                        }
                        values.clone_from_change_set(&batch);
                        worker_downstream.publish(batch);
                    }
                    Event::Error(error) => {
                        for (_, value) in values.key_values() {
                            value.dispose();
                        }
                        worker_downstream.fail(error);
                        return;
                    }
                    Event::Completed => {
                        for (_, value) in values.key_values() {
                            value.dispose();
                        }
                        worker_downstream.complete();
                        return;
                    }
                }
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

impl<K, V> ChangeStream<K, V> for DisposeMany<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + Disposable + 'static,
{
    fn subscribe_changes(&self) -> Subscription<crate::change::ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{observable::test_support::collect, source::SourceCache};

    #[derive(Clone)]
    struct Tracked(Arc<AtomicUsize>);

    impl Disposable for Tracked {
        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn remove_and_update_previous_are_disposed() {
        let source: Arc<SourceCache<i32, Tracked>> = Arc::new(SourceCache::new());
        let disposed = Arc::new(AtomicUsize::new(0));

        // Subscribed while the source is still empty, so its own synthetic snapshot is trivially
        // empty and every subsequent batch is an unambiguous live event.
        let disposing = DisposeMany::new(source.clone() as Arc<dyn ChangeStream<i32, Tracked>>);
        let sub = disposing.subscribe_changes();

        source.edit(|u| u.add_or_update(1, Tracked(disposed.clone())));
        source.edit(|u| u.add_or_update(1, Tracked(disposed.clone())));
        let _sets = collect(sub, 3).await;
        assert_eq!(disposed.load(Ordering::SeqCst), 1, "update's previous value disposed once");

        source.edit(|u| u.remove(&1));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(disposed.load(Ordering::SeqCst), 2, "removed value disposed");
    }

    /// A minimal upstream whose completion this test drives directly, since [`SourceCache`] has
    /// no public way to end its own stream.
    struct FakeSource<K, V>(Arc<Downstream<K, V>>);

    impl<K, V> ChangeStream<K, V> for FakeSource<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        fn subscribe_changes(&self) -> Subscription<crate::change::ChangeSet<K, V>> {
            self.0.subscribe()
        }
    }

    #[tokio::test]
    async fn remaining_values_are_disposed_on_completion() {
        use crate::change::Change;

        let backing: Arc<Downstream<i32, Tracked>> = Arc::new(Downstream::new());
        let disposed = Arc::new(AtomicUsize::new(0));

        // Built, and subscribed to, while `backing` is still empty — its own synthesized
        // snapshot is trivially empty, so the publish below is an unambiguous live event.
        let fake: Arc<dyn ChangeStream<i32, Tracked>> = Arc::new(FakeSource(backing.clone()));
        let disposing = DisposeMany::new(fake);
        let sub = disposing.subscribe_changes();

        backing.publish(crate::change::ChangeSet::new(vec![
            Change::add(1, Tracked(disposed.clone())),
            Change::add(2, Tracked(disposed.clone())),
        ]));
        let sets = collect(sub, 2).await;
        assert_eq!(sets[1].len(), 2);

        backing.complete();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }
}
