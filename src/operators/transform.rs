//! Per-entry value transformation, with and without visibility into the previous value, plus
//! forced re-evaluation via an injected refresh signal and mapping each entry to a per-entry
//! sub-observable rather than to a value directly.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    error::{Error, OperatorError, Result},
    observable::{Event, Observable, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, AcknowledgedMessage, TaskHandle},
    sync::Gate,
};

/// A predicate carried on the forced-refresh injection stream: entries for which it holds are
/// re-evaluated as though the source emitted a `Refresh` for them, per the forced transform
/// design.
pub type ForceSignal<K, V> = Arc<dyn Fn(&V, &K) -> bool + Send + Sync>;

/// Maps each entry through `f`, which observes the entry's previous value when one exists. A
/// shadow cache of source values is kept so a forced refresh (see [`Transform::with_forcing`])
/// can re-invoke `f` with the right `previous` argument.
pub struct Transform<K, V, V2> {
    downstream: Arc<Downstream<K, V2>>,
    _worker: TaskHandle<()>,
    _force_worker: Option<TaskHandle<()>>,
    _marker: std::marker::PhantomData<V>,
}

type TransformFn<K, V, V2> = Arc<dyn Fn(&V, Option<&V>, &K) -> Result<V2> + Send + Sync>;
type ErrorCallback<K, V> = Arc<dyn Fn(OperatorError<K, V>) + Send + Sync>;

impl<K, V, V2> Transform<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    /// Builds a transform with no forced-refresh injection.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        f: impl Fn(&V, Option<&V>, &K) -> Result<V2> + Send + Sync + 'static,
        error_callback: Option<ErrorCallback<K, V>>,
    ) -> Arc<Self> {
        Self::build(upstream, Arc::new(f), error_callback, None)
    }

    /// Builds a transform that additionally re-invokes `f` for any currently-cached entry for
    /// which a predicate arriving on `force` holds, synthesizing a forced `Refresh`.
    pub fn with_forcing(
        upstream: Arc<dyn ChangeStream<K, V>>,
        f: impl Fn(&V, Option<&V>, &K) -> Result<V2> + Send + Sync + 'static,
        error_callback: Option<ErrorCallback<K, V>>,
        force: Subscription<ForceSignal<K, V>>,
    ) -> Arc<Self> {
        Self::build(upstream, Arc::new(f), error_callback, Some(force))
    }

    fn build(
        upstream: Arc<dyn ChangeStream<K, V>>,
        f: TransformFn<K, V, V2>,
        error_callback: Option<ErrorCallback<K, V>>,
        force: Option<Subscription<ForceSignal<K, V>>>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let source_mirror: Arc<Gate<Cache<K, V>>> = Arc::new(Gate::new(Cache::new()));

        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let worker_mirror = source_mirror.clone();
        let worker_f = f.clone();
        let worker_errors = error_callback.clone();

        let worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut out = ChangeSet::empty();
                        for change in batch {
                            apply_one(&worker_mirror, &worker_downstream, &worker_f, &worker_errors, change, &mut out);
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

        let force_worker = force.map(|mut force_sub| {
            let force_downstream = downstream.clone();
            let force_mirror = source_mirror;
            let force_f = f;
            let force_errors = error_callback;
            spawn_task(async move {
                while let Some(event) = force_sub.next().await {
                    let Event::Next(predicate) = event else { break };
                    let mut out = ChangeSet::empty();
                    let forced: Vec<(K, V)> = force_mirror.with(|mirror| {
                        mirror.key_values().filter(|&(k, v)| predicate(v, k)).map(|(k, v)| (k.clone(), v.clone())).collect()
                    });
                    for (key, value) in forced {
                        let change = Change::refresh(key, value);
                        apply_one(&force_mirror, &force_downstream, &force_f, &force_errors, change, &mut out);
                    }
                    force_downstream.publish(out);
                }
            })
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _force_worker: force_worker,
            _marker: std::marker::PhantomData,
        })
    }
}

fn apply_one<K, V, V2>(
    source_mirror: &Gate<Cache<K, V>>,
    downstream: &Downstream<K, V2>,
    f: &TransformFn<K, V, V2>,
    error_callback: &Option<ErrorCallback<K, V>>,
    change: Change<K, V>,
    out: &mut ChangeSet<K, V2>,
) where
    K: Eq + Hash + Clone,
    V: Clone,
    V2: Clone,
{
    let reason = change.reason();
    let key = change.key().clone();

    match reason {
        ChangeReason::Remove => {
            source_mirror.with(|mirror| mirror.remove(&key));
            if let Some(previous) = downstream.lookup(&key) {
                out.push(Change::remove(key, previous));
            }
        }
        ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
            let previous_source = source_mirror.with(|mirror| mirror.lookup(&key).cloned());
            let (current, declared_previous) = {
                let (_, current, previous) = change.into_parts();
                (current, previous)
            };
            source_mirror.with(|mirror| mirror.add_or_update(key.clone(), current.clone()));

            match f(&current, previous_source.as_ref().or(declared_previous.as_ref()), &key) {
                Ok(transformed) => {
                    let previous_out = downstream.lookup(&key);
                    match (reason, previous_out) {
                        (ChangeReason::Add, None) => out.push(Change::add(key, transformed)),
                        (ChangeReason::Add, Some(prev)) => out.push(Change::update(key, transformed, prev)),
                        (ChangeReason::Update, Some(prev)) => out.push(Change::update(key, transformed, prev)),
                        (ChangeReason::Update, None) => out.push(Change::add(key, transformed)),
                        (ChangeReason::Refresh, Some(prev)) => out.push(Change::update(key, transformed, prev)),
                        (ChangeReason::Refresh, None) => out.push(Change::add(key, transformed)),
                        _ => unreachable!(),
                    }
                }
                Err(cause) => {
                    if let Some(callback) = error_callback {
                        callback(OperatorError::new(cause, key, Some(current)));
                    }
                }
            }
        }
        ChangeReason::Moved => out.push(Change::moved(key, change.into_parts().1)),
    }
}

impl<K, V, V2> ChangeStream<K, V2> for Transform<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V2>> {
        self.downstream.subscribe()
    }
}

/// Maps each entry through `f`, which sees only the current value — no shadow cache of source
/// values is needed since an `Update`'s destination previous is computed by re-applying `f` to
/// the upstream change's own `previous` field rather than consulting any local state.
pub struct TransformImmutable<K, V, V2> {
    downstream: Arc<Downstream<K, V2>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V, V2> TransformImmutable<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    /// Builds the transform.
    pub fn new(upstream: Arc<dyn ChangeStream<K, V>>, f: impl Fn(&V, &K) -> V2 + Send + Sync + 'static) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut out = ChangeSet::empty();
                        for change in batch {
                            let key = change.key().clone();
                            let reason = change.reason();
                            let (_, current, previous) = change.into_parts();
                            let transformed = f(&current, &key);
                            match reason {
                                ChangeReason::Add => out.push(Change::add(key, transformed)),
                                ChangeReason::Update => {
                                    let previous = previous.expect("Update always carries a previous value");
                                    out.push(Change::update(key, transformed, f(&previous, &key)));
                                }
                                ChangeReason::Remove => out.push(Change::remove(key, transformed)),
                                ChangeReason::Refresh => out.push(Change::refresh(key, transformed)),
                                ChangeReason::Moved => out.push(Change::moved(key, transformed)),
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

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<K, V, V2> ChangeStream<K, V2> for TransformImmutable<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V2>> {
        self.downstream.subscribe()
    }
}

/// Per-entry factory from a source value to the sub-observable that will drive that entry's
/// transformed value, used by [`TransformOnObservable`].
pub type SubObservableFn<K, V, V2> = Arc<dyn Fn(&V, &K) -> Arc<dyn Observable<V2>> + Send + Sync>;

/// Maps each source entry through `f` to a per-entry sub-observable, rather than to a value
/// directly; the transformed downstream value for a key tracks whatever that sub-observable most
/// recently emitted. An `Add` (or `Update`/`Refresh`) subscribes a fresh sub-observable for the
/// entry, tearing down any sub-observable previously subscribed for that key; a `Remove` tears
/// down the sub-observable without waiting for it to emit anything further.
///
/// Sub-emissions arrive on a background task per key, funneled through one channel into the
/// worker loop alongside upstream batches. Each funneled emission is wrapped so the forwarding
/// task waits for the worker to apply it to downstream state before asking its sub-observable for
/// the next one — this keeps a single source entry's sub-observable from building up a backlog of
/// unapplied emissions, and keeps the worker from ever publishing a batch while it still owes a
/// change for work already underway.
pub struct TransformOnObservable<K, V, V2> {
    downstream: Arc<Downstream<K, V2>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V, V2> TransformOnObservable<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    /// Builds the operator. `factory` is invoked once per `Add`/`Update`/`Refresh` to obtain the
    /// sub-observable for that entry's current value.
    pub fn new(upstream: Arc<dyn ChangeStream<K, V>>, factory: SubObservableFn<K, V, V2>) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<AcknowledgedMessage<(K, u64, V2)>>();

        let worker = spawn_task(async move {
            let mut children: HashMap<K, TaskHandle<()>> = HashMap::new();
            // Tags each key's current sub-observable generation, so an emission forwarded just
            // before a task's abort takes effect is recognized as stale and dropped rather than
            // resurrecting an entry that was already removed.
            let mut generation: HashMap<K, u64> = HashMap::new();
            let mut pending: u64 = 0;
            let mut out = ChangeSet::empty();

            loop {
                tokio::select! {
                    event = upstream_sub.next() => {
                        match event {
                            Some(Event::Next(batch)) => {
                                pending += 1;
                                for change in batch {
                                    let key = change.key().clone();
                                    match change.reason() {
                                        ChangeReason::Remove => {
                                            children.remove(&key);
                                            generation.remove(&key);
                                            if let Some(previous) = worker_downstream.lookup(&key) {
                                                out.push(Change::remove(key, previous));
                                            }
                                        }
                                        ChangeReason::Moved => {}
                                        ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                                            let value = change.into_parts().1;
                                            let sub_observable = factory(&value, &key);
                                            let entry = generation.entry(key.clone()).or_insert(0);
                                            *entry += 1;
                                            let my_generation = *entry;
                                            let forward_tx = emit_tx.clone();
                                            let forward_key = key.clone();
                                            let handle = spawn_task(async move {
                                                let mut sub = sub_observable.subscribe();
                                                while let Some(event) = sub.next().await {
                                                    let item = match event {
                                                        Event::Next(item) => item,
                                                        Event::Error(_) | Event::Completed => break,
                                                    };
                                                    let (message, ack) = AcknowledgedMessage::package((
                                                        forward_key.clone(),
                                                        my_generation,
                                                        item,
                                                    ));
                                                    if forward_tx.send(message).is_err() {
                                                        break;
                                                    }
                                                    if ack.wait().await.is_none() {
                                                        break;
                                                    }
                                                }
                                            });
                                            children.insert(key, handle);
                                        }
                                    }
                                }
                                pending -= 1;
                                if pending == 0 && !out.is_empty() {
                                    worker_downstream.publish(std::mem::take(&mut out));
                                }
                            }
                            Some(Event::Error(error)) => {
                                worker_downstream.fail(error);
                                break;
                            }
                            Some(Event::Completed) | None => {
                                worker_downstream.complete();
                                break;
                            }
                        }
                    }
                    Some(message) = emit_rx.recv() => {
                        pending += 1;
                        let (key, message_generation, item) = message.message().clone();
                        if generation.get(&key) == Some(&message_generation) {
                            let change = match worker_downstream.lookup(&key) {
                                Some(previous) => Change::update(key, item, previous),
                                None => Change::add(key, item),
                            };
                            out.push(change);
                        }
                        message.acknowledge(());
                        pending -= 1;
                        if pending == 0 && !out.is_empty() {
                            worker_downstream.publish(std::mem::take(&mut out));
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<K, V, V2> ChangeStream<K, V2> for TransformOnObservable<K, V, V2>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    V2: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V2>> {
        self.downstream.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;

    use super::*;
    use crate::{
        error::ErrorKind,
        observable::test_support::collect,
        source::SourceCache,
    };

    struct OnceObservable<T>(T);

    impl<T: Clone + Send + Sync + 'static> Observable<T> for OnceObservable<T> {
        fn subscribe(&self) -> Subscription<T> {
            let value = self.0.clone();
            Subscription::new(Box::pin(futures_util::stream::once(async move { Event::Next(value) })))
        }
    }

    #[tokio::test]
    async fn sub_observable_emission_becomes_downstream_update() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let transformed = TransformOnObservable::new(
            source.clone() as Arc<dyn ChangeStream<i32, i32>>,
            Arc::new(|v: &i32, _k: &i32| Arc::new(OnceObservable(v * 10)) as Arc<dyn Observable<i32>>),
        );
        let sub = transformed.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 4));
        // sets[0]: empty synthetic snapshot. sets[1]: the sub-observable's single emission,
        // applied as an `Add` since the key had no prior downstream value.
        let sets = collect(sub, 2).await;
        let change = sets[1].iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Add);
        assert_eq!(*change.current(), 40);
    }

    /// A sub-observable whose emissions are driven manually by the test via a broadcast sender,
    /// so that removal of the source entry can be shown to stop forwarding without depending on
    /// timing.
    struct ManualObservable(broadcast::Sender<Event<i32>>);

    impl Observable<i32> for ManualObservable {
        fn subscribe(&self) -> Subscription<i32> {
            let stream = BroadcastStream::new(self.0.subscribe()).map(|result| {
                result.unwrap_or_else(|_| {
                    Event::Error(Error::from(ErrorKind::Internal { message: "lagged".into() }))
                })
            });
            Subscription::new(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn removing_source_entry_tears_down_its_sub_observable() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let (sender, _) = broadcast::channel::<Event<i32>>(8);
        let factory_sender = sender.clone();
        let transformed = TransformOnObservable::new(
            source.clone() as Arc<dyn ChangeStream<i32, i32>>,
            Arc::new(move |_v: &i32, _k: &i32| Arc::new(ManualObservable(factory_sender.clone())) as Arc<dyn Observable<i32>>),
        );
        let sub = transformed.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 0));
        let _ = sender.send(Event::Next(7));
        // sets[0]: empty synthetic snapshot. sets[1]: the manual emission of 7.
        let sets = collect(sub, 2).await;
        assert_eq!(*sets[1].iter().next().unwrap().current(), 7);

        let sub = transformed.subscribe_changes();
        source.edit(|u| u.remove(&1));
        // sets[0]: replay of the one entry currently downstream (key 1, value 7).
        // sets[1]: the resulting removal.
        let sets = collect(sub, 2).await;
        assert_eq!(sets[1].iter().next().unwrap().reason(), ChangeReason::Remove);

        let sub = transformed.subscribe_changes();
        let _ = sender.send(Event::Next(99));
        // sets[0]: empty synthetic snapshot (key 1 no longer present). A second event should
        // never arrive: the forwarding task for key 1's sub-observable was aborted on removal.
        let outcome = tokio::time::timeout(Duration::from_millis(50), collect(sub, 2)).await;
        assert!(outcome.is_err(), "no emission should arrive for a sub-observable whose source entry was removed");
    }
}

#[cfg(test)]
mod immutable_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{observable::test_support::collect, source::SourceCache};

    #[tokio::test]
    async fn immutable_transform_doubles_values() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let doubled = TransformImmutable::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |v, _| v * 2);
        let sub = doubled.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 21));
        // sets[0] is the subscription's own empty synthetic snapshot.
        let sets = collect(sub, 2).await;
        assert_eq!(*sets[1].iter().next().unwrap().current(), 42);
    }

    #[tokio::test]
    async fn transform_with_previous_sees_prior_source_value() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        source.edit(|u| u.add_or_update(1, 1));
        let seen_prev = Arc::new(std::sync::Mutex::new(None));
        let seen_prev_for_closure = seen_prev.clone();
        let transformed = Transform::new(
            source.clone() as Arc<dyn ChangeStream<i32, i32>>,
            move |current, previous, _key| {
                *seen_prev_for_closure.lock().unwrap() = previous.copied();
                Ok(*current * 10)
            },
            None,
        );
        let sub = transformed.subscribe_changes();
        source.edit(|u| u.add_or_update(1, 2));
        // sets[0]: empty synthetic snapshot. sets[1]: replay of the upstream's own initial
        // snapshot (Add 1->1, transformed to 10). sets[2]: the live update (1->2, transformed
        // to 20).
        let sets = collect(sub, 3).await;
        assert_eq!(*sets[2].iter().next().unwrap().current(), 20);
        assert_eq!(*seen_prev.lock().unwrap(), Some(1));
    }
}
