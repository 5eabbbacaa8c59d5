//! Groups a keyed stream by a derived group key, each group itself exposed as a nested keyed
//! observable, plus an immutable-aggregate variant and a variant whose selector can change at
//! runtime.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
};

/// Derives the group key for a value.
pub type GroupSelector<V, G> = Arc<dyn Fn(&V) -> G + Send + Sync>;

/// A single group's membership, exposed as a nested keyed observable over the same `(K, V)`
/// space as the outer stream.
pub struct Group<K, V> {
    downstream: Arc<Downstream<K, V>>,
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new() -> Arc<Self> {
        Arc::new(Self { downstream: Arc::new(Downstream::new()) })
    }

    fn is_empty(&self) -> bool {
        self.downstream.snapshot().is_empty()
    }
}

impl<K, V> ChangeStream<K, V> for Group<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, V>> {
        self.downstream.subscribe()
    }
}

/// Moves `key` between groups (or within the same group) in response to one source change,
/// creating or tearing down outer group entries as membership becomes non-empty or empty.
fn apply_member_change<K, V, G>(
    groups: &mut HashMap<G, Arc<Group<K, V>>>,
    membership: &mut HashMap<K, G>,
    outer: &Downstream<G, Arc<Group<K, V>>>,
    selector: &GroupSelector<V, G>,
    change: Change<K, V>,
    outer_out: &mut ChangeSet<G, Arc<Group<K, V>>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    let key = change.key().clone();
    let reason = change.reason();

    if reason == ChangeReason::Remove {
        if let Some(old_group) = membership.remove(&key) {
            remove_from_group(groups, outer, &old_group, key, change.current().clone(), outer_out);
        }
        return;
    }
    if reason == ChangeReason::Moved {
        return;
    }

    let value = change.current().clone();
    let new_group = selector(&value);
    let old_group = membership.get(&key).cloned();

    match old_group {
        Some(old_group) if old_group == new_group => {
            let group = ensure_group(groups, outer, &new_group, outer_out);
            let previous = group.downstream.lookup(&key);
            let member_change = match (reason, previous) {
                (ChangeReason::Refresh, _) => Change::refresh(key, value),
                (_, Some(prev)) => Change::update(key, value, prev),
                (_, None) => Change::add(key, value),
            };
            group.downstream.publish(ChangeSet::new(vec![member_change]));
        }
        Some(old_group) => {
            remove_from_group(groups, outer, &old_group, key.clone(), value.clone(), outer_out);
            membership.insert(key.clone(), new_group.clone());
            let group = ensure_group(groups, outer, &new_group, outer_out);
            group.downstream.publish(ChangeSet::new(vec![Change::add(key, value)]));
        }
        None => {
            membership.insert(key.clone(), new_group.clone());
            let group = ensure_group(groups, outer, &new_group, outer_out);
            group.downstream.publish(ChangeSet::new(vec![Change::add(key, value)]));
        }
    }
}

fn ensure_group<K, V, G>(
    groups: &mut HashMap<G, Arc<Group<K, V>>>,
    outer: &Downstream<G, Arc<Group<K, V>>>,
    group_key: &G,
    outer_out: &mut ChangeSet<G, Arc<Group<K, V>>>,
) -> Arc<Group<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    if let Some(existing) = groups.get(group_key) {
        return existing.clone();
    }
    let group = Group::new();
    groups.insert(group_key.clone(), group.clone());
    outer_out.push(Change::add(group_key.clone(), group.clone()));
    group
}

fn remove_from_group<K, V, G>(
    groups: &mut HashMap<G, Arc<Group<K, V>>>,
    outer: &Downstream<G, Arc<Group<K, V>>>,
    group_key: &G,
    key: K,
    value: V,
    outer_out: &mut ChangeSet<G, Arc<Group<K, V>>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    let Some(group) = groups.get(group_key).cloned() else { return };
    let previous = group.downstream.lookup(&key).unwrap_or(value);
    group.downstream.publish(ChangeSet::new(vec![Change::remove(key, previous)]));
    if group.is_empty() {
        groups.remove(group_key);
        if let Some(prev) = outer.lookup(group_key) {
            outer_out.push(Change::remove(group_key.clone(), prev));
        }
    }
}

/// Groups a keyed stream by `g(v)`. Each group is itself a nested [`ChangeStream`] over the
/// member entries; the outer stream emits `Add`/`Remove` as groups are created and emptied.
pub struct GroupOn<K, V, G> {
    downstream: Arc<Downstream<G, Arc<Group<K, V>>>>,
    _worker: TaskHandle<()>,
}

impl<K, V, G> GroupOn<K, V, G>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Builds the operator. `regroup`, if supplied, forces every current entry to be
    /// re-evaluated as a synthetic `Refresh` each time it emits, moving entries whose group has
    /// changed since the last evaluation.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        selector: GroupSelector<V, G>,
        regroup: Option<Subscription<()>>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();
        let worker_selector = selector.clone();

        let worker = spawn_task(async move {
            let mut groups: HashMap<G, Arc<Group<K, V>>> = HashMap::new();
            let mut membership: HashMap<K, G> = HashMap::new();
            let mut values: crate::cache::Cache<K, V> = crate::cache::Cache::new();

            let mut regroup_sub = regroup;
            loop {
                let mut outer_out = ChangeSet::empty();
                let has_regroup = regroup_sub.is_some();
                tokio::select! {
                    event = upstream_sub.next() => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch.iter() {
                                    if change.reason() != ChangeReason::Remove {
                                        values.add_or_update(change.key().clone(), change.current().clone());
                                    } else {
                                        values.remove(change.key());
                                    }
                                }
                                for change in batch {
                                    apply_member_change(&mut groups, &mut membership, &worker_downstream, &worker_selector, change, &mut outer_out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => { worker_downstream.complete(); return; }
                        }
                    }
                    event = next_regroup(&mut regroup_sub), if has_regroup => {
                        if event.is_none() {
                            regroup_sub = None;
                            continue;
                        }
                        let entries: Vec<(K, V)> = values.key_values().map(|(k, v)| (k.clone(), v.clone())).collect();
                        for (key, value) in entries {
                            let change = Change::refresh(key, value);
                            apply_member_change(&mut groups, &mut membership, &worker_downstream, &worker_selector, change, &mut outer_out);
                        }
                    }
                }
                worker_downstream.publish(outer_out);
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

async fn next_regroup(sub: &mut Option<Subscription<()>>) -> Option<()> {
    match sub {
        Some(s) => match s.next().await {
            Some(Event::Next(())) => Some(()),
            _ => None,
        },
        None => std::future::pending().await,
    }
}

impl<K, V, G> ChangeStream<G, Arc<Group<K, V>>> for GroupOn<K, V, G>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<G, Arc<Group<K, V>>>> {
        self.downstream.subscribe()
    }
}

/// Derives an immutable aggregate value for a group from its current members.
pub type GroupAggregate<K, V, Agg> = Arc<dyn Fn(&[(K, V)]) -> Agg + Send + Sync>;

/// Like [`GroupOn`], but each group is collapsed to an immutable aggregate snapshot recomputed
/// whenever the group's membership changes, rather than exposed as a nested stream.
pub struct GroupOnImmutable<K, V, G, Agg> {
    downstream: Arc<Downstream<G, Agg>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V, G, Agg> GroupOnImmutable<K, V, G, Agg>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
    Agg: Clone + Send + Sync + 'static,
{
    /// Builds the operator.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        selector: GroupSelector<V, G>,
        aggregate: GroupAggregate<K, V, Agg>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut members: HashMap<G, Vec<(K, V)>> = HashMap::new();
            let mut membership: HashMap<K, G> = HashMap::new();

            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut affected: Vec<G> = Vec::new();
                        for change in batch {
                            let key = change.key().clone();
                            let old_group = membership.get(&key).cloned();
                            match change.reason() {
                                ChangeReason::Remove => {
                                    if let Some(g) = membership.remove(&key) {
                                        if let Some(list) = members.get_mut(&g) {
                                            list.retain(|(k, _)| k != &key);
                                        }
                                        if !affected.contains(&g) {
                                            affected.push(g);
                                        }
                                    }
                                }
                                ChangeReason::Moved => {}
                                _ => {
                                    let value = change.current().clone();
                                    let new_group = selector(&value);
                                    if let Some(old) = &old_group {
                                        if old != &new_group {
                                            if let Some(list) = members.get_mut(old) {
                                                list.retain(|(k, _)| k != &key);
                                            }
                                            if !affected.contains(old) {
                                                affected.push(old.clone());
                                            }
                                        }
                                    }
                                    let list = members.entry(new_group.clone()).or_default();
                                    if let Some(slot) = list.iter_mut().find(|(k, _)| k == &key) {
                                        slot.1 = value;
                                    } else {
                                        list.push((key.clone(), value));
                                    }
                                    membership.insert(key, new_group.clone());
                                    if !affected.contains(&new_group) {
                                        affected.push(new_group);
                                    }
                                }
                            }
                        }
                        let mut out = ChangeSet::empty();
                        for group_key in affected {
                            match members.get(&group_key) {
                                Some(list) if !list.is_empty() => {
                                    let value = aggregate(list);
                                    match worker_downstream.lookup(&group_key) {
                                        Some(prev) => out.push(Change::update(group_key, value, prev)),
                                        None => out.push(Change::add(group_key, value)),
                                    }
                                }
                                _ => {
                                    members.remove(&group_key);
                                    if let Some(prev) = worker_downstream.lookup(&group_key) {
                                        out.push(Change::remove(group_key, prev));
                                    }
                                }
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

impl<K, V, G, Agg> ChangeStream<G, Agg> for GroupOnImmutable<K, V, G, Agg>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
    Agg: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<G, Agg>> {
        self.downstream.subscribe()
    }
}

/// A selector change for [`DynamicGrouper`]: a new `g: V → G` to re-evaluate every entry under.
pub type DynamicSelector<V, G> = GroupSelector<V, G>;

/// Like [`GroupOn`], but the selector itself can change at runtime via `selector_changes`. On a
/// new selector, every currently-seen entry is re-evaluated in one atomic pass and the fallout is
/// published as a single aggregated outer change set, rather than one change set per moved entry.
pub struct DynamicGrouper<K, V, G> {
    downstream: Arc<Downstream<G, Arc<Group<K, V>>>>,
    _worker: TaskHandle<()>,
}

impl<K, V, G> DynamicGrouper<K, V, G>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Builds the operator. Blocks on the first selector before processing any upstream changes,
    /// since there is no groups to evaluate against before one exists.
    pub fn new(
        upstream: Arc<dyn ChangeStream<K, V>>,
        initial_selector: GroupSelector<V, G>,
        mut selector_changes: Subscription<GroupSelector<V, G>>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut groups: HashMap<G, Arc<Group<K, V>>> = HashMap::new();
            let mut membership: HashMap<K, G> = HashMap::new();
            let mut values: crate::cache::Cache<K, V> = crate::cache::Cache::new();
            let mut selector = initial_selector;

            loop {
                let mut outer_out = ChangeSet::empty();
                tokio::select! {
                    event = upstream_sub.next() => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch.iter() {
                                    if change.reason() != ChangeReason::Remove {
                                        values.add_or_update(change.key().clone(), change.current().clone());
                                    } else {
                                        values.remove(change.key());
                                    }
                                }
                                for change in batch {
                                    apply_member_change(&mut groups, &mut membership, &worker_downstream, &selector, change, &mut outer_out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => { worker_downstream.complete(); return; }
                        }
                    }
                    event = selector_changes.next() => {
                        match event {
                            Some(Event::Next(new_selector)) => {
                                selector = new_selector;
                                let entries: Vec<(K, V)> = values.key_values().map(|(k, v)| (k.clone(), v.clone())).collect();
                                for (key, value) in entries {
                                    let change = Change::refresh(key, value);
                                    apply_member_change(&mut groups, &mut membership, &worker_downstream, &selector, change, &mut outer_out);
                                }
                            }
                            Some(Event::Error(_)) | Some(Event::Completed) | None => {}
                        }
                    }
                }
                worker_downstream.publish(outer_out);
            }
        });

        Arc::new(Self { downstream, _worker: worker })
    }
}

impl<K, V, G> ChangeStream<G, Arc<Group<K, V>>> for DynamicGrouper<K, V, G>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    G: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<G, Arc<Group<K, V>>>> {
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
    async fn entries_move_groups_when_selector_changes_outcome() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        source.edit(|u| u.add_or_update(1, 4));
        let selector: GroupSelector<i32, bool> = Arc::new(|v| v % 2 == 0);
        let grouped = GroupOn::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, selector, None);
        let sub = grouped.subscribe_changes();

        source.edit(|u| u.add_or_update(1, 5));

        // sets[0]: empty synthetic snapshot. sets[1]: group `true` created with member 1.
        // sets[2]: group `true` emptied (removed outer) as member 1 moves to group `false`,
        // which is created in the same change set.
        let sets = collect(sub, 3).await;
        assert_eq!(sets[1].len(), 1);
        assert_eq!(sets[1].iter().next().unwrap().key(), &true);
        assert_eq!(sets[2].len(), 2);
    }

    #[tokio::test]
    async fn immutable_group_aggregates_member_count() {
        let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
        let selector: GroupSelector<i32, bool> = Arc::new(|v| v % 2 == 0);
        let aggregate: GroupAggregate<i32, i32, usize> = Arc::new(|members| members.len());
        let grouped = GroupOnImmutable::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, selector, aggregate);
        let sub = grouped.subscribe_changes();

        source.edit(|u| {
            u.add_or_update(1, 2);
            u.add_or_update(2, 4);
        });

        let sets = collect(sub, 2).await;
        let change = sets[1].iter().next().unwrap();
        assert_eq!(*change.key(), true);
        assert_eq!(*change.current(), 2);
    }
}
