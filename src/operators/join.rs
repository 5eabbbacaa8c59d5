//! Left/right/full/inner joins over two keyed streams, the right side carrying a foreign-key
//! selector back into the left key space.
//!
//! Each join runs its combination logic on a single task that owns both upstream subscriptions
//! directly rather than sharing a [`crate::sync::Gate`] between two worker tasks: since only one
//! task ever touches the join's state, serialization falls out of `select!` polling one branch at
//! a time rather than needing a lock. The left side is drained first during initialization so a
//! right-side entry that arrives before its left counterpart does not produce a premature,
//! incomplete emission (see the initial-batch ordering rule on [`LeftJoin::new`]).

use std::{collections::HashMap, hash::Hash, sync::Arc};

use crate::{
    cache::Cache,
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
};

/// Derives a result value for a left entry and its optional paired right entry.
pub type LeftResultSelector<L, R, Out> = Arc<dyn Fn(&L, Option<&R>) -> Out + Send + Sync>;
/// Derives a result value for a right entry and its optional paired left entry.
pub type RightResultSelector<L, R, Out> = Arc<dyn Fn(Option<&L>, &R) -> Out + Send + Sync>;
/// Derives the left-key foreign key carried by a right entry.
pub type ForeignKeySelector<R, KL> = Arc<dyn Fn(&R) -> KL + Send + Sync>;

struct JoinState<KL, L, KR, R> {
    left: Cache<KL, L>,
    right: Cache<KR, R>,
    fk_of: HashMap<KR, KL>,
    right_for_left: HashMap<KL, KR>,
}

impl<KL, L, KR, R> JoinState<KL, L, KR, R>
where
    KL: Eq + Hash + Clone,
    KR: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self { left: Cache::new(), right: Cache::new(), fk_of: HashMap::new(), right_for_left: HashMap::new() }
    }

    fn paired_right(&self, key: &KL) -> Option<&R> {
        self.right_for_left.get(key).and_then(|rk| self.right.lookup(rk))
    }

    fn paired_left(&self, rkey: &KR) -> Option<&L> {
        self.fk_of.get(rkey).and_then(|fk| self.left.lookup(fk))
    }

    /// Applies a right-side change, returning the set of left keys whose pairing may have
    /// changed as a result.
    fn apply_right_change(&mut self, change: &Change<KR, R>) -> Vec<KL>
    where
        L: Clone,
        R: Clone,
    {
        let rkey = change.key().clone();
        match change.reason() {
            ChangeReason::Remove => {
                self.right.remove(&rkey);
                if let Some(old_fk) = self.fk_of.remove(&rkey) {
                    if self.right_for_left.get(&old_fk) == Some(&rkey) {
                        self.right_for_left.remove(&old_fk);
                    }
                    vec![old_fk]
                } else {
                    Vec::new()
                }
            }
            ChangeReason::Moved => Vec::new(),
            _ => Vec::new(),
        }
    }
}

/// Keyed by the left key; each entry pairs a left value with at most one right entry (the most
/// recent right entry observed whose foreign key currently resolves to that left key).
pub struct LeftJoin<KL, L, KR, R, Out> {
    downstream: Arc<Downstream<KL, Out>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(L, KR, R)>,
}

impl<KL, L, KR, R, Out> LeftJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    /// Builds the join. The left side's own initial snapshot, merged with whatever right entries
    /// have arrived by the time the right side's initial snapshot is drained, becomes the join's
    /// one synthetic initial batch — the right side's initial batch never emits on its own.
    pub fn new(
        left: Arc<dyn ChangeStream<KL, L>>,
        right: Arc<dyn ChangeStream<KR, R>>,
        foreign_key: ForeignKeySelector<R, KL>,
        result_selector: LeftResultSelector<L, R, Out>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut left_sub = left.subscribe_changes();
        let mut right_sub = right.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state: JoinState<KL, L, KR, R> = JoinState::new();

            let Some(left_initial) = next_batch(&mut left_sub, &worker_downstream).await else { return };
            for change in left_initial.iter() {
                state.left.add_or_update(change.key().clone(), change.current().clone());
            }

            let Some(right_initial) = next_batch(&mut right_sub, &worker_downstream).await else { return };
            for change in right_initial.iter() {
                let rkey = change.key().clone();
                let fk = foreign_key(change.current());
                state.right.add_or_update(rkey.clone(), change.current().clone());
                state.fk_of.insert(rkey.clone(), fk.clone());
                state.right_for_left.entry(fk).or_insert(rkey);
            }

            let mut initial = ChangeSet::empty();
            for (key, value) in state.left.key_values() {
                let right = state.right_for_left.get(key).and_then(|rk| state.right.lookup(rk));
                initial.push(Change::add(key.clone(), result_selector(value, right)));
            }
            worker_downstream.publish(initial);

            let mut left_done = false;
            let mut right_done = false;
            loop {
                if left_done && right_done {
                    worker_downstream.complete();
                    break;
                }
                let mut out = ChangeSet::empty();
                tokio::select! {
                    event = left_sub.next(), if !left_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    apply_left(&mut state, &worker_downstream, &result_selector, change, &mut out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => left_done = true,
                        }
                    }
                    event = right_sub.next(), if !right_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    let affected = apply_right(&mut state, change, &foreign_key);
                                    for key in affected {
                                        recompute_left(&state, &worker_downstream, &result_selector, &key, &mut out);
                                    }
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => right_done = true,
                        }
                    }
                }
                worker_downstream.publish(out);
            }
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

async fn next_batch<K, V>(
    sub: &mut Subscription<ChangeSet<K, V>>,
    downstream: &Downstream<K, V>,
) -> Option<ChangeSet<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    use futures_util::StreamExt;
    match sub.next().await {
        Some(Event::Next(batch)) => Some(batch),
        Some(Event::Error(error)) => {
            downstream.fail(error);
            None
        }
        Some(Event::Completed) | None => Some(ChangeSet::empty()),
    }
}

fn apply_left<KL, L, KR, R, Out>(
    state: &mut JoinState<KL, L, KR, R>,
    downstream: &Downstream<KL, Out>,
    result_selector: &LeftResultSelector<L, R, Out>,
    change: Change<KL, L>,
    out: &mut ChangeSet<KL, Out>,
) where
    KL: Eq + Hash + Clone,
    L: Clone,
    KR: Eq + Hash + Clone,
    R: Clone,
    Out: Clone,
{
    let key = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => {
            state.left.remove(&key);
            if let Some(prev) = downstream.lookup(&key) {
                out.push(Change::remove(key, prev));
            }
        }
        ChangeReason::Add => {
            let value = change.current().clone();
            state.left.add_or_update(key.clone(), value.clone());
            let right = state.paired_right(&key).cloned();
            let result = result_selector(&value, right.as_ref());
            out.push(Change::add(key, result));
        }
        ChangeReason::Update => {
            let value = change.current().clone();
            state.left.add_or_update(key.clone(), value.clone());
            let right = state.paired_right(&key).cloned();
            let result = result_selector(&value, right.as_ref());
            let prev = downstream.lookup(&key).expect("left key already published before an Update");
            out.push(Change::update(key, result, prev));
        }
        ChangeReason::Refresh => {
            let value = change.current().clone();
            state.left.add_or_update(key.clone(), value.clone());
            let right = state.paired_right(&key).cloned();
            let result = result_selector(&value, right.as_ref());
            out.push(Change::refresh(key, result));
        }
        ChangeReason::Moved => {}
    }
}

fn apply_right<KL, L, KR, R>(
    state: &mut JoinState<KL, L, KR, R>,
    change: Change<KR, R>,
    foreign_key: &ForeignKeySelector<R, KL>,
) -> Vec<KL>
where
    KL: Eq + Hash + Clone,
    L: Clone,
    KR: Eq + Hash + Clone,
    R: Clone,
{
    let rkey = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => state.apply_right_change(&change),
        ChangeReason::Add => {
            let value = change.current().clone();
            let fk = foreign_key(&value);
            state.right.add_or_update(rkey.clone(), value);
            state.fk_of.insert(rkey.clone(), fk.clone());
            state.right_for_left.insert(fk.clone(), rkey);
            vec![fk]
        }
        ChangeReason::Update | ChangeReason::Refresh => {
            let value = change.current().clone();
            let new_fk = foreign_key(&value);
            let old_fk = state.fk_of.get(&rkey).cloned();
            state.right.add_or_update(rkey.clone(), value);
            state.fk_of.insert(rkey.clone(), new_fk.clone());
            let mut affected = Vec::new();
            if old_fk.as_ref() != Some(&new_fk) {
                if let Some(old_fk) = old_fk {
                    if state.right_for_left.get(&old_fk) == Some(&rkey) {
                        state.right_for_left.remove(&old_fk);
                    }
                    affected.push(old_fk);
                }
            }
            state.right_for_left.insert(new_fk.clone(), rkey);
            affected.push(new_fk);
            affected
        }
        ChangeReason::Moved => Vec::new(),
    }
}

fn recompute_left<KL, L, KR, R, Out>(
    state: &JoinState<KL, L, KR, R>,
    downstream: &Downstream<KL, Out>,
    result_selector: &LeftResultSelector<L, R, Out>,
    key: &KL,
    out: &mut ChangeSet<KL, Out>,
) where
    KL: Eq + Hash + Clone,
    R: Clone,
    Out: Clone,
{
    let Some(left_value) = state.left.lookup(key) else { return };
    let right = state.paired_right(key);
    let result = result_selector(left_value, right);
    match downstream.lookup(key) {
        Some(prev) => out.push(Change::update(key.clone(), result, prev)),
        None => out.push(Change::add(key.clone(), result)),
    }
}

impl<KL, L, KR, R, Out> ChangeStream<KL, Out> for LeftJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<KL, Out>> {
        self.downstream.subscribe()
    }
}

/// Keyed by the left key, present with a value as long as either the left entry or at least one
/// paired right entry exists. Removes the row only once both sides are absent.
pub struct FullJoin<KL, L, KR, R, Out> {
    downstream: Arc<Downstream<KL, Out>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(L, KR, R)>,
}

/// Derives a result value for a left/right pair where either side (but not both) may be absent.
pub type FullResultSelector<L, R, Out> = Arc<dyn Fn(Option<&L>, Option<&R>) -> Out + Send + Sync>;

fn apply_left_for_full<KL, L, KR, R>(state: &mut JoinState<KL, L, KR, R>, change: Change<KL, L>) -> KL
where
    KL: Eq + Hash + Clone,
    L: Clone,
    KR: Eq + Hash + Clone,
    R: Clone,
{
    let key = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => {
            state.left.remove(&key);
        }
        ChangeReason::Moved => {}
        _ => {
            state.left.add_or_update(key.clone(), change.current().clone());
        }
    }
    key
}

fn recompute_full<KL, L, KR, R, Out>(
    state: &JoinState<KL, L, KR, R>,
    downstream: &Downstream<KL, Out>,
    result_selector: &FullResultSelector<L, R, Out>,
    key: &KL,
    out: &mut ChangeSet<KL, Out>,
) where
    KL: Eq + Hash + Clone,
    L: Clone,
    R: Clone,
    Out: Clone,
{
    let left_value = state.left.lookup(key);
    let right_value = state.paired_right(key);
    match (left_value, right_value) {
        (None, None) => {
            if let Some(prev) = downstream.lookup(key) {
                out.push(Change::remove(key.clone(), prev));
            }
        }
        (left_value, right_value) => {
            let result = result_selector(left_value, right_value);
            match downstream.lookup(key) {
                Some(prev) => out.push(Change::update(key.clone(), result, prev)),
                None => out.push(Change::add(key.clone(), result)),
            }
        }
    }
}

impl<KL, L, KR, R, Out> FullJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    /// Builds the join. As with [`LeftJoin`], the right side's initial batch never emits on its
    /// own; it is folded into the one combined initial batch together with the left side's.
    pub fn new(
        left: Arc<dyn ChangeStream<KL, L>>,
        right: Arc<dyn ChangeStream<KR, R>>,
        foreign_key: ForeignKeySelector<R, KL>,
        result_selector: FullResultSelector<L, R, Out>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut left_sub = left.subscribe_changes();
        let mut right_sub = right.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state: JoinState<KL, L, KR, R> = JoinState::new();

            let Some(left_initial) = next_batch(&mut left_sub, &worker_downstream).await else { return };
            for change in left_initial.iter() {
                state.left.add_or_update(change.key().clone(), change.current().clone());
            }

            let Some(right_initial) = next_batch(&mut right_sub, &worker_downstream).await else { return };
            for change in right_initial.iter() {
                let rkey = change.key().clone();
                let fk = foreign_key(change.current());
                state.right.add_or_update(rkey.clone(), change.current().clone());
                state.fk_of.insert(rkey.clone(), fk.clone());
                state.right_for_left.entry(fk).or_insert(rkey);
            }

            let mut initial = ChangeSet::empty();
            let mut keys: Vec<KL> = state.left.keys().cloned().collect();
            for key in state.right_for_left.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            for key in &keys {
                let result = result_selector(state.left.lookup(key), state.paired_right(key));
                initial.push(Change::add(key.clone(), result));
            }
            worker_downstream.publish(initial);

            let mut left_done = false;
            let mut right_done = false;
            loop {
                if left_done && right_done {
                    worker_downstream.complete();
                    break;
                }
                let mut out = ChangeSet::empty();
                tokio::select! {
                    event = left_sub.next(), if !left_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    let key = apply_left_for_full(&mut state, change);
                                    recompute_full(&state, &worker_downstream, &result_selector, &key, &mut out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => left_done = true,
                        }
                    }
                    event = right_sub.next(), if !right_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    let affected = apply_right(&mut state, change, &foreign_key);
                                    for key in affected {
                                        recompute_full(&state, &worker_downstream, &result_selector, &key, &mut out);
                                    }
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => right_done = true,
                        }
                    }
                }
                worker_downstream.publish(out);
            }
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<KL, L, KR, R, Out> ChangeStream<KL, Out> for FullJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<KL, Out>> {
        self.downstream.subscribe()
    }
}

/// Per-right-key state shared by [`RightJoin`] and [`InnerJoin`], which both allow many right
/// entries to share the same foreign key (many-to-one).
struct ManyState<KL, L, KR, R> {
    left: Cache<KL, L>,
    right: Cache<KR, R>,
    fk_of: HashMap<KR, KL>,
    right_by_left: HashMap<KL, std::collections::HashSet<KR>>,
}

impl<KL, L, KR, R> ManyState<KL, L, KR, R>
where
    KL: Eq + Hash + Clone,
    KR: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self { left: Cache::new(), right: Cache::new(), fk_of: HashMap::new(), right_by_left: HashMap::new() }
    }

    fn link(&mut self, rkey: KR, fk: KL) {
        self.right_by_left.entry(fk).or_default().insert(rkey);
    }

    fn unlink(&mut self, rkey: &KR, fk: &KL) {
        if let Some(set) = self.right_by_left.get_mut(fk) {
            set.remove(rkey);
            if set.is_empty() {
                self.right_by_left.remove(fk);
            }
        }
    }
}

/// Keyed by the right key; symmetric to [`LeftJoin`], but a left key may pair with more than one
/// right entry since the right side drives this join's key space.
pub struct RightJoin<KL, L, KR, R, Out> {
    downstream: Arc<Downstream<KR, Out>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(KL, L, R)>,
}

impl<KL, L, KR, R, Out> RightJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    /// Builds the join. The right side drives initial emissions; the left side's initial batch is
    /// folded in first so early right entries already see their left pairing where one exists.
    pub fn new(
        left: Arc<dyn ChangeStream<KL, L>>,
        right: Arc<dyn ChangeStream<KR, R>>,
        foreign_key: ForeignKeySelector<R, KL>,
        result_selector: RightResultSelector<L, R, Out>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut left_sub = left.subscribe_changes();
        let mut right_sub = right.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state: ManyState<KL, L, KR, R> = ManyState::new();

            let Some(left_initial) = next_batch(&mut left_sub, &worker_downstream).await else { return };
            for change in left_initial.iter() {
                state.left.add_or_update(change.key().clone(), change.current().clone());
            }

            let Some(right_initial) = next_batch(&mut right_sub, &worker_downstream).await else { return };
            let mut initial = ChangeSet::empty();
            for change in right_initial.iter() {
                let rkey = change.key().clone();
                let value = change.current().clone();
                let fk = foreign_key(&value);
                state.right.add_or_update(rkey.clone(), value.clone());
                state.fk_of.insert(rkey.clone(), fk.clone());
                state.link(rkey.clone(), fk.clone());
                let result = result_selector(state.left.lookup(&fk), &value);
                initial.push(Change::add(rkey, result));
            }
            worker_downstream.publish(initial);

            let mut left_done = false;
            let mut right_done = false;
            loop {
                if left_done && right_done {
                    worker_downstream.complete();
                    break;
                }
                let mut out = ChangeSet::empty();
                tokio::select! {
                    event = left_sub.next(), if !left_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    let key = change.key().clone();
                                    match change.reason() {
                                        ChangeReason::Remove => { state.left.remove(&key); }
                                        ChangeReason::Moved => {}
                                        _ => { state.left.add_or_update(key.clone(), change.current().clone()); }
                                    }
                                    if let Some(rights) = state.right_by_left.get(&key).cloned() {
                                        for rkey in rights {
                                            let left_value = state.left.lookup(&key);
                                            let right_value = state.right.lookup(&rkey).expect("linked right entry present");
                                            let result = result_selector(left_value, right_value);
                                            let prev = worker_downstream.lookup(&rkey).expect("right entry already published");
                                            out.push(Change::update(rkey, result, prev));
                                        }
                                    }
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => left_done = true,
                        }
                    }
                    event = right_sub.next(), if !right_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    apply_right_many(&mut state, &worker_downstream, &result_selector, &foreign_key, change, &mut out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => right_done = true,
                        }
                    }
                }
                worker_downstream.publish(out);
            }
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

fn apply_right_many<KL, L, KR, R, Out>(
    state: &mut ManyState<KL, L, KR, R>,
    downstream: &Downstream<KR, Out>,
    result_selector: &RightResultSelector<L, R, Out>,
    foreign_key: &ForeignKeySelector<R, KL>,
    change: Change<KR, R>,
    out: &mut ChangeSet<KR, Out>,
) where
    KL: Eq + Hash + Clone,
    L: Clone,
    KR: Eq + Hash + Clone,
    R: Clone,
    Out: Clone,
{
    let rkey = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => {
            state.right.remove(&rkey);
            if let Some(fk) = state.fk_of.remove(&rkey) {
                state.unlink(&rkey, &fk);
            }
            if let Some(prev) = downstream.lookup(&rkey) {
                out.push(Change::remove(rkey, prev));
            }
        }
        ChangeReason::Add => {
            let value = change.current().clone();
            let fk = foreign_key(&value);
            state.right.add_or_update(rkey.clone(), value.clone());
            state.fk_of.insert(rkey.clone(), fk.clone());
            state.link(rkey.clone(), fk.clone());
            let result = result_selector(state.left.lookup(&fk), &value);
            out.push(Change::add(rkey, result));
        }
        ChangeReason::Update | ChangeReason::Refresh => {
            let value = change.current().clone();
            let new_fk = foreign_key(&value);
            let old_fk = state.fk_of.get(&rkey).cloned();
            state.right.add_or_update(rkey.clone(), value.clone());
            state.fk_of.insert(rkey.clone(), new_fk.clone());
            if old_fk.as_ref() != Some(&new_fk) {
                if let Some(old_fk) = old_fk {
                    state.unlink(&rkey, &old_fk);
                }
                state.link(rkey.clone(), new_fk.clone());
            }
            let result = result_selector(state.left.lookup(&new_fk), &value);
            match downstream.lookup(&rkey) {
                Some(prev) => out.push(Change::update(rkey, result, prev)),
                None => out.push(Change::add(rkey, result)),
            }
        }
        ChangeReason::Moved => {}
    }
}

impl<KL, L, KR, R, Out> ChangeStream<KR, Out> for RightJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<KR, Out>> {
        self.downstream.subscribe()
    }
}

/// Keyed by the `(left key, right key)` pair; emits only for pairs where both sides are present,
/// supporting many-to-one by grouping right entries under their foreign key.
pub struct InnerJoin<KL, L, KR, R, Out> {
    downstream: Arc<Downstream<(KL, KR), Out>>,
    _worker: TaskHandle<()>,
    _marker: std::marker::PhantomData<(L, R)>,
}

/// Derives a result value for a fully-paired left/right entry.
pub type InnerResultSelector<L, R, Out> = Arc<dyn Fn(&L, &R) -> Out + Send + Sync>;

impl<KL, L, KR, R, Out> InnerJoin<KL, L, KR, R, Out>
where
    KL: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    KR: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    /// Builds the join.
    pub fn new(
        left: Arc<dyn ChangeStream<KL, L>>,
        right: Arc<dyn ChangeStream<KR, R>>,
        foreign_key: ForeignKeySelector<R, KL>,
        result_selector: InnerResultSelector<L, R, Out>,
    ) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut left_sub = left.subscribe_changes();
        let mut right_sub = right.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state: ManyState<KL, L, KR, R> = ManyState::new();

            let Some(left_initial) = next_batch(&mut left_sub, &worker_downstream).await else { return };
            for change in left_initial.iter() {
                state.left.add_or_update(change.key().clone(), change.current().clone());
            }

            let Some(right_initial) = next_batch(&mut right_sub, &worker_downstream).await else { return };
            let mut initial = ChangeSet::empty();
            for change in right_initial.iter() {
                let rkey = change.key().clone();
                let value = change.current().clone();
                let fk = foreign_key(&value);
                state.right.add_or_update(rkey.clone(), value.clone());
                state.fk_of.insert(rkey.clone(), fk.clone());
                state.link(rkey.clone(), fk.clone());
                if let Some(left_value) = state.left.lookup(&fk) {
                    initial.push(Change::add((fk, rkey), result_selector(left_value, &value)));
                }
            }
            worker_downstream.publish(initial);

            let mut left_done = false;
            let mut right_done = false;
            loop {
                if left_done && right_done {
                    worker_downstream.complete();
                    break;
                }
                let mut out = ChangeSet::empty();
                tokio::select! {
                    event = left_sub.next(), if !left_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    let key = change.key().clone();
                                    let had_left = state.left.contains_key(&key);
                                    match change.reason() {
                                        ChangeReason::Remove => { state.left.remove(&key); }
                                        ChangeReason::Moved => {}
                                        _ => { state.left.add_or_update(key.clone(), change.current().clone()); }
                                    }
                                    let Some(rights) = state.right_by_left.get(&key).cloned() else { continue };
                                    for rkey in rights {
                                        let pair = (key.clone(), rkey.clone());
                                        match (had_left, state.left.lookup(&key)) {
                                            (_, Some(left_value)) => {
                                                let right_value = state.right.lookup(&rkey).expect("linked right entry present");
                                                let result = result_selector(left_value, right_value);
                                                match worker_downstream.lookup(&pair) {
                                                    Some(prev) => out.push(Change::update(pair, result, prev)),
                                                    None => out.push(Change::add(pair, result)),
                                                }
                                            }
                                            (true, None) => {
                                                if let Some(prev) = worker_downstream.lookup(&pair) {
                                                    out.push(Change::remove(pair, prev));
                                                }
                                            }
                                            (false, None) => {}
                                        }
                                    }
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => left_done = true,
                        }
                    }
                    event = right_sub.next(), if !right_done => {
                        match event {
                            Some(Event::Next(batch)) => {
                                for change in batch {
                                    apply_right_inner(&mut state, &worker_downstream, &result_selector, &foreign_key, change, &mut out);
                                }
                            }
                            Some(Event::Error(error)) => { worker_downstream.fail(error); return; }
                            Some(Event::Completed) | None => right_done = true,
                        }
                    }
                }
                worker_downstream.publish(out);
            }
        });

        Arc::new(Self {
            downstream,
            _worker: worker,
            _marker: std::marker::PhantomData,
        })
    }
}

fn apply_right_inner<KL, L, KR, R, Out>(
    state: &mut ManyState<KL, L, KR, R>,
    downstream: &Downstream<(KL, KR), Out>,
    result_selector: &InnerResultSelector<L, R, Out>,
    foreign_key: &ForeignKeySelector<R, KL>,
    change: Change<KR, R>,
    out: &mut ChangeSet<(KL, KR), Out>,
) where
    KL: Eq + Hash + Clone,
    L: Clone,
    KR: Eq + Hash + Clone,
    R: Clone,
    Out: Clone,
{
    let rkey = change.key().clone();
    match change.reason() {
        ChangeReason::Remove => {
            state.right.remove(&rkey);
            if let Some(fk) = state.fk_of.remove(&rkey) {
                state.unlink(&rkey, &fk);
                let pair = (fk, rkey);
                if let Some(prev) = downstream.lookup(&pair) {
                    out.push(Change::remove(pair, prev));
                }
            }
        }
        ChangeReason::Add => {
            let value = change.current().clone();
            let fk = foreign_key(&value);
            state.right.add_or_update(rkey.clone(), value.clone());
            state.fk_of.insert(rkey.clone(), fk.clone());
            state.link(rkey.clone(), fk.clone());
            if let Some(left_value) = state.left.lookup(&fk) {
                out.push(Change::add((fk, rkey), result_selector(left_value, &value)));
            }
        }
        ChangeReason::Update | ChangeReason::Refresh => {
            let value = change.current().clone();
            let new_fk = foreign_key(&value);
            let old_fk = state.fk_of.get(&rkey).cloned();
            state.right.add_or_update(rkey.clone(), value.clone());
            state.fk_of.insert(rkey.clone(), new_fk.clone());
            if old_fk.as_ref() != Some(&new_fk) {
                if let Some(old_fk) = old_fk {
                    state.unlink(&rkey, &old_fk);
                    let old_pair = (old_fk, rkey.clone());
                    if let Some(prev) = downstream.lookup(&old_pair) {
                        out.push(Change::remove(old_pair, prev));
                    }
                }
                state.link(rkey.clone(), new_fk.clone());
                if let Some(left_value) = state.left.lookup(&new_fk) {
                    out.push(Change::add((new_fk, rkey), result_selector(left_value, &value)));
                }
            } else if let Some(left_value) = state.left.lookup(&new_fk) {
                let pair = (new_fk, rkey);
                let result = result_selector(left_value, &value);
                match downstream.lookup(&pair) {
                    Some(prev) => out.push(Change::update(pair, result, prev)),
                    None => out.push(Change::add(pair, result)),
                }
            }
        }
        ChangeReason::Moved => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{observable::test_support::collect, source::SourceCache};

    #[tokio::test]
    async fn right_side_reparenting_updates_both_left_keys() {
        let left: Arc<SourceCache<i32, &'static str>> = Arc::new(SourceCache::new());
        left.edit(|u| {
            u.add_or_update(1, "A");
            u.add_or_update(2, "B");
        });
        let right: Arc<SourceCache<i32, (i32, &'static str)>> = Arc::new(SourceCache::new());

        let foreign_key: ForeignKeySelector<(i32, &'static str), i32> = Arc::new(|(fk, _)| *fk);
        let result_selector: LeftResultSelector<&'static str, (i32, &'static str), String> =
            Arc::new(|l, r| format!("{l}+{}", r.map(|(_, v)| *v).unwrap_or("_")));

        let join = LeftJoin::new(
            left.clone() as Arc<dyn ChangeStream<i32, &'static str>>,
            right.clone() as Arc<dyn ChangeStream<i32, (i32, &'static str)>>,
            foreign_key,
            result_selector,
        );
        let sub = join.subscribe_changes();

        right.edit(|u| u.add_or_update(10, (1, "x")));
        right.edit(|u| u.add_or_update(10, (2, "x")));

        // sets[0]: the subscription's own empty synthetic snapshot, taken before the worker has
        // run. sets[1]: the join's real combined initial batch (both lefts unpaired). sets[2]:
        // the right add pairs key 1. sets[3]: the fk change re-pairs both key 1 (now unpaired)
        // and key 2 (now paired) in one change set.
        let sets = collect(sub, 4).await;
        assert_eq!(sets[1].len(), 2);
        let after_add = sets[2].iter().next().unwrap();
        assert_eq!(*after_add.key(), 1);
        assert_eq!(*after_add.current(), "A+x");

        assert_eq!(sets[3].len(), 2);
        let keys: Vec<_> = sets[3].iter().map(|c| *c.key()).collect();
        assert!(keys.contains(&1));
        assert!(keys.contains(&2));
    }
}
