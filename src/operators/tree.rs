//! Builds a tree over a keyed stream from a parent-key selector: each entry becomes a node whose
//! children are the entries whose selected parent key is this node's key. A node whose selected
//! parent key has no corresponding entry is an orphan and surfaces at the tree root instead.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use futures_util::StreamExt;

use crate::{
    change::{Change, ChangeReason, ChangeSet},
    observable::{Event, Subscription},
    operators::{ChangeStream, Downstream},
    runtime::{spawn_task, TaskHandle},
    sync::Gate,
};

/// Derives the parent key for a value. The returned key need not currently exist upstream; a node
/// whose parent key is absent is surfaced at the tree root until a matching entry appears.
pub type ParentSelector<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

/// One tree node: the current value plus an observable sub-cache of this node's children, keyed
/// the same way as the tree itself. Stable for the node's lifetime — moving between parents
/// mutates this node's own bookkeeping rather than replacing it.
pub struct TreeNode<K, V> {
    key: K,
    value: Gate<V>,
    parent: Gate<Option<K>>,
    children: Arc<Downstream<K, Arc<TreeNode<K, V>>>>,
}

impl<K, V> TreeNode<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(key: K, value: V) -> Arc<Self> {
        Arc::new(Self { key, value: Gate::new(value), parent: Gate::new(None), children: Arc::new(Downstream::new()) })
    }

    /// This node's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// This node's current value.
    pub fn value(&self) -> V {
        self.value.with(|v| v.clone())
    }

    /// The node's current parent key, or `None` if it is an orphan surfaced at the tree root.
    pub fn parent(&self) -> Option<K> {
        self.parent.with(|p| p.clone())
    }
}

impl<K, V> ChangeStream<K, Arc<TreeNode<K, V>>> for TreeNode<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, Arc<TreeNode<K, V>>>> {
        self.children.subscribe()
    }
}

struct TreeState<K, V> {
    nodes: HashMap<K, Arc<TreeNode<K, V>>>,
    desired_parent: HashMap<K, K>,
    children_of: HashMap<K, Vec<K>>,
}

impl<K: Eq + Hash + Clone, V> TreeState<K, V> {
    fn new() -> Self {
        Self { nodes: HashMap::new(), desired_parent: HashMap::new(), children_of: HashMap::new() }
    }

    /// The key's effective parent: its selected parent key, if an entry for that key currently
    /// exists and isn't the key itself.
    fn effective_parent(&self, key: &K) -> Option<K> {
        self.desired_parent.get(key).cloned().filter(|p| p != key && self.nodes.contains_key(p))
    }

    fn set_desired_parent(&mut self, key: &K, new_parent: K) {
        let old = self.desired_parent.insert(key.clone(), new_parent.clone());
        if old.as_ref() == Some(&new_parent) {
            return;
        }
        if let Some(old_parent) = old {
            if let Some(list) = self.children_of.get_mut(&old_parent) {
                list.retain(|k| k != key);
            }
        }
        self.children_of.entry(new_parent).or_default().push(key.clone());
    }
}

/// Moves `key`'s node between its old and new effective parent (root included), or, if the
/// location is unchanged, republishes it there so observers see the updated value.
fn place_node<K, V>(
    state: &TreeState<K, V>,
    root: &Downstream<K, Arc<TreeNode<K, V>>>,
    key: &K,
    root_out: &mut ChangeSet<K, Arc<TreeNode<K, V>>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let Some(node) = state.nodes.get(key) else { return };
    let new_parent = state.effective_parent(key);
    let old_parent = node.parent();

    if old_parent == new_parent {
        match &new_parent {
            Some(parent_key) => {
                if let Some(parent_node) = state.nodes.get(parent_key) {
                    republish(&parent_node.children, key, node);
                }
            }
            None => republish_root(root, root_out, key, node),
        }
        return;
    }

    match &old_parent {
        Some(parent_key) => {
            if let Some(parent_node) = state.nodes.get(parent_key) {
                if let Some(prev) = parent_node.children.lookup(key) {
                    parent_node.children.publish(ChangeSet::new(vec![Change::remove(key.clone(), prev)]));
                }
            }
        }
        None => {
            if let Some(prev) = root.lookup(key) {
                root_out.push(Change::remove(key.clone(), prev));
            }
        }
    }

    node.parent.with(|p| *p = new_parent.clone());

    match &new_parent {
        Some(parent_key) => {
            if let Some(parent_node) = state.nodes.get(parent_key) {
                parent_node.children.publish(ChangeSet::new(vec![Change::add(key.clone(), node.clone())]));
            }
        }
        None => root_out.push(Change::add(key.clone(), node.clone())),
    }
}

fn republish<K, V>(children: &Downstream<K, Arc<TreeNode<K, V>>>, key: &K, node: &Arc<TreeNode<K, V>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let change = match children.lookup(key) {
        Some(_) => Change::refresh(key.clone(), node.clone()),
        None => Change::add(key.clone(), node.clone()),
    };
    children.publish(ChangeSet::new(vec![change]));
}

fn republish_root<K, V>(
    root: &Downstream<K, Arc<TreeNode<K, V>>>,
    root_out: &mut ChangeSet<K, Arc<TreeNode<K, V>>>,
    key: &K,
    node: &Arc<TreeNode<K, V>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    match root.lookup(key) {
        Some(_) => root_out.push(Change::refresh(key.clone(), node.clone())),
        None => root_out.push(Change::add(key.clone(), node.clone())),
    }
}

/// Builds a tree from a keyed stream, per [`ParentSelector`]. The outer stream exposes the root
/// nodes (those with no live parent); each node's own children are reached through
/// [`TreeNode::subscribe_changes`] on that node.
pub struct TreeBuilder<K, V> {
    downstream: Arc<Downstream<K, Arc<TreeNode<K, V>>>>,
    _worker: TaskHandle<()>,
}

impl<K, V> TreeBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeStream<K, V>>, selector: ParentSelector<K, V>) -> Arc<Self> {
        let downstream = Arc::new(Downstream::new());
        let mut upstream_sub = upstream.subscribe_changes();
        let worker_downstream = downstream.clone();

        let worker = spawn_task(async move {
            let mut state: TreeState<K, V> = TreeState::new();

            while let Some(event) = upstream_sub.next().await {
                match event {
                    Event::Next(batch) => {
                        let mut root_out = ChangeSet::empty();
                        let mut touched: Vec<K> = Vec::new();

                        for change in batch {
                            let key = change.key().clone();
                            match change.reason() {
                                ChangeReason::Remove => {
                                    if let Some(node) = state.nodes.remove(&key) {
                                        match node.parent() {
                                            Some(parent_key) => {
                                                if let Some(parent_node) = state.nodes.get(&parent_key) {
                                                    if let Some(prev) = parent_node.children.lookup(&key) {
                                                        parent_node.children.publish(ChangeSet::new(vec![Change::remove(key.clone(), prev)]));
                                                    }
                                                }
                                            }
                                            None => {
                                                if let Some(prev) = worker_downstream.lookup(&key) {
                                                    root_out.push(Change::remove(key.clone(), prev));
                                                }
                                            }
                                        }
                                    }
                                    if let Some(old_parent) = state.desired_parent.remove(&key) {
                                        if let Some(list) = state.children_of.get_mut(&old_parent) {
                                            list.retain(|k| k != &key);
                                        }
                                    }
                                    if let Some(kids) = state.children_of.get(&key) {
                                        touched.extend(kids.iter().cloned());
                                    }
                                }
                                ChangeReason::Moved => {}
                                _ => {
                                    let value = change.current().clone();
                                    let parent_key = selector(&value);
                                    state.set_desired_parent(&key, parent_key.clone());

                                    let is_new = !state.nodes.contains_key(&key);
                                    match state.nodes.get(&key) {
                                        Some(existing) => existing.value.with(|v| *v = value.clone()),
                                        None => {
                                            state.nodes.insert(key.clone(), TreeNode::new(key.clone(), value));
                                        }
                                    }
                                    touched.push(key.clone());
                                    if is_new {
                                        if let Some(kids) = state.children_of.get(&key) {
                                            touched.extend(kids.iter().cloned());
                                        }
                                    }
                                }
                            }
                        }

                        for key in touched {
                            place_node(&state, &worker_downstream, &key, &mut root_out);
                        }
                        worker_downstream.publish(root_out);
                    }
                    Event::Error(error) => {
                        for node in state.nodes.values() {
                            node.children.fail(error.clone());
                        }
                        worker_downstream.fail(error);
                        return;
                    }
                    Event::Completed => {
                        for node in state.nodes.values() {
                            node.children.complete();
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

impl<K, V> ChangeStream<K, Arc<TreeNode<K, V>>> for TreeBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> Subscription<ChangeSet<K, Arc<TreeNode<K, V>>>> {
        self.downstream.subscribe()
    }
}
