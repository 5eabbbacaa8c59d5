//! Black-box coverage for `LeftJoin`, driven purely through the public `SourceCache` and
//! `ChangeStream` surface.

use std::sync::Arc;

use futures_util::StreamExt;
use reactive_collections::{
    change::ChangeSet,
    observable::Event,
    operators::{
        join::{ForeignKeySelector, LeftJoin, LeftResultSelector},
        ChangeStream,
    },
    source::SourceCache,
};

async fn collect<K, V>(mut sub: reactive_collections::Subscription<ChangeSet<K, V>>, count: usize) -> Vec<ChangeSet<K, V>> {
    let mut out = Vec::new();
    while out.len() < count {
        match sub.next().await.expect("stream ended before enough change sets arrived") {
            Event::Next(set) => out.push(set),
            Event::Error(error) => panic!("unexpected error: {error}"),
            Event::Completed => break,
        }
    }
    out
}

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
