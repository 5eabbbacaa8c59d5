//! Black-box coverage for `MergeManyChangeSets`, driven purely through the public
//! `SourceCache` and `ChangeStream` surface.

use std::{cmp::Ordering, sync::Arc};

use futures_util::StreamExt;
use reactive_collections::{
    change::ChangeSet,
    observable::Event,
    operators::{merge_many::MergeManyChangeSets, ChangeStream},
    source::SourceCache,
    ChangeReason,
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
async fn removing_every_contributor_empties_the_destination_entry() {
    let nested_a: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
    let nested_b: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
    let upstream: Arc<SourceCache<&'static str, Arc<SourceCache<i32, i32>>>> = Arc::new(SourceCache::new());
    upstream.edit(|u| {
        u.add_or_update("a", nested_a.clone());
        u.add_or_update("b", nested_b.clone());
    });

    let comparator: Arc<dyn Fn(&i32, &i32) -> Ordering + Send + Sync> = Arc::new(|a, b| a.cmp(b));
    let merged = MergeManyChangeSets::new(
        upstream as Arc<dyn ChangeStream<&'static str, Arc<SourceCache<i32, i32>>>>,
        |nested, _key| nested.clone() as Arc<dyn ChangeStream<i32, i32>>,
        comparator,
        None,
    );
    let sub = merged.subscribe_changes();

    nested_a.edit(|u| u.add_or_update(1, 5));
    nested_b.edit(|u| u.add_or_update(1, 9));
    nested_a.edit(|u| u.remove(&1));
    nested_b.edit(|u| u.remove(&1));

    // sets[0]: empty synthetic snapshot. sets[1]: "a" contributes 5, the only candidate.
    // nested_b's add ties under the comparator against the already-published 5, so it emits
    // nothing on its own. sets[2]: "a" withdraws, "b"'s 9 becomes the sole candidate. sets[3]:
    // "b" withdraws too, leaving no candidate at all.
    let sets = collect(sub, 4).await;
    assert_eq!(*sets[1].iter().next().unwrap().current(), 5);

    let reselected = sets[2].iter().next().unwrap();
    assert_eq!(reselected.reason(), ChangeReason::Update);
    assert_eq!(*reselected.current(), 9);

    let removed = sets[3].iter().next().unwrap();
    assert_eq!(removed.reason(), ChangeReason::Remove);
    assert_eq!(*removed.current(), 9);
}
