//! Black-box coverage for `Filter`, driven purely through the public `SourceCache` and
//! `ChangeStream` surface — no crate-private constructor involved.

use std::sync::Arc;

use futures_util::StreamExt;
use reactive_collections::{
    change::ChangeSet,
    observable::Event,
    operators::{filter::Filter, ChangeStream},
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
async fn update_flips_membership_both_ways() {
    let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
    source.edit(|u| u.add_or_update(1, 3));

    let filter = Filter::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |_, v| *v < 5);
    let sub = filter.subscribe_changes();

    source.edit(|u| u.add_or_update(1, 10));

    // sets[0]: the subscription's own empty synthetic snapshot, taken before the filter's
    // worker has replayed anything from upstream. sets[1]: the upstream's initial batch,
    // forwarded as an Add since 3 < 5. sets[2]: the update pushes the value past the
    // predicate, so the entry is dropped.
    let sets = collect(sub, 3).await;
    assert!(sets[0].is_empty());
    assert_eq!(sets[1].iter().next().unwrap().reason(), ChangeReason::Add);
    let dropped = sets[2].iter().next().unwrap();
    assert_eq!(dropped.reason(), ChangeReason::Remove);
    assert_eq!(*dropped.key(), 1);
}

#[tokio::test]
async fn entry_entering_and_leaving_the_window_re_fires_add_then_remove() {
    let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
    let filter = Filter::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, |_, v| *v < 5);
    let sub = filter.subscribe_changes();

    source.edit(|u| u.add_or_update(7, 1));
    source.edit(|u| u.add_or_update(7, 9));

    // Every batch the filter's worker processes (including the empty leading synthetic
    // snapshot and the empty forward of upstream's own empty initial batch) is published, so
    // only the non-empty sets carry the entry's Add/Remove transitions we care about.
    let sets = collect(sub, 4).await;
    let non_empty: Vec<_> = sets.iter().filter(|set| !set.is_empty()).collect();
    assert_eq!(non_empty.len(), 2);
    assert_eq!(non_empty[0].iter().next().unwrap().reason(), ChangeReason::Add);
    assert_eq!(non_empty[1].iter().next().unwrap().reason(), ChangeReason::Remove);
}
