//! Black-box coverage for `ExpireOnStream`, driven purely through the public `SourceCache`,
//! `ChangeStream`, and `Scheduler` surface — no crate-private constructor involved.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reactive_collections::{
    change::ChangeSet,
    observable::Event,
    operators::{
        expire::{ExpireOnStream, TimeSelector},
        ChangeStream,
    },
    source::SourceCache,
    Cancellation, ChangeReason, Scheduler,
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

/// A scheduler whose clock only advances when a timer is actually armed: `schedule_after`
/// fast-forwards its virtual `now()` by exactly `due` and then runs `action` inline, so a
/// scheduled expiration always appears due to the next `now()` call without any real sleeping.
struct ImmediateScheduler {
    virtual_now: Mutex<Instant>,
}

impl ImmediateScheduler {
    fn new() -> Arc<Self> {
        Arc::new(Self { virtual_now: Mutex::new(Instant::now()) })
    }
}

impl Scheduler for ImmediateScheduler {
    fn now(&self) -> Instant {
        *self.virtual_now.lock().unwrap()
    }

    fn schedule_after(&self, due: Duration, action: Box<dyn FnOnce() + Send>) -> Cancellation {
        *self.virtual_now.lock().unwrap() += due;
        action();
        Cancellation::noop()
    }
}

#[tokio::test]
async fn expiring_past_its_due_time_removes_once_and_stays_quiet() {
    let source: Arc<SourceCache<i32, i32>> = Arc::new(SourceCache::new());
    let scheduler: Arc<dyn Scheduler> = ImmediateScheduler::new();
    let selector: TimeSelector<i32> = Arc::new(|_| Some(Duration::from_millis(100)));
    let expiring = ExpireOnStream::new(source.clone() as Arc<dyn ChangeStream<i32, i32>>, selector, scheduler);
    let sub = expiring.subscribe_changes();

    source.edit(|u| u.add_or_update(1, 7));

    // sets[0]: empty synthetic snapshot. sets[1]: the add. sets[2]: arming the 100ms timer
    // fast-forwards the virtual clock past the due time and fires inline, producing exactly
    // one removal; nothing further is ever published for this key.
    let sets = collect(sub, 3).await;
    let expired = sets[2].iter().next().unwrap();
    assert_eq!(expired.reason(), ChangeReason::Remove);
    assert_eq!(*expired.key(), 1);

    // A further tick with nothing due left produces no additional batch.
    let timeout = tokio::time::timeout(Duration::from_millis(20), async {
        let mut sub = sub;
        sub.next().await
    })
    .await;
    assert!(timeout.is_err(), "no further change set should ever arrive once the key has expired");
}
