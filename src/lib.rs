#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod cache;
pub mod change;
pub mod error;
pub mod observable;
pub mod operators;
pub(crate) mod runtime;
pub mod source;
pub(crate) mod sync;

pub use crate::{
    cache::{Cache, ChangeAwareCache},
    change::{Change, ChangeReason, ChangeSet},
    error::{Error, ErrorKind, Result},
    observable::{Observable, Subscription},
    runtime::{Cancellation, Scheduler, TokioScheduler},
    source::{CacheUpdater, SourceCache},
};

/// A boxed future, used wherever an operator needs to hold a user-supplied
/// asynchronous computation as a trait object (e.g. `TransformOnObservable`,
/// `TransformManyAsync`).
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A boxed, `Send` stream of values, used at operator boundaries where the
/// concrete observable implementation must be erased (sub-observables
/// produced by a per-entry transform, a grouped key's member stream, etc.).
pub type BoxObservable<'a, T> =
    std::pin::Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;
