//! The scheduling abstraction operators depend on, and the `tokio`-backed runtime glue.
//!
//! Per the design notes, there is no ambient "default scheduler" — every operator that needs
//! one (expire-after, the polling variant of grouping/sort, timer-driven retries) takes an
//! explicit `Arc<dyn Scheduler>` at construction.

mod acknowledged_message;
mod join_handle;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::{spawn, TaskHandle},
};

/// A cancellation handle for a scheduled action. Dropping it does not guarantee the action will
/// not run — cancellation is best-effort, and operators must defensively re-check due times
/// after a wake-up, as noted in the scheduler contract.
pub struct Cancellation {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Cancellation {
    fn from_handle(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle: Some(handle) }
    }

    /// A no-op cancellation, for actions that already completed synchronously. Exposed so a
    /// custom [`Scheduler`] implementation outside the crate has a way to satisfy
    /// `schedule_after`'s return type when it runs `action` inline rather than arming a timer.
    pub fn noop() -> Self {
        Self { handle: None }
    }

    /// Best-effort cancellation of the scheduled action.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The abstract collaborator operators use for the current time and for scheduling work, so that
/// the engine never reaches for a process-global clock.
pub trait Scheduler: Send + Sync {
    /// The current time, as observed by this scheduler.
    fn now(&self) -> Instant;

    /// Runs `action` after `due` has elapsed.
    fn schedule_after(&self, due: Duration, action: Box<dyn FnOnce() + Send>) -> Cancellation;

    /// Runs `action` as soon as possible (used to hop off the caller's stack, e.g. to flush a
    /// batched emission without holding the caller's gate).
    fn schedule(&self, action: Box<dyn FnOnce() + Send>) -> Cancellation {
        self.schedule_after(Duration::ZERO, action)
    }
}

/// The production [`Scheduler`], backed by the `tokio` timer wheel.
#[derive(Clone, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Constructs a new scheduler backed by the ambient `tokio` runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_after(&self, due: Duration, action: Box<dyn FnOnce() + Send>) -> Cancellation {
        let handle = tokio::spawn(async move {
            if !due.is_zero() {
                tokio::time::sleep(due).await;
            }
            action();
        });
        Cancellation::from_handle(handle)
    }
}

/// Spawn a task in the background to run a future. Must be called from within a running `tokio`
/// runtime.
#[track_caller]
pub(crate) fn spawn_task<F, O>(fut: F) -> TaskHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut)
}
