use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, ErrorKind, Result};

/// A handle to a task spawned on the async runtime. Polling it resolves to the task's output,
/// or to [`ErrorKind::Internal`] if the task panicked or was aborted.
#[derive(Debug)]
pub(crate) struct TaskHandle<T>(tokio::task::JoinHandle<T>);

impl<T> TaskHandle<T> {
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.map_err(|e| Error::from(ErrorKind::Internal { message: format!("task panicked: {e}") }))
        })
    }
}

/// Spawn a future on the runtime, returning a handle that can be awaited for its result or used
/// to abort it. Must be called from within a running runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> TaskHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    TaskHandle(tokio::task::spawn(fut))
}
