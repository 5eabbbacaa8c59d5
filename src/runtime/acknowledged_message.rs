/// A message paired with an acknowledgement channel. Used by an operator that hands work to a
/// spawned task (one sub-observable subscription per source entry, in `TransformOnObservable`)
/// and needs the task to wait until that work has been applied to the operator's state before
/// producing its next message, without the operator's own worker loop blocking on the task.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    notifier: tokio::sync::oneshot::Sender<R>,
    message: M,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        (Self { message, notifier: sender }, AcknowledgmentReceiver { receiver })
    }

    pub(crate) fn message(&self) -> &M {
        &self.message
    }

    /// Send acknowledgement to the receiver, if anyone is still waiting on it.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        let _ = self.notifier.send(result.into());
    }
}

/// Receiver for the acknowledgement that a message was processed, or dropped unprocessed.
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: tokio::sync::oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Waits for acknowledgement. `None` means the sender was dropped without acknowledging.
    pub(crate) async fn wait(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
