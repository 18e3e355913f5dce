//! One-shot completions.
//!
//! Log commits and peer sends report through callbacks. A [`Completer`] is
//! moved into the callback and the caller blocks on the paired
//! [`Completion`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Result of a bounded wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Waited<T> {
    /// The value arrived.
    Ready(T),
    /// The wait elapsed first.
    TimedOut,
    /// The completer was dropped without completing.
    Abandoned,
}

/// Sending half of a completion.
#[derive(Debug)]
pub(crate) struct Completer<T>(SyncSender<T>);

impl<T> Completer<T> {
    /// Delivers the value. A waiter that gave up is ignored.
    pub(crate) fn complete(self, value: T) {
        let _ = self.0.try_send(value);
    }
}

/// Receiving half of a completion.
#[derive(Debug)]
pub(crate) struct Completion<T>(Receiver<T>);

impl<T> Completion<T> {
    /// Blocks until the value arrives. `None` if the completer was dropped.
    pub(crate) fn wait(&self) -> Option<T> {
        self.0.recv().ok()
    }

    /// Blocks for at most `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Waited<T> {
        match self.0.recv_timeout(timeout) {
            Ok(value) => Waited::Ready(value),
            Err(RecvTimeoutError::Timeout) => Waited::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Waited::Abandoned,
        }
    }
}

/// Creates a completion pair.
pub(crate) fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Completer(tx), Completion(rx))
}
