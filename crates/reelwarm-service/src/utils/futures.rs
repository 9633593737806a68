use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

/// A spawned task that is aborted when this handle is dropped.
///
/// Awaiting the handle yields the task's output, or the [`JoinError`] if it panicked or was
/// aborted.
#[derive(Debug)]
pub struct CancelOnDrop<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> CancelOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Lets the task run to completion even after this handle is dropped.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl<T> Future for CancelOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.handle.as_mut() {
            Some(handle) => Pin::new(handle).poll(cx),
            // Only reachable through `detach`, which consumes the handle.
            None => Poll::Pending,
        }
    }
}
