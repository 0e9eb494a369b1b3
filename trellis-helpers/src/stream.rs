//! Channel-backed item stream.

use crate::error::Result;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Items produced by a background helper session.
///
/// Dropping the stream cancels the session.
#[derive(Debug)]
pub struct HelperStream<T> {
    receiver: mpsc::Receiver<Result<T>>,
    token: CancellationToken,
}

impl<T> HelperStream<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<T>>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    /// Stop the session. Items already produced may still be received.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The session's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<T> Stream for HelperStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for HelperStream<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
