//! Async stream adapter.

use super::{Publisher, Signal, Subscription, Unconfined};
use crate::error::{LiveError, Result};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A publisher consumed as a [`Stream`] of results.
///
/// Values arrive as `Ok`, a failure as one final `Err`. The stream ends on
/// completion. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct SignalStream<T> {
    receiver: mpsc::UnboundedReceiver<Result<T>>,
    subscription: Subscription,
}

// No field is structurally pinned
impl<T> Unpin for SignalStream<T> {}

impl<T> SignalStream<T> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T> Stream for SignalStream<T> {
    type Item = std::result::Result<T, LiveError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl<T: Unconfined> Publisher<T> {
    /// Subscribe and expose the signals as an async stream.
    pub fn into_stream(self) -> SignalStream<T> {
        let (sender, receiver) = mpsc::unbounded();
        let mut sender = Some(sender);

        let subscription = self.sink(move |signal| {
            let Some(tx) = sender.as_ref() else {
                return;
            };
            match signal {
                Signal::Value(value) => {
                    let _ = tx.unbounded_send(Ok(value));
                }
                Signal::Failed(e) => {
                    let _ = tx.unbounded_send(Err(e));
                    sender = None;
                }
                Signal::Finished => sender = None,
            }
        });

        SignalStream {
            receiver,
            subscription,
        }
    }
}
