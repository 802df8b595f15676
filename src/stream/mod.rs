mod execution;
mod gate;
mod merge;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::engine::types::ExecutionEvent;

pub use execution::{ExecutionStream, StreamOutcome, StreamRequest, StreamTermination};
pub use gate::PauseGate;
pub use merge::merge;

/// Receiving half of an execution-event channel, usable as a `Stream`.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl EventReceiver {
    pub fn channel() -> (mpsc::UnboundedSender<ExecutionEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventReceiver {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
