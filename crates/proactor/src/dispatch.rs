// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, event};

use crate::{CompletionEventQueue, Observer};

/// Demultiplexes finished operations from a [`CompletionEventQueue`] to a single [`Observer`].
///
/// [`exec`](Self::exec) is meant to run on a dedicated thread. It is the only caller of the
/// observer, so the observer sees one notification at a time and needs no synchronization of
/// its own to order them.
///
/// The loop keeps running until it has been asked to finish *and* the queue is empty, so a
/// completion that arrives between a drain check and the finish request is still delivered.
pub struct Proactor<T> {
    queue: Arc<CompletionEventQueue<T>>,
    observer: Arc<dyn Observer<T>>,
    finish: AtomicBool,
}

impl<T> Proactor<T> {
    /// Creates a proactor that reports completions from `queue` to `observer`.
    #[must_use]
    pub fn new(queue: Arc<CompletionEventQueue<T>>, observer: Arc<dyn Observer<T>>) -> Self {
        Self {
            queue,
            observer,
            finish: AtomicBool::new(false),
        }
    }

    /// Requests the loop to stop once the queue is empty.
    ///
    /// The request cannot be withdrawn; passing `false` has no effect.
    pub fn can_finish(&self, finish: bool) {
        if !finish {
            return;
        }

        self.finish.store(true, Ordering::Release);
        self.queue.interrupt();
    }

    /// Whether the loop has been asked to stop.
    #[must_use]
    pub fn is_finishing(&self) -> bool {
        self.finish.load(Ordering::Acquire)
    }

    /// Runs the dispatch loop on the calling thread until finishing is requested and the
    /// queue is empty.
    ///
    /// Returns the number of completions delivered to the observer.
    pub fn exec(&self) -> usize {
        event!(Level::DEBUG, message = "proactor started");

        let mut delivered: usize = 0;

        while let Some(event) = self.queue.wait_pop(&self.finish) {
            event!(
                Level::TRACE,
                message = "proactor dequeued completion",
                operation = %event.operation().id(),
                sequence = %event.sequence(),
                pending = self.queue.len(),
            );

            let (operation, sequence) = event.into_parts();
            self.observer.notify(&operation, sequence);
            delivered = delivered.saturating_add(1);
        }

        event!(Level::DEBUG, message = "proactor finished", delivered);
        delivered
    }
}

impl<T> Debug for Proactor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proactor")
            .field("queue", &self.queue)
            .field("finish", &self.finish)
            .finish_non_exhaustive()
    }
}
