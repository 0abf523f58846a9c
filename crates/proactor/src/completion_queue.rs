// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The queue between the threads that finish operations and the thread that reports them.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Operation, SequenceId};

/// A finished operation waiting to be reported, with the sequence number it was admitted with.
pub struct CompletionEvent<T> {
    operation: Arc<Operation<T>>,
    sequence: SequenceId,
}

impl<T> CompletionEvent<T> {
    /// The finished operation.
    #[must_use]
    pub const fn operation(&self) -> &Arc<Operation<T>> {
        &self.operation
    }

    /// The sequence number the operation was admitted with.
    #[must_use]
    pub const fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Splits the event into its parts.
    #[must_use]
    pub fn into_parts(self) -> (Arc<Operation<T>>, SequenceId) {
        (self.operation, self.sequence)
    }
}

impl<T> Debug for CompletionEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("operation", &self.operation.id())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Unbounded, thread-safe FIFO of [`CompletionEvent`]s.
///
/// Events come out in the order they were pushed, which is the order in which operations
/// finished. The queue has no capacity limit; the number of events it can ever hold is
/// bounded by the admission pool of the [`OperationProcessor`](crate::OperationProcessor)
/// feeding it.
///
/// Checking for an event and taking it is a single step ([`pop`](Self::pop) returns `None`
/// on an empty queue), so concurrent consumers never race between a length check and a
/// dequeue.
pub struct CompletionEventQueue<T> {
    events: Mutex<VecDeque<CompletionEvent<T>>>,
    pending: AtomicUsize,
    // Signalled when an event is pushed or a consumer is asked to stop.
    available: Condvar,
    // Signalled when the last event is taken.
    drained: Condvar,
}

impl<T> CompletionEventQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Appends a finished operation to the tail of the queue. Never blocks on capacity.
    pub fn push(&self, operation: Arc<Operation<T>>, sequence: SequenceId) {
        let mut events = self.events.lock();
        events.push_back(CompletionEvent { operation, sequence });
        self.pending.fetch_add(1, Ordering::Release);
        self.available.notify_one();
    }

    /// Removes and returns the event at the head of the queue, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<CompletionEvent<T>> {
        let mut events = self.events.lock();
        self.take_front(&mut events)
    }

    /// Removes and returns the event at the head of the queue, waiting for one to arrive
    /// if the queue is empty.
    ///
    /// Returns `None` once `stop` is set and the queue is empty. Events that are still
    /// queued when `stop` is set are returned first. Whoever sets `stop` must call
    /// [`interrupt`](Self::interrupt) afterwards to wake a waiting consumer.
    pub fn wait_pop(&self, stop: &AtomicBool) -> Option<CompletionEvent<T>> {
        let mut events = self.events.lock();

        loop {
            if let Some(event) = self.take_front(&mut events) {
                return Some(event);
            }

            if stop.load(Ordering::Acquire) {
                return None;
            }

            self.available.wait(&mut events);
        }
    }

    /// Wakes every consumer blocked in [`wait_pop`](Self::wait_pop) so it re-checks its stop flag.
    pub fn interrupt(&self) {
        // Taking the lock orders this wakeup after any consumer's flag check, so the
        // consumer is either already waiting or will see the flag.
        let _events = self.events.lock();
        self.available.notify_all();
    }

    /// Blocks until every queued event has been taken.
    pub fn wait_drained(&self) {
        let mut events = self.events.lock();

        while !events.is_empty() {
            self.drained.wait(&mut events);
        }
    }

    /// Blocks until every queued event has been taken or `timeout` elapses.
    ///
    /// Returns whether the queue is empty.
    pub fn wait_drained_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();

        while !events.is_empty() {
            if self.drained.wait_until(&mut events, deadline).timed_out() {
                return events.is_empty();
            }
        }

        true
    }

    /// Number of events waiting to be taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether no events are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_front(&self, events: &mut VecDeque<CompletionEvent<T>>) -> Option<CompletionEvent<T>> {
        let event = events.pop_front()?;
        self.pending.fetch_sub(1, Ordering::Release);

        if events.is_empty() {
            self.drained.notify_all();
        }

        Some(event)
    }
}

impl<T> Default for CompletionEventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for CompletionEventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEventQueue")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}
