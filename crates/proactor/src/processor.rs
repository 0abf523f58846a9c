// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{Level, event};

use crate::{CompletionEventQueue, Error, Observer, Operation, OperationId, Result, SequenceId};

/// Number of operations allowed in flight when no pool size is configured.
pub const DEFAULT_POOL_SIZE: NonZeroUsize = NonZeroUsize::new(2).expect("2 is not zero");

/// Starts operations on their own threads, never more than a fixed number at a time, and
/// routes each finished operation into a [`CompletionEventQueue`].
///
/// [`add_operation`](Self::add_operation) is the admission gate: while `pool_size`
/// operations are in flight, submitters block until one of them finishes. This is the only
/// backpressure in the system - if operations are submitted faster than they finish, the
/// submitters wait instead of threads and memory piling up.
///
/// The processor registers itself as the [`Observer`] of every operation it admits. When
/// an operation notifies it, the operation is pushed onto the completion queue and its
/// slot is freed, waking one blocked submitter if the pool had been full.
pub struct OperationProcessor<T> {
    pool_size: NonZeroUsize,
    pool: Mutex<Pool>,
    // Signalled (one waiter at a time) when a slot frees up in a full pool.
    slot_freed: Condvar,
    // Signalled when the last in-flight operation leaves the pool.
    idle: Condvar,
    queue: Arc<CompletionEventQueue<T>>,
    thread_name: String,
    this: Weak<Self>,
}

#[derive(Debug, Default)]
struct Pool {
    in_flight: HashMap<SequenceId, OperationId>,
    peak: usize,
    last_sequence: u64,
}

impl<T: Send + 'static> OperationProcessor<T> {
    /// Creates a processor that feeds `queue` and admits at most `pool_size` operations at once.
    ///
    /// Operation threads are named `<thread_name>-<sequence>`.
    #[must_use]
    pub fn new(queue: Arc<CompletionEventQueue<T>>, pool_size: NonZeroUsize, thread_name: impl Into<String>) -> Arc<Self> {
        let thread_name = thread_name.into();

        Arc::new_cyclic(|this| Self {
            pool_size,
            pool: Mutex::new(Pool::default()),
            slot_freed: Condvar::new(),
            idle: Condvar::new(),
            queue,
            thread_name,
            this: Weak::clone(this),
        })
    }

    /// Admits `operation` under the next sequence number and starts it on a new thread,
    /// blocking while the pool is full.
    ///
    /// The sequence number is assigned at admission, so numbers follow the order in which
    /// operations entered the pool even when several submitters were blocked at once.
    /// Numbers start at 1. Mixing this with [`add_operation`](Self::add_operation) on the
    /// same processor can make an assigned number collide with a caller-chosen one.
    ///
    /// # Errors
    ///
    /// Fails like [`add_operation`](Self::add_operation).
    pub fn submit(&self, operation: Arc<Operation<T>>) -> Result<SequenceId> {
        self.admit(operation, None)
    }

    /// Admits `operation` under `sequence` and starts it on a new thread, blocking while
    /// the pool is full.
    ///
    /// Returns as soon as the operation has been started; it does not wait for the
    /// operation to finish. The processor becomes the operation's observer only once the
    /// operation is admitted, so an operation rejected here can be submitted again.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyExecuted`] if the operation has already run.
    /// * [`Error::AlreadySubmitted`] if the operation has been submitted before. Neither
    ///   this nor the previous error touches the pool or blocks.
    /// * [`Error::DuplicateSequence`] if another in-flight operation uses the same `sequence`.
    /// * [`Error::StdIo`] if the operating system refused to start the thread. The slot is
    ///   released again and the operation is never run.
    pub fn add_operation(&self, operation: Arc<Operation<T>>, sequence: SequenceId) -> Result<()> {
        self.admit(operation, Some(sequence)).map(drop)
    }

    fn admit(&self, operation: Arc<Operation<T>>, sequence: Option<SequenceId>) -> Result<SequenceId> {
        let id = operation.id();
        operation.ensure_registrable()?;

        let sequence = {
            let mut pool = self.pool.lock();

            while pool.in_flight.len() >= self.pool_size.get() {
                event!(Level::TRACE, message = "pool full, waiting for a free slot", operation = %id);
                self.slot_freed.wait(&mut pool);
            }

            let sequence = sequence.unwrap_or_else(|| {
                pool.last_sequence += 1;
                SequenceId::new(pool.last_sequence)
            });

            let registered = if pool.in_flight.contains_key(&sequence) {
                Err(Error::DuplicateSequence { sequence })
            } else {
                let observer: Weak<dyn Observer<T>> = Weak::clone(&self.this) as Weak<dyn Observer<T>>;
                operation.set_observer(observer, sequence)
            };

            if let Err(error) = registered {
                // We may have consumed the wakeup meant for another submitter.
                self.slot_freed.notify_one();
                return Err(error);
            }

            pool.in_flight.insert(sequence, id);
            pool.peak = pool.peak.max(pool.in_flight.len());

            // Several slots can free up while only one submitter has been woken. Pass the
            // wakeup on while there is still room, so no submitter waits next to a free slot.
            if pool.in_flight.len() < self.pool_size.get() {
                self.slot_freed.notify_one();
            }

            event!(
                Level::DEBUG,
                message = "operation admitted",
                operation = %id,
                %sequence,
                in_flight = pool.in_flight.len(),
            );

            sequence
        };

        // The guard is dropped last on the operation thread and releases the slot if the
        // operation never notified us (the work panicked). If the thread cannot be started
        // at all, the guard is dropped right here and releases the slot the same way.
        let slot = SlotGuard {
            processor: Weak::clone(&self.this),
            operation: id,
            sequence,
        };

        let spawned = thread::Builder::new()
            .name(format!("{}-{sequence}", self.thread_name))
            .spawn({
                let operation = Arc::clone(&operation);
                move || {
                    let _slot = slot;
                    operation.execute();
                }
            });

        if let Err(error) = spawned {
            operation.clear_observer();
            return Err(error.into());
        }

        Ok(sequence)
    }
}

impl<T> OperationProcessor<T> {
    /// The maximum number of operations in flight at once.
    #[must_use]
    pub const fn pool_size(&self) -> NonZeroUsize {
        self.pool_size
    }

    /// Number of operations admitted but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pool.lock().in_flight.len()
    }

    /// The largest number of operations that have been in flight at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.pool.lock().peak
    }

    /// Blocks until no operations are in flight.
    pub fn wait_idle(&self) {
        let mut pool = self.pool.lock();

        while !pool.in_flight.is_empty() {
            self.idle.wait(&mut pool);
        }
    }

    /// Removes `sequence` from the pool and wakes waiters as needed.
    ///
    /// Returns whether the sequence was in flight. Must be called with the pool lock held.
    fn vacate(&self, pool: &mut Pool, sequence: SequenceId) -> bool {
        let was_full = pool.in_flight.len() >= self.pool_size.get();

        if pool.in_flight.remove(&sequence).is_none() {
            return false;
        }

        if was_full {
            event!(Level::TRACE, message = "slot freed, waking next submitter", %sequence);
            self.slot_freed.notify_one();
        }

        if pool.in_flight.is_empty() {
            self.idle.notify_all();
        }

        true
    }

    /// Frees the slot of an operation whose thread ended without notifying us.
    fn abandon(&self, operation: OperationId, sequence: SequenceId) {
        let mut pool = self.pool.lock();

        // The sequence may already have been handed to a newer operation.
        if pool.in_flight.get(&sequence) != Some(&operation) {
            return;
        }

        self.vacate(&mut pool, sequence);
        event!(
            Level::ERROR,
            message = "operation abandoned without completing",
            %operation,
            %sequence,
        );
    }
}

impl<T: Send> Observer<T> for OperationProcessor<T> {
    fn notify(&self, operation: &Arc<Operation<T>>, sequence: SequenceId) {
        let mut pool = self.pool.lock();

        self.queue.push(Arc::clone(operation), sequence);

        if !self.vacate(&mut pool, sequence) {
            event!(
                Level::WARN,
                message = "notified about an operation that was not in flight",
                operation = %operation.id(),
                %sequence,
            );
        }
    }
}

impl<T> Debug for OperationProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationProcessor")
            .field("pool_size", &self.pool_size)
            .field("pool", &*self.pool.lock())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Releases an operation's slot when its thread exits, unless the operation already did.
struct SlotGuard<T> {
    processor: Weak<OperationProcessor<T>>,
    operation: OperationId,
    sequence: SequenceId,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.abandon(self.operation, self.sequence);
        }
    }
}
