// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Units of deferred work and their identifiers.

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use jiff::{SignedDuration, Timestamp};
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::{Error, Observer, Result};

/// Identifies an [`Operation`] for its whole lifetime.
///
/// Identifiers are handed out by an [`IdGenerator`] and are unique among the operations
/// created from the same generator.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The submission sequence number assigned to an operation when it is admitted.
///
/// Sequence numbers reflect submission order. Completions are delivered in completion
/// order, so a handler may observe them out of sequence.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value of the sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Hands out [`OperationId`] values, starting at 1.
///
/// A generator is an ordinary value: create one wherever operations are created and
/// pass it to [`Operation::new`]. Cloning is not supported, as two generators would
/// hand out the same identifiers.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator whose first identifier is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Returns the next identifier.
    pub fn next_id(&self) -> OperationId {
        OperationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

type Work<T> = Box<dyn FnOnce() -> T + Send>;

type Registration<T> = (Weak<dyn Observer<T>>, SequenceId);

#[derive(Debug)]
struct Timeline<T> {
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    result: Option<T>,
}

/// A unit of deferred work with a retrievable result.
///
/// The work itself is an arbitrary closure supplied at construction. [`Operation::execute`]
/// wraps it with the bookkeeping every operation shares: it records when the work started
/// and finished, stores the value, marks the operation as completed and finally notifies
/// the registered [`Observer`], in that order. An observer that reads the result from
/// within [`Observer::notify`] is therefore guaranteed to see a completed operation.
///
/// Timestamps are taken from the wall clock. For very short work `started_at` and
/// `finished_at` can be equal.
///
/// Operations are created behind an [`Arc`]. The caller owns the operation; the Proactor
/// machinery only ever holds clones of the handle and never drops the last one on
/// its own.
///
/// # Examples
///
/// ```
/// use proactor::{IdGenerator, Operation};
///
/// let ids = IdGenerator::new();
/// let operation = Operation::new(&ids, || 1 + 2);
///
/// assert!(operation.get_result().is_err());
/// operation.execute();
/// assert_eq!(operation.get_result().unwrap(), 3);
/// ```
pub struct Operation<T> {
    id: OperationId,
    work: Mutex<Option<Work<T>>>,
    timeline: Mutex<Timeline<T>>,
    completed: AtomicBool,
    observer: Mutex<Option<Registration<T>>>,
}

impl<T> Operation<T> {
    /// Creates an operation that will run `work` when executed.
    ///
    /// The work must not panic. A panicking work closure never completes the operation,
    /// so its result stays unavailable and no observer is notified.
    #[must_use]
    pub fn new<F>(ids: &IdGenerator, work: F) -> Arc<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Arc::new(Self {
            id: ids.next_id(),
            work: Mutex::new(Some(Box::new(work))),
            timeline: Mutex::new(Timeline {
                started_at: None,
                finished_at: None,
                result: None,
            }),
            completed: AtomicBool::new(false),
            observer: Mutex::new(None),
        })
    }

    /// Returns the identifier assigned at construction.
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// Returns the sequence number the operation was admitted with, if it has been submitted.
    #[must_use]
    pub fn sequence(&self) -> Option<SequenceId> {
        self.observer.lock().as_ref().map(|(_, sequence)| *sequence)
    }

    /// Whether the work has finished and the result is available.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// When the work started, if it has started.
    #[must_use]
    pub fn started_at(&self) -> Option<Timestamp> {
        self.timeline.lock().started_at
    }

    /// When the work finished, if it has finished.
    #[must_use]
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.timeline.lock().finished_at
    }

    /// How long the work took, once it has finished.
    #[must_use]
    pub fn elapsed(&self) -> Option<SignedDuration> {
        let timeline = self.timeline.lock();
        Some(timeline.finished_at?.duration_since(timeline.started_at?))
    }

    /// Registers the observer to notify once the work has finished, together with the
    /// sequence number to report.
    ///
    /// The observer is held weakly; if it is gone by the time the work finishes,
    /// nobody is notified.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadySubmitted`] if an observer has already been registered.
    /// * [`Error::AlreadyExecuted`] if the work has already run without an observer, as
    ///   nobody would ever be notified.
    pub fn set_observer(&self, observer: Weak<dyn Observer<T>>, sequence: SequenceId) -> Result<()> {
        // Holding the work lock keeps `execute` from starting between the check and the
        // registration.
        let work = self.work.lock();
        self.check_registrable(work.is_some())?;
        *self.observer.lock() = Some((observer, sequence));
        drop(work);

        event!(Level::DEBUG, message = "observer registered", operation = %self.id, %sequence);
        Ok(())
    }

    /// Fails the same way [`set_observer`](Self::set_observer) would, without registering anything.
    pub(crate) fn ensure_registrable(&self) -> Result<()> {
        let work = self.work.lock();
        self.check_registrable(work.is_some())
    }

    /// Forgets the registered observer, so the operation can be submitted again.
    pub(crate) fn clear_observer(&self) {
        self.observer.lock().take();
    }

    fn check_registrable(&self, work_pending: bool) -> Result<()> {
        // A submitted operation may already have run; that is still a resubmission.
        if self.observer.lock().is_some() {
            return Err(Error::AlreadySubmitted { id: self.id });
        }

        if !work_pending {
            return Err(Error::AlreadyExecuted { id: self.id });
        }

        Ok(())
    }

    /// Runs the work on the calling thread.
    ///
    /// Records the start time, runs the work, records the end time and stores the value,
    /// marks the operation completed and then notifies the registered observer, if any.
    ///
    /// The work runs at most once; calling this again does nothing.
    pub fn execute(self: &Arc<Self>) {
        let Some(work) = self.work.lock().take() else {
            event!(Level::WARN, message = "operation already executed", operation = %self.id);
            return;
        };

        let started_at = Timestamp::now();
        self.timeline.lock().started_at = Some(started_at);
        event!(
            Level::DEBUG,
            message = "operation started",
            operation = %self.id,
            thread = ?thread::current().id(),
            %started_at,
        );

        let value = work();

        let finished_at = Timestamp::now();
        {
            let mut timeline = self.timeline.lock();
            timeline.finished_at = Some(finished_at);
            timeline.result = Some(value);
        }
        self.completed.store(true, Ordering::Release);

        event!(
            Level::DEBUG,
            message = "operation finished",
            operation = %self.id,
            thread = ?thread::current().id(),
            %finished_at,
            elapsed_ms = finished_at.duration_since(started_at).as_millis(),
        );

        let registration = self.observer.lock().clone();
        if let Some((observer, sequence)) = registration
            && let Some(observer) = observer.upgrade()
        {
            observer.notify(self, sequence);
        }
    }
}

impl<T: Clone> Operation<T> {
    /// Returns the value computed by the work.
    ///
    /// Never blocks waiting for the work to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFinished`] if the work has not finished yet.
    pub fn get_result(&self) -> Result<T> {
        if !self.is_completed() {
            return Err(Error::NotFinished { id: self.id });
        }

        self.timeline
            .lock()
            .result
            .clone()
            .ok_or(Error::NotFinished { id: self.id })
    }
}

impl<T> Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("sequence", &self.sequence())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
