// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{Level, event};

use crate::{
    CompletionEventQueue, DEFAULT_POOL_SIZE, Error, Observer, Operation, OperationProcessor, Proactor, Result,
    SequenceId,
};

/// Application callback invoked for every finished operation, on the dispatcher thread.
pub type CompletionCallback<T> = Arc<dyn Fn(&Arc<Operation<T>>, SequenceId) + Send + Sync>;

const DEFAULT_THREAD_NAME: &str = "proactor";

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Submits operations for concurrent execution and reacts to their completion.
///
/// This is the entry point of the crate. It owns one [`CompletionEventQueue`], one
/// [`OperationProcessor`] and one [`Proactor`] running on its own dispatcher thread:
///
/// * as the *initiator*, [`submit`](Self::submit) tags an operation with the next sequence
///   number and hands it to the processor, blocking while the processor's pool is full;
/// * as the *completion handler*, it is the observer the proactor notifies for every
///   finished operation. It logs the result and then invokes the callback configured with
///   [`InitiatorCompletionBuilder::on_completion`], if any.
///
/// Completions are reported one at a time, in the order the operations finished.
///
/// Dropping the value (or calling [`shutdown`](Self::shutdown)) waits for every submitted
/// operation to finish and be reported before the dispatcher thread is stopped.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
/// use std::sync::{Arc, Mutex};
///
/// use proactor::{IdGenerator, InitiatorCompletion, Operation};
///
/// let results = Arc::new(Mutex::new(Vec::new()));
///
/// let initiator = InitiatorCompletion::builder()
///     .with_pool_size(NonZeroUsize::new(2).unwrap())
///     .on_completion({
///         let results = Arc::clone(&results);
///         move |operation: &Arc<Operation<i32>>, _sequence| {
///             results.lock().unwrap().push(operation.get_result().unwrap());
///         }
///     })
///     .build()
///     .unwrap();
///
/// let ids = IdGenerator::new();
/// for (a, b) in [(1, 2), (3, 4), (5, 6)] {
///     initiator.submit(Operation::new(&ids, move || a + b)).unwrap();
/// }
///
/// assert_eq!(initiator.shutdown().unwrap(), 3);
///
/// let mut results = results.lock().unwrap().clone();
/// results.sort_unstable();
/// assert_eq!(results, vec![3, 7, 11]);
/// ```
pub struct InitiatorCompletion<T> {
    queue: Arc<CompletionEventQueue<T>>,
    processor: Arc<OperationProcessor<T>>,
    proactor: Arc<Proactor<T>>,
    completion: Arc<CompletionHandler<T>>,
    dispatcher: Option<JoinHandle<usize>>,
}

impl<T> InitiatorCompletion<T>
where
    T: Clone + Debug + Send + 'static,
{
    /// Starts configuring a new instance.
    #[must_use]
    pub fn builder() -> InitiatorCompletionBuilder<T> {
        InitiatorCompletionBuilder::new()
    }

    /// Creates an instance with the default configuration and starts its dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StdIo`] if the dispatcher thread cannot be started.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Submits an operation for concurrent execution.
    ///
    /// Blocks while the maximum number of operations is already in flight. Returns the
    /// sequence number the operation was admitted with; the same number is passed to the
    /// completion callback. Sequence numbers start at 1 and follow admission order.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyExecuted`] if the operation has already run.
    /// * [`Error::AlreadySubmitted`] if the operation has been submitted before.
    /// * [`Error::StdIo`] if the thread for the operation cannot be started.
    pub fn submit(&self, operation: Arc<Operation<T>>) -> Result<SequenceId> {
        event!(Level::DEBUG, message = "initiating operation", operation = %operation.id());
        self.processor.submit(operation)
    }
}

impl<T> InitiatorCompletion<T> {
    /// The maximum number of operations in flight at once.
    #[must_use]
    pub fn pool_size(&self) -> NonZeroUsize {
        self.processor.pool_size()
    }

    /// Number of operations submitted but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.processor.in_flight()
    }

    /// The largest number of operations that have been in flight at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.processor.peak_in_flight()
    }

    /// Number of finished operations waiting to be reported.
    #[must_use]
    pub fn pending_completions(&self) -> usize {
        self.queue.len()
    }

    /// Number of finished operations reported so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.completion.delivered.load(Ordering::Acquire)
    }

    /// Waits for every submitted operation to finish and be reported, then stops the
    /// dispatcher thread.
    ///
    /// Returns the total number of completions reported over the lifetime of the instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatcherPanicked`] if the completion callback panicked, in which
    /// case later completions were not reported.
    pub fn shutdown(mut self) -> Result<usize> {
        self.stop()
    }

    fn stop(&mut self) -> Result<usize> {
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(self.delivered());
        };

        event!(Level::DEBUG, message = "shutting down, waiting for operations in flight", in_flight = self.in_flight());
        self.processor.wait_idle();

        event!(Level::DEBUG, message = "waiting for completions to drain", pending = self.pending_completions());
        // A dispatcher that died in the completion callback will never drain the queue.
        while !self.queue.wait_drained_for(DRAIN_CHECK_INTERVAL) && !dispatcher.is_finished() {}

        self.proactor.can_finish(true);

        let delivered = dispatcher.join().map_err(|_panic| Error::DispatcherPanicked)?;
        event!(Level::DEBUG, message = "initiator/completion finished", delivered);

        Ok(delivered)
    }
}

impl<T> Drop for InitiatorCompletion<T> {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            event!(Level::ERROR, message = "shutdown failed", %error);
        }
    }
}

impl<T> Debug for InitiatorCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorCompletion")
            .field("processor", &self.processor)
            .field("proactor", &self.proactor)
            .finish_non_exhaustive()
    }
}

/// Configures and starts an [`InitiatorCompletion`].
pub struct InitiatorCompletionBuilder<T> {
    pool_size: NonZeroUsize,
    thread_name: String,
    on_completion: Option<CompletionCallback<T>>,
}

impl<T> InitiatorCompletionBuilder<T>
where
    T: Clone + Debug + Send + 'static,
{
    fn new() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            on_completion: None,
        }
    }

    /// Sets the maximum number of operations in flight at once. Defaults to [`DEFAULT_POOL_SIZE`].
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: NonZeroUsize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the prefix of the names of the threads started by the instance.
    ///
    /// The dispatcher thread is named `<prefix>-dispatch` and operation threads are named
    /// `<prefix>-op-<sequence>`. Defaults to `proactor`.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Sets the callback invoked for every finished operation.
    ///
    /// The callback runs on the dispatcher thread after the result has been logged. It is
    /// never invoked concurrently with itself. It should return quickly, as completions
    /// queue up behind it.
    #[must_use]
    pub fn on_completion<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Operation<T>>, SequenceId) + Send + Sync + 'static,
    {
        self.on_completion = Some(Arc::new(callback));
        self
    }

    /// Builds the instance and starts its dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StdIo`] if the dispatcher thread cannot be started.
    pub fn build(self) -> Result<InitiatorCompletion<T>> {
        let queue = Arc::new(CompletionEventQueue::new());
        let processor = OperationProcessor::new(
            Arc::clone(&queue),
            self.pool_size,
            format!("{}-op", self.thread_name),
        );
        let completion = Arc::new(CompletionHandler {
            on_completion: self.on_completion,
            delivered: AtomicUsize::new(0),
        });
        let proactor = Arc::new(Proactor::new(
            Arc::clone(&queue),
            Arc::clone(&completion) as Arc<dyn Observer<T>>,
        ));

        let dispatcher = thread::Builder::new().name(format!("{}-dispatch", self.thread_name)).spawn({
            let proactor = Arc::clone(&proactor);
            move || proactor.exec()
        })?;

        event!(
            Level::DEBUG,
            message = "initiator/completion started",
            pool_size = self.pool_size.get(),
        );

        Ok(InitiatorCompletion {
            queue,
            processor,
            proactor,
            completion,
            dispatcher: Some(dispatcher),
        })
    }
}

impl<T> Debug for InitiatorCompletionBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorCompletionBuilder")
            .field("pool_size", &self.pool_size)
            .field("thread_name", &self.thread_name)
            .field("on_completion", &self.on_completion.is_some())
            .finish()
    }
}

/// The completion half of [`InitiatorCompletion`], notified by the proactor.
struct CompletionHandler<T> {
    on_completion: Option<CompletionCallback<T>>,
    delivered: AtomicUsize,
}

impl<T> Observer<T> for CompletionHandler<T>
where
    T: Clone + Debug + Send,
{
    fn notify(&self, operation: &Arc<Operation<T>>, sequence: SequenceId) {
        match operation.get_result() {
            Ok(result) => event!(
                Level::INFO,
                message = "operation completed",
                operation = %operation.id(),
                %sequence,
                result = ?result,
                elapsed_ms = operation.elapsed().map(|elapsed| elapsed.as_millis()),
            ),
            Err(error) => event!(
                Level::ERROR,
                message = "notified about an unfinished operation",
                operation = %operation.id(),
                %sequence,
                %error,
            ),
        }

        self.delivered.fetch_add(1, Ordering::AcqRel);

        if let Some(on_completion) = &self.on_completion {
            on_completion(operation, sequence);
        }
    }
}
