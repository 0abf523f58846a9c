// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Thread-backed implementation of the Proactor pattern.
//!
//! Callers submit units of work ([`Operation`]s). Each admitted operation runs on its own
//! thread, with at most a fixed number of operations in flight at once. Every finished
//! operation is handed to a single dispatcher thread, which reports it to one completion
//! handler. The handler never deals with threads: it sees one finished operation at a time,
//! in the order the operations finished.
//!
//! # Moving parts
//!
//! - [`Operation`] wraps a closure with start and end timestamps, a result slot and a
//!   completion flag, and notifies an [`Observer`] once the result is available.
//! - [`OperationProcessor`] is the admission gate. It blocks submitters while its pool is
//!   full, starts admitted operations and pushes finished ones onto the
//!   [`CompletionEventQueue`].
//! - [`Proactor`] runs the dispatch loop, taking one completion at a time off the queue
//!   and notifying its observer.
//! - [`InitiatorCompletion`] wires the three together, is the completion handler and
//!   shuts everything down by draining before stopping.
//!
//! # Quick Start
//!
//! ```
//! use proactor::{IdGenerator, InitiatorCompletion, Operation};
//!
//! let initiator = InitiatorCompletion::<u64>::new()?;
//! let ids = IdGenerator::new();
//!
//! let operation = Operation::new(&ids, || (1..=10).sum());
//! initiator.submit(std::sync::Arc::clone(&operation))?;
//!
//! // Waits for the operation to finish and for its completion to be reported.
//! initiator.shutdown()?;
//! assert_eq!(operation.get_result()?, 55);
//! # Ok::<(), proactor::Error>(())
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events: each reported result at `INFO`, the lifecycle of
//! operations and of shutdown at `DEBUG`, and admission control at `TRACE`. No subscriber is
//! installed by the crate.
//!
//! # Panics in operations
//!
//! Work closures must not panic. An operation whose work panics never completes: its slot is
//! released so admission keeps flowing, an error is logged, and the completion handler is
//! not notified about it.

mod completion_queue;
mod dispatch;
mod error;
mod initiator;
mod observer;
mod operation;
mod processor;

pub use completion_queue::{CompletionEvent, CompletionEventQueue};
pub use dispatch::Proactor;
pub use error::{Error, Result};
pub use initiator::{CompletionCallback, InitiatorCompletion, InitiatorCompletionBuilder};
pub use observer::Observer;
pub use operation::{IdGenerator, Operation, OperationId, SequenceId};
pub use processor::{DEFAULT_POOL_SIZE, OperationProcessor};
