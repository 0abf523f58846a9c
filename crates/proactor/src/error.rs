// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

use crate::{OperationId, SequenceId};

/// A specialized `Result` type for Proactor operations
/// that return a Proactor [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the Proactor machinery.
///
/// The only condition a well-behaved caller is expected to observe is
/// [`Error::NotFinished`]. The remaining variants report misuse of the API or a
/// failure of the environment (e.g. the operating system refusing to start a thread).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The result of an operation was requested before the operation finished executing.
    #[error("operation {id} has not finished")]
    NotFinished {
        /// The operation whose result was requested.
        id: OperationId,
    },

    /// The operation has already been handed to a processor. An operation can be
    /// submitted at most once.
    #[error("operation {id} has already been submitted")]
    AlreadySubmitted {
        /// The operation that was submitted a second time.
        id: OperationId,
    },

    /// The operation has already run, so submitting it would never produce a completion.
    #[error("operation {id} has already been executed")]
    AlreadyExecuted {
        /// The operation that was submitted after running.
        id: OperationId,
    },

    /// The sequence number is already in use by an in-flight operation.
    #[error("sequence {sequence} is already in flight")]
    DuplicateSequence {
        /// The sequence number that collided.
        sequence: SequenceId,
    },

    /// The completion handler panicked on the dispatcher thread, so some completions
    /// may not have been delivered.
    #[error("the completion dispatcher thread panicked")]
    DispatcherPanicked,

    /// We are re-packaging an error from the Rust standard library I/O logic
    /// without adding further details in the Proactor layer.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}
