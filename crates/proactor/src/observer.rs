// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::{Operation, SequenceId};

/// Receives a notification when an [`Operation`] has finished.
///
/// Both halves of the completion path are observers: the
/// [`OperationProcessor`](crate::OperationProcessor) is notified by the operation itself on the
/// operation's thread, and the completion handler of
/// [`InitiatorCompletion`](crate::InitiatorCompletion) is notified by the
/// [`Proactor`](crate::Proactor) on the dispatcher thread.
///
/// By the time `notify` is called the operation has completed, so
/// [`Operation::get_result`] always succeeds inside it.
pub trait Observer<T>: Send + Sync {
    /// Called once per finished operation with the sequence number it was admitted with.
    fn notify(&self, operation: &Arc<Operation<T>>, sequence: SequenceId);
}
