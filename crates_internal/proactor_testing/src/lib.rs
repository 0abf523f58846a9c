// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Testing utilities for the `proactor` crate. The entire API surface is unstable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, mpsc};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// If something (whatever) does not happen in a test within this time, the test will fail.
///
/// We are conservative here and allow much time - this is only to break out of deadlocks, not
/// for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes a thread-safe function on a background thread and abandons it if
/// it does not complete before [`TEST_TIMEOUT`].
///
/// Returns `None` if the function panicked or timed out.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
#[must_use]
pub fn execute_or_abandon<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    // If the function panics, the sender is dropped without sending and recv_timeout
    // reports a disconnected channel, same as for a timeout.
    thread::spawn(move || {
        let result = f();
        _ = sender.send(result);
    });

    receiver.recv_timeout(TEST_TIMEOUT).ok()
}

/// Enables logging of test output to the standard output stream.
///
/// Standard output is limited to DEBUG and above. Logging is global state and lasts until
/// the end of the process; calling this more than once is harmless.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
pub fn log_to_stdout() {
    LOGGING_INITIALIZER.call_once(|| {
        let terminal_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(LevelFilter::from_level(Level::DEBUG));

        // Another test harness may have installed a subscriber already; theirs wins.
        _ = tracing_subscriber::registry().with(terminal_layer).try_init();
    });
}

static LOGGING_INITIALIZER: Once = Once::new();

/// A latch that holds back operation work until the test opens it.
///
/// Clones share the same latch. Once opened, it stays open.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the gate is opened.
    pub fn wait(&self) {
        let mut open = self.inner.open.lock();

        while !*open {
            self.inner.opened.wait(&mut open);
        }
    }

    /// Opens the gate, releasing every current and future waiter.
    pub fn open(&self) {
        *self.inner.open.lock() = true;
        self.inner.opened.notify_all();
    }

    /// Whether [`open`](Self::open) has been called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.inner.open.lock()
    }
}

/// Measures how many pieces of work run at the same time.
///
/// Work calls [`enter`](Self::enter) when it starts and keeps the returned guard alive until
/// it ends. The probe remembers the highest number of simultaneous entries.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe that has seen no work yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one more piece of work as running until the returned guard is dropped.
    pub fn enter(&self) -> ProbeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.inner.peak.fetch_max(now, Ordering::AcqRel);

        ProbeGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of pieces of work running right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    /// The highest number of pieces of work that ran at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }
}

/// Marks a piece of work as running until dropped.
#[derive(Debug)]
#[must_use]
pub struct ProbeGuard {
    inner: Arc<ProbeInner>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_releases_waiters() {
        let gate = Gate::new();
        assert!(!gate.is_open());

        let waiter = thread::spawn({
            let gate = gate.clone();
            move || gate.wait()
        });

        gate.open();
        execute_or_abandon(move || waiter.join().unwrap()).unwrap();
        assert!(gate.is_open());
    }

    #[test]
    fn probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();

        let first = probe.enter();
        let second = probe.enter();
        assert_eq!(probe.current(), 2);
        drop(first);
        drop(second);

        let _third = probe.enter();
        assert_eq!(probe.current(), 1);
        assert_eq!(probe.peak(), 2);
    }

    #[test]
    fn abandon_reports_panic_as_none() {
        let result: Option<()> = execute_or_abandon(|| panic!("boom"));
        assert!(result.is_none());
    }
}
