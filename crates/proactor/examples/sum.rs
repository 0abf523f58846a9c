// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Submits six additions to a pool of two and reports their results as they complete.
//!
//! Each addition sleeps for a random time, so results arrive out of submission order.
//! Run with `RUST_LOG`-style verbosity fixed at DEBUG to see the full lifecycle.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proactor::{IdGenerator, InitiatorCompletion, Operation};
use tracing::{Level, event};

/// An operation that adds up `elements`, taking a random while to do so.
fn sum(ids: &IdGenerator, elements: Vec<i64>) -> Arc<Operation<i64>> {
    Operation::new(ids, move || {
        let total = elements.iter().sum();
        thread::sleep(Duration::from_millis(fastrand::u64(..1500)));
        total
    })
}

fn main() -> Result<(), proactor::Error> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let ids = IdGenerator::new();
    let operations: Vec<_> = (1..=6)
        .map(|n: i64| sum(&ids, vec![n * 10, n * 10 + 1]))
        .collect();

    event!(Level::INFO, message = "starting operations execution");

    let initiator = InitiatorCompletion::new()?;
    for operation in &operations {
        initiator.submit(Arc::clone(operation))?;
    }

    let delivered = initiator.shutdown()?;
    event!(Level::INFO, message = "done", delivered);

    for operation in &operations {
        println!(
            "operation {}: {} ({} ms)",
            operation.id(),
            operation.get_result()?,
            operation.elapsed().map_or(0, |elapsed| elapsed.as_millis()),
        );
    }

    Ok(())
}
