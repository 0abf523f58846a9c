// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! End-to-end tests for `InitiatorCompletion`.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use proactor::{Error, IdGenerator, InitiatorCompletion, Operation, SequenceId};
use proactor_testing::{ConcurrencyProbe, Gate, TEST_TIMEOUT, execute_or_abandon, log_to_stdout};
use rstest::rstest;

fn pool(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap()
}

/// An initiator whose completion callback forwards `(sequence, result)` to the returned receiver.
fn reporting_initiator(pool_size: usize) -> (InitiatorCompletion<u64>, mpsc::Receiver<(SequenceId, u64)>) {
    let (tx, rx) = mpsc::channel();

    let initiator = InitiatorCompletion::builder()
        .with_pool_size(pool(pool_size))
        .with_thread_name("initiator-test")
        .on_completion(move |operation: &Arc<Operation<u64>>, sequence| {
            let result = operation.get_result().expect("completed operations have a result");
            _ = tx.send((sequence, result));
        })
        .build()
        .unwrap();

    (initiator, rx)
}

fn gated(ids: &IdGenerator, gate: &Gate, value: u64) -> Arc<Operation<u64>> {
    let gate = gate.clone();
    Operation::new(ids, move || {
        gate.wait();
        value
    })
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
fn submit_blocks_once_pool_is_full(#[case] pool_size: usize) {
    log_to_stdout();

    let initiator = Arc::new(
        InitiatorCompletion::<u64>::builder()
            .with_pool_size(pool(pool_size))
            .build()
            .unwrap(),
    );
    let ids = Arc::new(IdGenerator::new());
    let gate = Gate::new();

    for value in 0..pool_size {
        initiator.submit(gated(&ids, &gate, value as u64)).unwrap();
    }
    assert_eq!(initiator.in_flight(), pool_size);

    let returned = Arc::new(AtomicBool::new(false));
    let submitter = thread::spawn({
        let initiator = Arc::clone(&initiator);
        let ids = Arc::clone(&ids);
        let returned = Arc::clone(&returned);
        move || {
            initiator.submit(Operation::new(&ids, || 100)).unwrap();
            returned.store(true, Ordering::SeqCst);
        }
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::SeqCst), "submit must block while the pool is full");
    assert_eq!(initiator.in_flight(), pool_size);

    gate.open();
    execute_or_abandon(move || submitter.join().unwrap()).unwrap();
    assert!(returned.load(Ordering::SeqCst));

    let initiator = Arc::into_inner(initiator).unwrap();
    assert_eq!(initiator.peak_in_flight(), pool_size);
    assert_eq!(initiator.shutdown().unwrap(), pool_size + 1);
}

#[test]
fn every_submitted_operation_is_reported_once() {
    log_to_stdout();

    const OPERATIONS: u64 = 24;

    let (initiator, rx) = reporting_initiator(3);
    let ids = IdGenerator::new();

    let operations: Vec<_> = (0..OPERATIONS)
        .map(|value| {
            Operation::new(&ids, move || {
                thread::sleep(Duration::from_millis(value % 4 * 5));
                value * 2
            })
        })
        .collect();

    for operation in &operations {
        initiator.submit(Arc::clone(operation)).unwrap();
    }

    let delivered = execute_or_abandon(move || initiator.shutdown().unwrap()).unwrap();
    assert_eq!(delivered, OPERATIONS as usize);

    let reports: Vec<_> = rx.try_iter().collect();
    assert_eq!(reports.len(), OPERATIONS as usize);

    let sequences: BTreeSet<_> = reports.iter().map(|(sequence, _)| sequence.get()).collect();
    assert_eq!(sequences, (1..=OPERATIONS).collect());

    for operation in &operations {
        assert!(operation.is_completed());
        let sequence = operation.sequence().unwrap();
        let reported = reports.iter().find(|(s, _)| *s == sequence).unwrap().1;
        assert_eq!(reported, operation.get_result().unwrap());
    }
}

#[test]
fn completions_are_reported_in_completion_order() {
    log_to_stdout();

    let (initiator, rx) = reporting_initiator(3);
    let ids = IdGenerator::new();
    let gates = [Gate::new(), Gate::new(), Gate::new()];

    let first = initiator.submit(gated(&ids, &gates[0], 10)).unwrap();
    let second = initiator.submit(gated(&ids, &gates[1], 20)).unwrap();
    let third = initiator.submit(gated(&ids, &gates[2], 30)).unwrap();

    let mut order = Vec::new();
    for index in [2, 0, 1] {
        gates[index].open();
        order.push(rx.recv_timeout(TEST_TIMEOUT).unwrap());
    }

    assert_eq!(order, vec![(third, 30), (first, 10), (second, 20)]);
    assert_eq!(initiator.shutdown().unwrap(), 3);
}

#[test]
fn result_is_unavailable_until_work_finishes() {
    let initiator = InitiatorCompletion::<u64>::new().unwrap();
    let ids = IdGenerator::new();
    let gate = Gate::new();

    let operation = gated(&ids, &gate, 77);
    initiator.submit(Arc::clone(&operation)).unwrap();

    assert!(matches!(
        operation.get_result(),
        Err(Error::NotFinished { id }) if id == operation.id()
    ));

    gate.open();
    initiator.shutdown().unwrap();

    assert_eq!(operation.get_result().unwrap(), 77);
    assert!(operation.started_at().unwrap() <= operation.finished_at().unwrap());
}

#[test]
fn shutdown_after_everything_was_reported_is_prompt() {
    let (initiator, rx) = reporting_initiator(2);
    let ids = IdGenerator::new();

    for value in 0..4 {
        initiator.submit(Operation::new(&ids, move || value)).unwrap();
    }
    for _ in 0..4 {
        rx.recv_timeout(TEST_TIMEOUT).unwrap();
    }
    assert_eq!(initiator.delivered(), 4);
    assert_eq!(initiator.pending_completions(), 0);

    let started = Instant::now();
    let delivered = initiator.shutdown().unwrap();

    assert_eq!(delivered, 4);
    assert!(started.elapsed() < Duration::from_secs(1), "shutdown took {:?}", started.elapsed());
}

#[test]
fn shutdown_without_submissions() {
    let initiator = InitiatorCompletion::<u64>::new().unwrap();
    assert_eq!(initiator.shutdown().unwrap(), 0);
}

#[test]
fn concurrent_submitters_share_the_pool() {
    log_to_stdout();

    let delivered = Arc::new(AtomicUsize::new(0));
    let probe = ConcurrencyProbe::new();
    let initiator = InitiatorCompletion::<u64>::builder()
        .with_pool_size(pool(2))
        .on_completion({
            let delivered = Arc::clone(&delivered);
            move |_, _| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();
    let ids = IdGenerator::new();

    thread::scope(|scope| {
        for submitter in 0..4_u64 {
            let (initiator, ids, probe) = (&initiator, &ids, &probe);
            scope.spawn(move || {
                for value in 0..5 {
                    let probe = probe.clone();
                    initiator
                        .submit(Operation::new(ids, move || {
                            let _running = probe.enter();
                            thread::sleep(Duration::from_millis(5));
                            submitter * 10 + value
                        }))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(initiator.shutdown().unwrap(), 20);
    assert_eq!(delivered.load(Ordering::SeqCst), 20);
    assert!(probe.peak() <= 2, "{} operations ran at once", probe.peak());
}

#[test]
fn staggered_sums_with_pool_of_two() {
    log_to_stdout();

    let (initiator, rx) = reporting_initiator(2);
    let ids = IdGenerator::new();
    let probe = ConcurrencyProbe::new();

    // Staggered durations, so completions interleave with blocked submissions.
    let pairs = [(1, 2, 40), (3, 4, 160), (5, 6, 10), (7, 8, 120), (9, 10, 70)];

    for (a, b, delay_ms) in pairs {
        let probe = probe.clone();
        initiator
            .submit(Operation::new(&ids, move || {
                let _running = probe.enter();
                thread::sleep(Duration::from_millis(delay_ms));
                a + b
            }))
            .unwrap();
        assert!(initiator.in_flight() <= 2);
    }

    assert_eq!(execute_or_abandon(move || initiator.shutdown().unwrap()), Some(5));

    let results: BTreeSet<u64> = rx.try_iter().map(|(_, result)| result).collect();
    assert_eq!(results, BTreeSet::from([3, 7, 11, 15, 19]));
    assert!(probe.peak() <= 2, "{} operations ran at once", probe.peak());
}

#[test]
fn executed_operation_is_rejected_and_not_counted() {
    let (initiator, rx) = reporting_initiator(2);
    let ids = IdGenerator::new();

    let executed = Operation::new(&ids, || 5);
    executed.execute();

    assert!(matches!(
        initiator.submit(Arc::clone(&executed)),
        Err(Error::AlreadyExecuted { id }) if id == executed.id()
    ));
    assert_eq!(initiator.in_flight(), 0);

    let fresh = initiator.submit(Operation::new(&ids, || 6)).unwrap();
    assert_eq!(fresh, SequenceId::new(1), "a rejected submission does not use up a sequence");

    assert_eq!(execute_or_abandon(move || initiator.shutdown().unwrap()), Some(1));
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![(fresh, 6)]);
}

#[test]
fn sequences_follow_admission_order_across_submitters() {
    log_to_stdout();

    // With a single slot, operations finish in the order they were admitted.
    let (initiator, rx) = reporting_initiator(1);
    let ids = IdGenerator::new();

    thread::scope(|scope| {
        for _ in 0..4 {
            let (initiator, ids) = (&initiator, &ids);
            scope.spawn(move || {
                for value in 0..5 {
                    initiator
                        .submit(Operation::new(ids, move || {
                            thread::sleep(Duration::from_millis(2));
                            value
                        }))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(execute_or_abandon(move || initiator.shutdown().unwrap()), Some(20));

    let sequences: Vec<u64> = rx.try_iter().map(|(sequence, _)| sequence.get()).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
}
