// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "benchmark code")]

use std::hint::black_box;
use std::num::NonZeroUsize;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use proactor::{IdGenerator, InitiatorCompletion, Operation};

const OPERATIONS: u64 = 64;

fn submit_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_and_drain");

    for pool_size in [1, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(pool_size), &pool_size, |b, &pool_size| {
            b.iter(|| {
                let initiator = InitiatorCompletion::<u64>::builder()
                    .with_pool_size(NonZeroUsize::new(pool_size).expect("pool sizes above are not zero"))
                    .build()
                    .expect("dispatcher thread starts");
                let ids = IdGenerator::new();

                for value in 0..OPERATIONS {
                    initiator
                        .submit(Operation::new(&ids, move || black_box(value) * 2))
                        .expect("operation thread starts");
                }

                black_box(initiator.shutdown().expect("dispatcher does not panic"))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, submit_and_drain);
criterion_main!(benches);
