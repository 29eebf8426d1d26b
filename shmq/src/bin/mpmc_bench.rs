//! MPMC queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin mpmc_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the (first) producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin the (first) consumer to CPU 2 (default: 2)

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

use shmq::ShmSafe;
use shmq::queue::{TurnQueue, VarQueue};
use shmq::shm::{Attach, Create, ShmBuffer, ShmName};
use shmq::timer::Timer;

const TURN_SLOTS: usize = 1 << 13;
const TURN_OPS: u64 = 1 << 22;

const VAR_CAP: usize = 1 << 20;
const VAR_OPS: u64 = 1 << 20;
const VAR_PAYLOAD: usize = 64;

/// The 24-byte record exchanged by the element benchmarks.
#[derive(ShmSafe, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct Element {
    producer_id: u64,
    timestamp_ns: u64,
    sequence: u64,
}

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn unique_name(tag: &str) -> ShmName {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    ShmName::new(format!(
        "/mpmc-bench-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
    .expect("benchmark name is a valid shm name")
}

fn report(label: &str, ops: u64, elapsed_ns: u64) {
    let ops_per_ms = ops as u128 * 1_000_000 / elapsed_ns.max(1) as u128;
    println!("{label}: {ops_per_ms} ops/ms");
}

fn bench_turn_1p1c(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let name = unique_name("turn");
    let capacity = 4 << 20;
    let mut owner = ShmBuffer::<Create>::create(name.clone(), capacity).unwrap();
    let queue = TurnQueue::<Element, TURN_SLOTS>::create_in(&mut owner).unwrap();
    // SAFETY: create_in initialized the queue; `owner` keeps the mapping
    // alive past the thread scope below.
    let queue = unsafe { queue.as_ref() };

    // The consumer drives the queue through its own mapping of the region,
    // the same way a second process would.
    let peer = ShmBuffer::<Attach>::attach(name, capacity).unwrap();
    let view = peer.view::<TurnQueue<Element, TURN_SLOTS>>(0).unwrap();
    // SAFETY: offset 0 holds the queue the creator constructed.
    let peer_queue = unsafe { view.as_ref() };

    let mut elapsed_ns = 0u64;
    std::thread::scope(|s| {
        s.spawn(|| {
            pin_to_cpu(consumer_cpu);
            for expected in 0..TURN_OPS {
                let element = peer_queue.pop();
                assert_eq!(
                    element,
                    Element {
                        producer_id: 1,
                        timestamp_ns: 1,
                        sequence: expected,
                    },
                    "data corruption"
                );
            }
        });

        pin_to_cpu(producer_cpu);
        let _timer = Timer::new(&mut elapsed_ns);
        for sequence in 0..TURN_OPS {
            queue.push(Element {
                producer_id: 1,
                timestamp_ns: 1,
                sequence,
            });
        }
    });

    report("turn queue 1P1C", TURN_OPS, elapsed_ns);
}

fn bench_turn_4p4c(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let name = unique_name("turn-mpmc");
    let mut owner = ShmBuffer::<Create>::create(name, 4 << 20).unwrap();
    let queue = TurnQueue::<Element, TURN_SLOTS>::create_in(&mut owner).unwrap();
    // SAFETY: initialized by create_in; owner outlives the scope.
    let queue = unsafe { queue.as_ref() };

    let threads = 4u64;
    let per_producer = TURN_OPS / threads;
    let popped = AtomicUsize::new(0);

    let mut elapsed_ns = 0u64;
    {
        let _timer = Timer::new(&mut elapsed_ns);
        std::thread::scope(|s| {
            for p in 0..threads {
                let queue = &queue;
                s.spawn(move || {
                    if p == 0 {
                        pin_to_cpu(producer_cpu);
                    }
                    for sequence in 0..per_producer {
                        queue.push(Element {
                            producer_id: p,
                            timestamp_ns: 0,
                            sequence,
                        });
                    }
                });
            }
            for c in 0..threads {
                let queue = &queue;
                let popped = &popped;
                s.spawn(move || {
                    if c == 0 {
                        pin_to_cpu(consumer_cpu);
                    }
                    while popped.load(Ordering::Relaxed) < TURN_OPS as usize {
                        if queue.try_pop().is_some() {
                            popped.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                });
            }
        });
    }

    assert_eq!(popped.load(Ordering::Relaxed), TURN_OPS as usize);
    report("turn queue 4P4C", TURN_OPS, elapsed_ns);
}

fn bench_var_1p1c(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let name = unique_name("var");
    let mut owner = ShmBuffer::<Create>::create(name, 2 << 20).unwrap();
    let queue = VarQueue::<VAR_CAP>::create_in(&mut owner).unwrap();
    // SAFETY: initialized by create_in; owner outlives the scope.
    let queue = unsafe { queue.as_ref() };

    let payload = [0x5Au8; VAR_PAYLOAD];

    let mut elapsed_ns = 0u64;
    std::thread::scope(|s| {
        s.spawn(|| {
            pin_to_cpu(consumer_cpu);
            let mut out = Vec::new();
            let mut received = 0u64;
            while received < VAR_OPS {
                if queue.try_pop(&mut out) {
                    assert_eq!(out.len(), VAR_PAYLOAD, "data corruption");
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        pin_to_cpu(producer_cpu);
        let _timer = Timer::new(&mut elapsed_ns);
        for _ in 0..VAR_OPS {
            while !queue.try_push(&payload) {
                std::hint::spin_loop();
            }
        }
    });

    report("var queue 1P1C", VAR_OPS, elapsed_ns);
}

fn main() {
    shmq::init_tracing();
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!(
        "shmq MPMC (turn slots={TURN_SLOTS}, turn ops={TURN_OPS}, var cap={VAR_CAP}, var ops={VAR_OPS}):"
    );
    bench_turn_1p1c(producer_cpu, consumer_cpu);
    bench_turn_4p4c(producer_cpu, consumer_cpu);
    bench_var_1p1c(producer_cpu, consumer_cpu);
}
