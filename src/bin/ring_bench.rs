//! Ring throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin ring_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the single-producer bench producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin the single-consumer bench consumer to CPU 2 (default: 2)
//!     PRODUCERS=4     Producer threads in the contended bench (default: 4)
//!     CONSUMERS=4     Consumer threads in the contended bench (default: 4)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use rotor::{Flags, Ring};

const RING_SIZE: u32 = 1 << 16;
const ITERATIONS: u64 = 1 << 24;
const BATCH: usize = 32;

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

/// One pinned producer, one pinned consumer, burst transfers.
fn bench_spsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let ring = Arc::new(Ring::<u64>::new(RING_SIZE, Flags::SP_ENQ | Flags::SC_DEQ).unwrap());

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = Arc::clone(&ready);
    let ring_clone = Arc::clone(&ring);

    let consumer = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        ready_clone.store(true, Ordering::Release);

        let mut out = [0u64; BATCH];
        let mut expected = 0u64;
        while expected < ITERATIONS {
            let n = ring_clone.dequeue_burst(&mut out);
            for &value in &out[..n as usize] {
                if value != expected {
                    panic!("data corruption: expected {expected}, got {value}");
                }
                expected += 1;
            }
            if n == 0 {
                hint::spin_loop();
            }
        }
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    let mut batch = [0u64; BATCH];
    let mut next = 0u64;
    while next < ITERATIONS {
        for slot in &mut batch {
            *slot = next;
            next += 1;
        }
        let mut sent = 0u32;
        while sent < BATCH as u32 {
            sent += ring.enqueue_burst(&batch[sent as usize..]);
        }
    }

    consumer.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = u128::from(ITERATIONS) * 1_000_000 / elapsed.as_nanos();
    println!("spsc: {ops_per_ms} ops/ms");
}

/// Contended producers and consumers over the shared CAS paths.
fn bench_mpmc(producers: usize, consumers: usize) {
    let ring = Arc::new(Ring::<u64>::new(RING_SIZE, Flags::empty()).unwrap());
    let per_producer = ITERATIONS / producers as u64;
    let total = per_producer * producers as u64;
    let drained = Arc::new(AtomicU64::new(0));

    let start = Instant::now();

    let producer_threads: Vec<_> = (0..producers)
        .map(|_| {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut batch = [0u64; BATCH];
                let mut next = 0u64;
                while next < per_producer {
                    for slot in &mut batch {
                        *slot = next;
                        next += 1;
                    }
                    let mut sent = 0u32;
                    while sent < BATCH as u32 {
                        let n = ring.enqueue_burst(&batch[sent as usize..]);
                        sent += n;
                        if n == 0 {
                            hint::spin_loop();
                        }
                    }
                }
            })
        })
        .collect();

    let consumer_threads: Vec<_> = (0..consumers)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let drained = Arc::clone(&drained);
            std::thread::spawn(move || {
                let mut out = [0u64; BATCH];
                while drained.load(Ordering::Relaxed) < total {
                    let n = ring.dequeue_burst(&mut out);
                    if n == 0 {
                        hint::spin_loop();
                    } else {
                        drained.fetch_add(u64::from(n), Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for t in producer_threads {
        t.join().unwrap();
    }
    for t in consumer_threads {
        t.join().unwrap();
    }
    let elapsed = start.elapsed();

    let ops_per_ms = u128::from(total) * 1_000_000 / elapsed.as_nanos();
    println!("mpmc {producers}p/{consumers}c: {ops_per_ms} ops/ms");
}

fn main() {
    rotor::init_tracing();

    let producer_cpu = Some(env_usize("PRODUCER_CPU", 0));
    let consumer_cpu = Some(env_usize("CONSUMER_CPU", 2));
    let producers = env_usize("PRODUCERS", 4);
    let consumers = env_usize("CONSUMERS", 4);

    bench_spsc(producer_cpu, consumer_cpu);
    bench_mpmc(producers, consumers);
}
