//! Multi-threaded contention tests for the ring transfer protocol.
//!
//! Each scenario drives real threads through the shared reservation paths
//! and checks the delivery guarantees after quiescence: nothing lost,
//! nothing duplicated, and per-producer FIFO order preserved end to end.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=rotor=debug cargo test --features tracing --test contention -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use rotor::{Flags, Ring};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        rotor::init_tracing();
    });
}

/// Tags an item with its producer so interleaved streams stay separable.
fn tag(producer: u64, seq: u64) -> u64 {
    (producer << 32) | seq
}

#[test]
fn multi_producer_single_consumer_bulk() {
    init_test_tracing();

    const PRODUCERS: u64 = 4;
    const CHUNK: usize = 16;
    const CHUNKS_PER_PRODUCER: usize = 1600;
    const PER_PRODUCER: u64 = (CHUNK * CHUNKS_PER_PRODUCER) as u64;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let ring = Arc::new(Ring::<u64>::new(1024, Flags::SC_DEQ).unwrap());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut chunk = [0u64; CHUNK];
                for c in 0..CHUNKS_PER_PRODUCER {
                    for (i, slot) in chunk.iter_mut().enumerate() {
                        *slot = tag(p, (c * CHUNK + i) as u64);
                    }
                    // Bulk is all-or-nothing: spin until the whole chunk
                    // lands as one reservation.
                    while ring.enqueue_bulk(&chunk) == 0 {
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();

    // This thread is the one consumer SC_DEQ promises.
    let mut received = Vec::with_capacity(TOTAL);
    let mut out = [0u64; 64];
    while received.len() < TOTAL {
        let n = ring.dequeue_burst(&mut out);
        received.extend_from_slice(&out[..n as usize]);
        if n == 0 {
            std::hint::spin_loop();
        }
        assert!(ring.count() <= ring.capacity());
    }

    for p in producers {
        p.join().unwrap();
    }
    assert!(ring.is_empty());

    // Nothing lost, nothing duplicated.
    let mut sorted = received.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), TOTAL);

    // Per-producer FIFO: each producer's stream arrives in enqueue order.
    let mut last_seq = [None::<u64>; PRODUCERS as usize];
    for &item in &received {
        let producer = (item >> 32) as usize;
        let seq = item & 0xffff_ffff;
        if let Some(prev) = last_seq[producer] {
            assert!(seq > prev, "producer {producer} reordered: {prev} then {seq}");
        }
        last_seq[producer] = Some(seq);
    }
    for (p, last) in last_seq.iter().enumerate() {
        assert_eq!(last.unwrap(), PER_PRODUCER - 1, "producer {p} truncated");
    }
}

#[test]
fn single_producer_multi_consumer_burst() {
    init_test_tracing();

    const TOTAL: u64 = 200_000;
    const CONSUMERS: usize = 4;

    let ring = Arc::new(Ring::<u64>::new(1024, Flags::SP_ENQ).unwrap());
    let drained = Arc::new(AtomicU64::new(0));

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                let mut local = Vec::new();
                let mut out = [0u64; 32];
                while drained.load(Ordering::Relaxed) < TOTAL {
                    let n = ring.dequeue_burst(&mut out);
                    if n == 0 {
                        std::hint::spin_loop();
                        continue;
                    }
                    local.extend_from_slice(&out[..n as usize]);
                    drained.fetch_add(u64::from(n), Ordering::Relaxed);
                }
                local
            })
        })
        .collect();

    // This thread is the one producer SP_ENQ promises.
    let mut batch = [0u64; 32];
    let mut next = 0u64;
    while next < TOTAL {
        for slot in &mut batch {
            *slot = next;
            next += 1;
        }
        let mut sent = 0u32;
        while sent < batch.len() as u32 {
            let n = ring.enqueue_burst(&batch[sent as usize..]);
            sent += n;
            if n == 0 {
                std::hint::spin_loop();
            }
        }
    }

    let streams: Vec<Vec<u64>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    assert!(ring.is_empty());

    // Each consumer's stream is strictly increasing: reservations hand out
    // disjoint cursor ranges in order.
    for (i, stream) in streams.iter().enumerate() {
        for pair in stream.windows(2) {
            assert!(pair[0] < pair[1], "consumer {i} reordered: {pair:?}");
        }
    }

    // The union of the streams is exactly the produced sequence.
    let mut all: Vec<u64> = streams.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<u64> = (0..TOTAL).collect();
    assert_eq!(all, expected);
}

#[test]
fn multi_producer_multi_consumer_conservation() {
    init_test_tracing();

    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u64 = 25_000;
    const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

    let ring = Arc::new(Ring::<u64>::new(512, Flags::empty()).unwrap());
    let drained = Arc::new(AtomicU64::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let mut item = tag(p, seq);
                    while let Err(back) = ring.push(item) {
                        item = back;
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                let mut local = Vec::new();
                let mut out = [0u64; 16];
                while drained.load(Ordering::Relaxed) < TOTAL {
                    assert!(ring.count() <= ring.capacity());
                    let n = ring.dequeue_burst(&mut out);
                    if n == 0 {
                        std::hint::spin_loop();
                        continue;
                    }
                    local.extend_from_slice(&out[..n as usize]);
                    drained.fetch_add(u64::from(n), Ordering::Relaxed);
                }
                local
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let streams: Vec<Vec<u64>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();

    // Quiescent: everything produced was drained, once.
    assert!(ring.is_empty());
    assert_eq!(ring.count(), 0);

    let mut all: Vec<u64> = streams.into_iter().flatten().collect();
    assert_eq!(all.len() as u64, TOTAL);
    all.sort_unstable();
    let mut expected: Vec<u64> = (0..PRODUCERS)
        .flat_map(|p| (0..PER_PRODUCER).map(move |seq| tag(p, seq)))
        .collect();
    expected.sort_unstable();
    assert_eq!(all, expected);
}
