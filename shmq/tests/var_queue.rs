//! End-to-end variable-size queue scenarios: a pre-generated random buffer
//! is cut into random chunks, streamed through a queue living in a shared
//! region, and reassembled at each chunk's recorded offset. The final
//! buffer must be byte-equal to the source however many producers and
//! consumers raced over it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{Rng, RngCore};
use shmq::queue::VarQueue;
use shmq::shm::{Create, ShmBuffer, ShmError, ShmName};

const SOURCE_LEN: usize = 8 << 20;
const MAX_CHUNK: usize = 1001;
const RING_CAP: usize = 1 << 16;
const REGION: usize = 1 << 17;

fn create_or_skip(name: &ShmName, capacity: usize) -> Option<ShmBuffer<Create>> {
    match ShmBuffer::<Create>::create(name.clone(), capacity) {
        Ok(buffer) => Some(buffer),
        Err(ShmError::Os { source, .. }) if source == rustix::io::Errno::ACCESS => {
            eprintln!("Skipping test due to shared memory permission denial");
            None
        }
        Err(err) => panic!("Unexpected shared memory error: {err}"),
    }
}

fn test_name(tag: &str) -> ShmName {
    ShmName::new(format!("/shmq-it-var-{tag}-{}", std::process::id())).unwrap()
}

/// Cuts `len` bytes into consecutive chunks of random length in
/// `[1, MAX_CHUNK]`, returned as (offset, len) pairs.
fn random_chunks(len: usize) -> Vec<(usize, usize)> {
    let mut rng = rand::thread_rng();
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < len {
        let chunk = rng.gen_range(1..=MAX_CHUNK).min(len - offset);
        chunks.push((offset, chunk));
        offset += chunk;
    }
    chunks
}

/// Streams `source` through a ring in shared memory with the given thread
/// counts and returns the reassembled copy.
fn scatter_gather(tag: &str, source: &[u8], producers: usize, consumers: usize) -> Option<Vec<u8>> {
    let chunks = random_chunks(source.len());
    let total = chunks.len();

    let name = test_name(tag);
    let mut owner = create_or_skip(&name, REGION)?;
    let queue = VarQueue::<RING_CAP>::create_in(&mut owner).unwrap();
    // SAFETY: initialized by create_in; `owner` outlives the scope below.
    let queue = unsafe { queue.as_ref() };

    let reassembled = Mutex::new(vec![0u8; source.len()]);
    let popped = AtomicUsize::new(0);

    std::thread::scope(|s| {
        // Chunks are dealt round-robin; each message is the chunk's source
        // offset (little-endian u64) followed by its bytes.
        for p in 0..producers {
            let my_chunks: Vec<(usize, usize)> = chunks
                .iter()
                .copied()
                .skip(p)
                .step_by(producers)
                .collect();
            s.spawn(move || {
                let mut message = Vec::with_capacity(8 + MAX_CHUNK);
                for (offset, len) in my_chunks {
                    message.clear();
                    message.extend_from_slice(&(offset as u64).to_le_bytes());
                    message.extend_from_slice(&source[offset..offset + len]);
                    while !queue.try_push(&message) {
                        std::thread::yield_now();
                    }
                }
            });
        }

        for _ in 0..consumers {
            let reassembled = &reassembled;
            let popped = &popped;
            s.spawn(move || {
                let mut out = Vec::with_capacity(8 + MAX_CHUNK);
                while popped.load(Ordering::Relaxed) < total {
                    if queue.try_pop(&mut out) {
                        popped.fetch_add(1, Ordering::Relaxed);
                        let offset = u64::from_le_bytes(out[..8].try_into().unwrap()) as usize;
                        let payload = &out[8..];
                        reassembled.lock().unwrap()[offset..offset + payload.len()]
                            .copy_from_slice(payload);
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    assert_eq!(popped.load(Ordering::Relaxed), total);
    queue.shrink();
    assert!(queue.empty());
    assert_eq!(queue.size(), 0);

    Some(reassembled.into_inner().unwrap())
}

fn random_source() -> Vec<u8> {
    let mut source = vec![0u8; SOURCE_LEN];
    rand::thread_rng().fill_bytes(&mut source);
    source
}

#[test]
fn eight_producers_one_consumer_reassembles_exactly() {
    let source = random_source();
    let Some(reassembled) = scatter_gather("8p1c", &source, 8, 1) else {
        return;
    };
    assert!(reassembled == source);
}

#[test]
fn eight_producers_eight_consumers_reassembles_exactly() {
    let source = random_source();
    let Some(mut reassembled) = scatter_gather("8p8c", &source, 8, 8) else {
        return;
    };
    assert!(reassembled == source);

    // A single flipped byte on either side must break equality.
    reassembled[SOURCE_LEN / 2] ^= 0xFF;
    assert!(reassembled != source);
    reassembled[SOURCE_LEN / 2] ^= 0xFF;
    let mut mutated_source = source;
    mutated_source[0] ^= 0x01;
    assert!(reassembled != mutated_source);
}

#[test]
fn single_pair_roundtrip_through_shared_memory() {
    let name = test_name("s3");
    let Some(mut owner) = create_or_skip(&name, REGION) else {
        return;
    };
    let queue = VarQueue::<RING_CAP>::create_in(&mut owner).unwrap();
    // SAFETY: initialized by create_in.
    let queue = unsafe { queue.as_ref() };

    assert!(queue.try_push(&[1, 2, 3, 4, 5]));
    let mut out = Vec::new();
    assert!(queue.try_pop(&mut out));
    assert_eq!(out, [1, 2, 3, 4, 5]);
    assert!(queue.empty());
}
