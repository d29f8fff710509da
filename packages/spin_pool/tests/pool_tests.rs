//! Integration tests for `ConcurrentBufferPool` through its public API.
//!
//! These exercise the pool the way a host application would: claims and releases interleaved
//! across threads, slot table growth while buffers are in use and background maintenance.

#![allow(
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::modulo_arithmetic,
    reason = "test code, be concise"
)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use spin_pool::{
    BufferClaim, CheckPolicy, ConcurrentBufferPool, LeakTracker, MaintenanceWorker,
    RentalPolicy,
};
use testing::{hammer, with_watchdog};

const GENEROUS: Duration = Duration::from_secs(5);

#[test]
fn scenario_lifo_reuse_and_stable_growth() {
    let pool = ConcurrentBufferPool::builder()
        .initial_slots(4)
        .buffer_capacity(64)
        .build();

    let mut claims = (0..4)
        .map(|_| pool.claim_buffer::<u8>().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(
        claims.iter().map(BufferClaim::index).collect::<Vec<_>>(),
        [0, 1, 2, 3]
    );

    for claim in &mut claims {
        let marker = u8::try_from(claim.index()).unwrap();
        claim.extend_from_slice(&[marker; 64]).unwrap();
    }

    // Release index 1 and claim again: the same slot must come back.
    claims.remove(1).release().unwrap();

    let reclaimed = pool.claim_buffer::<u8>().unwrap();
    assert_eq!(reclaimed.index(), 1);
    assert!(reclaimed.is_empty());
    assert!(reclaimed.as_bytes().iter().all(|&b| b == 0));

    let addresses_before = claims
        .iter()
        .map(|claim| claim.as_slice().as_ptr())
        .collect::<Vec<_>>();

    // A fifth claim forces the slot table to grow.
    let fifth = pool.claim_buffer::<u8>().unwrap();
    assert_eq!(fifth.index(), 4);
    assert!(pool.slot_count().unwrap() > 4);

    let addresses_after = claims
        .iter()
        .map(|claim| claim.as_slice().as_ptr())
        .collect::<Vec<_>>();

    assert_eq!(addresses_before, addresses_after);

    for claim in &claims {
        let marker = u8::try_from(claim.index()).unwrap();
        assert!(claim.as_slice().iter().all(|&b| b == marker));
    }
}

#[test]
fn released_buffers_never_leak_data_to_the_next_claimant() {
    let pool = ConcurrentBufferPool::builder()
        .initial_slots(1)
        .buffer_capacity(32)
        .build();

    for round in 0..10_u64 {
        let mut claim = pool.claim_buffer::<u64>().unwrap();

        assert_eq!(claim.index(), 0);
        assert!(claim.is_empty());
        assert!(claim.as_bytes().iter().all(|&b| b == 0));

        // Grow past the baseline on some rounds to also cover reallocated storage.
        let count = if round % 2 == 0 { 4 } else { 40 };
        for value in 0..count {
            claim.push(u64::MAX - value - round).unwrap();
        }
    }
}

#[test]
fn claimed_and_free_slots_partition_the_table() {
    let pool = ConcurrentBufferPool::builder()
        .initial_slots(8)
        .buffer_capacity(16)
        .build();

    let mut held = Vec::new();
    let mut rng = SmallRng::seed_from_u64(0x5EED);

    for _ in 0..500 {
        if held.is_empty() || rng.random_bool(0.55) {
            held.push(pool.claim_buffer::<u32>().unwrap());
        } else {
            let victim = rng.random_range(0..held.len());
            held.swap_remove(victim).release().unwrap();
        }

        let claimed = pool.claimed_count().unwrap();
        let free = pool.free_count().unwrap();
        assert_eq!(claimed, held.len());
        assert_eq!(claimed + free, pool.slot_count().unwrap());

        let indices = held.iter().map(BufferClaim::index).collect::<BTreeSet<_>>();
        assert_eq!(indices.len(), held.len(), "a slot was handed out twice");
        for index in &indices {
            assert!(pool.is_claimed(*index).unwrap());
        }
    }
}

#[test]
fn randomized_concurrent_claims_keep_bookkeeping_consistent() {
    with_watchdog(|| {
        const THREADS: usize = 4;
        const ROUNDS: usize = 400;

        let pool = Arc::new(
            ConcurrentBufferPool::builder()
                .initial_slots(2)
                .buffer_capacity(32)
                .lock_timeout(GENEROUS)
                .build(),
        );

        hammer(THREADS, {
            let pool = Arc::clone(&pool);

            move |thread_index| {
                let mut rng = SmallRng::seed_from_u64(thread_index as u64);
                let mut held: Vec<(BufferClaim<'_, u64>, u64, usize)> = Vec::new();

                for round in 0..ROUNDS {
                    if held.len() < 4 && (held.is_empty() || rng.random_bool(0.6)) {
                        let mut claim = pool.claim_buffer::<u64>().unwrap();
                        assert!(claim.is_empty(), "claimed a buffer with stale contents");

                        let marker = ((thread_index as u64) << 32) | round as u64;
                        let count = rng.random_range(1..64);
                        for _ in 0..count {
                            claim.push(marker).unwrap();
                        }

                        held.push((claim, marker, count));
                    } else {
                        let victim = rng.random_range(0..held.len());
                        let (claim, marker, count) = held.swap_remove(victim);

                        assert_eq!(claim.len(), count);
                        assert!(
                            claim.as_slice().iter().all(|&value| value == marker),
                            "another claimant wrote into our buffer"
                        );

                        claim.release().unwrap();
                    }
                }

                for (claim, marker, _) in held {
                    assert!(claim.as_slice().iter().all(|&value| value == marker));
                    claim.release().unwrap();
                }
            }
        });

        assert_eq!(pool.claimed_count().unwrap(), 0);
        assert_eq!(pool.free_count().unwrap(), pool.slot_count().unwrap());
    });
}

#[test]
fn maintenance_worker_runs_alongside_claimants() {
    with_watchdog(|| {
        let pool = Arc::new(
            ConcurrentBufferPool::builder()
                .initial_slots(4)
                .buffer_capacity(16)
                .shrink_factor(2)
                .lock_timeout(GENEROUS)
                .build(),
        );

        let worker = MaintenanceWorker::spawn(Arc::clone(&pool), Duration::from_millis(1));

        hammer(3, {
            let pool = Arc::clone(&pool);

            move |thread_index| {
                for round in 0..200_u32 {
                    let mut claim = pool.claim_buffer::<u32>().unwrap();
                    let marker = (u32::try_from(thread_index).unwrap() << 16) | round;

                    // Grow well past the shrink threshold so maintenance has work to do.
                    claim.extend_from_slice(&[marker; 64]).unwrap();
                    assert!(claim.as_slice().iter().all(|&value| value == marker));

                    claim.release().unwrap();
                }
            }
        });

        drop(worker);

        // With nobody claiming, a few direct passes restore every buffer to the baseline.
        for _ in 0..pool.slot_count().unwrap() {
            pool.run_maintenance().unwrap();
        }

        let claims = (0..pool.slot_count().unwrap())
            .map(|_| pool.claim_buffer::<u8>().unwrap())
            .collect::<Vec<_>>();

        for claim in &claims {
            assert!(claim.capacity() <= 32, "slot {} was not shrunk", claim.index());
        }
    });
}

#[test]
fn raw_claims_round_trip_and_leak_reporting() {
    let tracker = LeakTracker::new();

    let pool = ConcurrentBufferPool::builder()
        .initial_slots(2)
        .check_policy(CheckPolicy::Lenient)
        .rental_policy(RentalPolicy::Refuse)
        .leak_tracker(&tracker)
        .build();

    let mut claim = pool.claim_buffer::<i32>().unwrap();
    claim.extend_from_slice(&[-1, -2, -3]).unwrap();
    let raw = claim.into_raw();

    // SAFETY: Detached above, no other claim for this slot exists.
    let claim = unsafe { pool.claim_from_raw::<i32>(raw) }.unwrap();
    assert_eq!(claim.as_slice(), &[-1, -2, -3]);

    // Leak it on purpose.
    let _leaked = claim.into_raw();
    drop(pool);

    let report = tracker.report();
    assert_eq!(report.leaked_claims, 1);
    assert!(!report.is_clean());
}
