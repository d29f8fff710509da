//! Integration tests for `PackedIndexProvider` and the rentals handed out by `ConcurrentList`.

#![allow(clippy::cast_possible_truncation, reason = "test code, be concise")]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use spin_pool::{ConcurrentList, Error, PackedIndexProvider, RentalPolicy};
use testing::{hammer, with_watchdog};

const GENEROUS: Duration = Duration::from_secs(5);

#[test]
fn returned_indices_are_reissued_before_new_ones() {
    let provider = PackedIndexProvider::new();

    let first = (0..32)
        .map(|_| provider.fetch_index().unwrap())
        .collect::<BTreeSet<_>>();

    assert_eq!(first, (0..32).collect::<BTreeSet<_>>());

    for index in &first {
        provider.return_index(*index).unwrap();
    }

    let second = (0..32)
        .map(|_| provider.fetch_index().unwrap())
        .collect::<BTreeSet<_>>();

    assert_eq!(first, second);
    assert_eq!(provider.frontier().unwrap(), 32);

    for index in second {
        provider.return_index(index).unwrap();
    }
}

#[test]
fn claiming_far_ahead_makes_the_gap_fetchable() {
    let provider = PackedIndexProvider::new();

    assert_eq!(provider.fetch_index().unwrap(), 0);
    assert!(provider.try_claim_index(10).unwrap());
    assert!(!provider.try_claim_index(10).unwrap());

    // Everything skipped over is handed out, lowest first, before index 11 is minted.
    let gap = (0..9)
        .map(|_| provider.fetch_index().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(gap, (1..10).collect::<Vec<_>>());
    assert_eq!(provider.fetch_index().unwrap(), 11);
    assert_eq!(provider.taken_count().unwrap(), 12);

    for index in 0..12 {
        provider.return_index(index).unwrap();
    }

    assert_eq!(provider.taken_count().unwrap(), 0);
}

#[test]
fn bounded_provider_reports_exhaustion() {
    let provider = PackedIndexProvider::builder().max_index(2).build();

    for expected in 0..3 {
        assert_eq!(provider.fetch_index().unwrap(), expected);
    }

    assert!(matches!(
        provider.fetch_index(),
        Err(Error::IndexExhausted { .. })
    ));
    assert_eq!(provider.peek_next().unwrap(), None);

    provider.return_index(1).unwrap();
    assert_eq!(provider.peek_next().unwrap(), Some(1));
    assert_eq!(provider.fetch_index().unwrap(), 1);

    for index in 0..3 {
        provider.return_index(index).unwrap();
    }
}

#[test]
fn concurrent_fetchers_never_share_an_index() {
    with_watchdog(|| {
        let provider = Arc::new(
            PackedIndexProvider::builder()
                .lock_timeout(GENEROUS)
                .build(),
        );
        let owners = Arc::new(Mutex::new(BTreeSet::new()));

        hammer(4, {
            let provider = Arc::clone(&provider);
            let owners = Arc::clone(&owners);

            move |thread_index| {
                let mut rng = SmallRng::seed_from_u64(thread_index as u64);
                let mut held = Vec::new();

                for _ in 0..500 {
                    if held.is_empty() || rng.random_bool(0.5) {
                        let index = provider.fetch_index().unwrap();
                        assert!(
                            owners.lock().unwrap().insert(index),
                            "index {index} was issued twice"
                        );
                        held.push(index);
                    } else {
                        let index = held.swap_remove(rng.random_range(0..held.len()));
                        assert!(owners.lock().unwrap().remove(&index));
                        provider.return_index(index).unwrap();
                    }
                }

                for index in held {
                    assert!(owners.lock().unwrap().remove(&index));
                    provider.return_index(index).unwrap();
                }
            }
        });

        assert_eq!(provider.taken_count().unwrap(), 0);
    });
}

#[test]
fn list_rentals_follow_the_configured_policy() {
    let invalidating = ConcurrentList::builder()
        .initial_capacity(2)
        .rental_policy(RentalPolicy::Invalidate)
        .build();

    invalidating.push(7_u32, GENEROUS).unwrap();
    invalidating.push(8_u32, GENEROUS).unwrap();

    let rental = invalidating.rent(1, GENEROUS).unwrap();
    assert!(rental.is_valid());

    // Removing the first element shifts the rented one, which invalidates the rental.
    invalidating.remove(0, GENEROUS).unwrap();
    assert!(!rental.is_valid());
    assert_eq!(invalidating.live_rentals(GENEROUS).unwrap(), 0);

    let refusing = ConcurrentList::builder()
        .rental_policy(RentalPolicy::Refuse)
        .build();

    refusing.push(1_u32, GENEROUS).unwrap();
    refusing.push(2_u32, GENEROUS).unwrap();

    let rental = refusing.rent(1, GENEROUS).unwrap();

    assert!(matches!(
        refusing.remove(0, GENEROUS),
        Err(Error::OutstandingRentals { .. })
    ));
    assert_eq!(refusing.get(0, GENEROUS).unwrap(), 1);

    // SAFETY: The list refused to move the element, so the rental still points at it.
    assert_eq!(unsafe { rental.try_read() }, Some(2));

    drop(rental);
    assert_eq!(refusing.remove(0, GENEROUS).unwrap(), 1);
    assert_eq!(refusing.len(GENEROUS).unwrap(), 1);
}

#[test]
fn batched_reads_see_a_consistent_snapshot() {
    with_watchdog(|| {
        let list = Arc::new(ConcurrentList::<u64>::new());

        hammer(4, {
            let list = Arc::clone(&list);

            move |thread_index| {
                for round in 0..200_u64 {
                    if thread_index == 0 {
                        // Each write keeps every element equal to the element count.
                        let mut writer = list.write(GENEROUS).unwrap();
                        writer.push(0).unwrap();
                        let len = writer.len() as u64;
                        for index in 0..writer.len() {
                            writer.set(index, len).unwrap();
                        }
                    } else {
                        let reader = list.read(GENEROUS).unwrap();
                        let len = reader.len() as u64;
                        assert!(reader.iter().all(|&value| value == len), "round {round}");
                    }
                }
            }
        });

        assert_eq!(list.len(GENEROUS).unwrap(), 200);
    });
}
