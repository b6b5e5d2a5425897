//! Commute Tests
//!
//! Commuting updates are applied at commit and do not count as reads.

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_intervening_commit_does_not_abort_commuter() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);

    let mut tx1 = stm.start();
    r.commute(&mut tx1, |v| v + 1).unwrap();

    // tx2 does a read-modify-write and commits in between
    let mut tx2 = stm.start();
    let current = r.get(&mut tx2).unwrap();
    r.set(&mut tx2, current + 1).unwrap();
    tx2.commit().unwrap();

    tx1.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 2);
    assert_eq!(tx1.attempt(), 1);
    assert_released(&r);
}

#[test]
fn test_function_runs_only_at_commit() {
    let stm = Stm::new();
    let r = stm.new_ref(10i64);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tx = stm.start();
    let counted = Arc::clone(&calls);
    r.commute(&mut tx, move |v| {
        counted.fetch_add(1, Ordering::SeqCst);
        v * 2
    })
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tx.commit().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(r.atomic_get().unwrap(), 20);
}

#[test]
fn test_aborted_commute_never_runs() {
    let stm = Stm::new();
    let r = stm.new_ref(10i64);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tx = stm.start();
    let counted = Arc::clone(&calls);
    r.commute(&mut tx, move |v| {
        counted.fetch_add(1, Ordering::SeqCst);
        v + 1
    })
    .unwrap();
    tx.abort().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(r.atomic_get().unwrap(), 10);
}

#[test]
fn test_commute_after_read_applies_immediately() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    assert_eq!(r.get(&mut tx).unwrap(), 1);
    r.commute(&mut tx, |v| v + 4).unwrap();
    assert_eq!(r.get(&mut tx).unwrap(), 5);
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 5);
}

#[test]
fn test_read_after_commute_makes_it_a_read() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    r.commute(&mut tx, |v| v + 1).unwrap();
    assert_eq!(r.get(&mut tx).unwrap(), 2);

    // Now the value was read, so a concurrent write is a conflict
    r.atomic_set(100).unwrap();
    assert!(tx.commit().unwrap_err().is_conflict());
    assert_eq!(r.atomic_get().unwrap(), 100);
}

#[test]
fn test_commuting_counter_under_contention() {
    let stm = Stm::new();
    let counter = stm.new_ref(0i64);
    const THREADS: usize = 8;
    const PER_THREAD: usize = 250;

    {
        let (stm, counter) = (stm.clone(), counter.clone());
        run_concurrently(THREADS, move |_| {
            for _ in 0..PER_THREAD {
                stm.atomically(|tx| counter.increment(tx, 1)).unwrap();
            }
        });
    }

    assert_eq!(counter.atomic_get().unwrap(), (THREADS * PER_THREAD) as i64);
    assert_released(&counter);
}

#[test]
fn test_commute_on_readonly_is_refused() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let config = TxnConfig::default().with_readonly(true);
    let mut tx = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    assert!(matches!(
        r.commute(&mut tx, |v| v + 1).unwrap_err(),
        StmError::Readonly { operation: "commute", .. }
    ));
}

#[test]
fn test_identity_commute_does_not_bump_version() {
    let stm = Stm::new();
    let r = stm.new_ref(3i64);
    let mut tx = stm.start();
    r.commute(&mut tx, |v| v).unwrap();
    tx.commit().unwrap();
    assert_eq!(r.version(), 1);
    assert_released(&r);
}
