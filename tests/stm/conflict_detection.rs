//! Conflict Detection Tests
//!
//! Overlapping writers of the same reference never lose an update.

use crate::common::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[test]
fn test_concurrent_increments_are_never_lost() {
    init_tracing();
    let stm = Stm::new();
    let counter = stm.new_ref(0i64);
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let attempts = Arc::new(AtomicU64::new(0));
    {
        let stm = stm.clone();
        let counter = counter.clone();
        let attempts = Arc::clone(&attempts);
        run_concurrently(THREADS, move |_| {
            for _ in 0..PER_THREAD {
                stm.atomically(|tx| {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    let value = counter.get(tx)?;
                    counter.set(tx, value + 1)
                })
                .unwrap();
            }
        });
    }

    assert_eq!(counter.atomic_get().unwrap(), (THREADS * PER_THREAD) as i64);
    assert_eq!(counter.version(), 1 + (THREADS * PER_THREAD) as u64);
    assert!(attempts.load(Ordering::Relaxed) >= (THREADS * PER_THREAD) as u64);
    assert_released(&counter);
}

#[test]
fn test_first_committer_wins() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);

    let mut t1 = stm.start();
    let mut t2 = stm.start();
    let v1 = r.get(&mut t1).unwrap();
    let v2 = r.get(&mut t2).unwrap();
    r.set(&mut t1, v1 + 1).unwrap();
    r.set(&mut t2, v2 + 1).unwrap();

    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(
        err,
        StmError::ReadWriteConflict {
            kind: strata_stm::ConflictKind::Write,
            ..
        }
    ));
    assert_eq!(r.atomic_get().unwrap(), 1);
    assert_released(&r);
}

#[test]
fn test_locked_reference_is_a_conflict_not_a_block() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let mut owner = stm.start();
    r.privatize(&mut owner).unwrap();

    let config = TxnConfig::default().with_spin_count(2);
    let mut other = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    let err = r.set(&mut other, 1).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(other.status(), TransactionStatus::Aborted);

    owner.commit().unwrap();
    assert_released(&r);
}

#[test]
fn test_update_lock_blocks_other_writers_only() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let mut owner = stm.start();
    r.ensure(&mut owner).unwrap();

    // Readers still get through
    let mut reader = stm.start();
    assert_eq!(r.get(&mut reader).unwrap(), 0);
    reader.commit().unwrap();

    // A writer cannot commit while the update lock is held
    let config = TxnConfig::default().with_spin_count(2);
    let mut writer = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    r.set(&mut writer, 1).unwrap();
    assert!(writer.commit().unwrap_err().is_conflict());

    owner.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 0);
    assert_released(&r);
}

#[test]
fn test_pessimistic_write_lock_mode() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let config = TxnConfig::default().with_write_lock_mode(LockMode::Commit);
    let mut tx = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    r.set(&mut tx, 1).unwrap();
    assert_eq!(r.lock_mode(), LockMode::Commit);
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
    assert_released(&r);
}

#[test]
fn test_executor_resolves_contention() {
    let stm = Stm::new();
    let accounts = refs(&stm, 4, 100);
    {
        let stm = stm.clone();
        let accounts = accounts.clone();
        run_concurrently(4, move |t| {
            for i in 0..200 {
                let from = &accounts[(t + i) % 4];
                let to = &accounts[(t + i + 1) % 4];
                stm.atomically(|tx| transfer(tx, from, to, 1)).unwrap();
            }
        });
    }
    assert_eq!(sum(&stm, &accounts), 400);
    for r in &accounts {
        assert_released(r);
    }
}
