//! Atomicity Tests
//!
//! A transaction's writes become visible together or not at all.

use crate::common::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_readers_never_see_partial_transfer() {
    init_tracing();
    let stm = Stm::new();
    let a = stm.new_ref(1_000i64);
    let b = stm.new_ref(0i64);
    let done = Arc::new(AtomicBool::new(false));
    let samples = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (stm, a, b) = (stm.clone(), a.clone(), b.clone());
            let done = Arc::clone(&done);
            let samples = Arc::clone(&samples);
            thread::spawn(move || {
                let config = TxnConfig::default()
                    .with_family_name("sampler")
                    .with_readonly(true);
                while !done.load(Ordering::Acquire) {
                    let (x, y) = stm
                        .atomically_with(config.clone(), |tx| Ok((a.get(tx)?, b.get(tx)?)))
                        .unwrap();
                    assert_eq!(x + y, 1_000, "observed a partial transfer: {} + {}", x, y);
                    samples.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    // Transfers only start once the readers are sampling
    let sampling = wait_until(Duration::from_secs(10), || {
        samples.load(Ordering::Relaxed) > 0
    });
    assert!(sampling, "readers never completed a sample");

    for i in 0..2_000 {
        let amount = (i % 7) + 1;
        stm.atomically(|tx| {
            if i % 2 == 0 {
                transfer(tx, &a, &b, amount)
            } else {
                transfer(tx, &b, &a, amount)
            }
        })
        .unwrap();
    }
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(sum(&stm, &[a.clone(), b.clone()]), 1_000);
    assert_released(&a);
    assert_released(&b);
}

#[test]
fn test_failed_body_publishes_nothing() {
    let stm = Stm::new();
    let a = stm.new_ref(1i64);
    let b = stm.new_ref(2i64);

    let err = stm
        .atomically(|tx| -> StmResult<()> {
            a.set(tx, 10)?;
            b.set(tx, 20)?;
            Err(StmError::IllegalState("rolled back".into()))
        })
        .unwrap_err();

    assert!(matches!(err, StmError::IllegalState(_)));
    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
    assert_eq!(a.version(), 1);
    assert_eq!(b.version(), 1);
    assert_released(&a);
    assert_released(&b);
}

#[test]
fn test_conflict_in_prepare_releases_every_lock() {
    let stm = Stm::new();
    let a = stm.new_ref(1i64);
    let b = stm.new_ref(1i64);
    let c = stm.new_ref(1i64);

    let mut tx = stm.start();
    a.set(&mut tx, 2).unwrap();
    b.set(&mut tx, 2).unwrap();
    c.set(&mut tx, 2).unwrap();
    // Someone else commits c first
    c.atomic_set(5).unwrap();

    assert!(tx.commit().unwrap_err().is_conflict());
    assert_eq!(tx.status(), TransactionStatus::Aborted);
    for r in [&a, &b, &c] {
        assert_released(r);
    }
    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 1);
    assert_eq!(c.atomic_get().unwrap(), 5);
}

#[test]
fn test_clean_write_leaves_version_alone() {
    let stm = Stm::new();
    let all = refs(&stm, 3, 0);
    stm.atomically(|tx| {
        all[0].set(tx, 0)?;
        all[1].set(tx, 1)?;
        all[2].alter(tx, |v| v)
    })
    .unwrap();

    assert_eq!(all[0].version(), 1);
    assert_eq!(all[1].version(), 2);
    assert_eq!(all[2].version(), 1);
}

#[test]
fn test_many_refs_commit_together() {
    let stm = Stm::new();
    let all = refs(&stm, 50, 0);
    stm.atomically(|tx| {
        for (i, r) in all.iter().enumerate() {
            r.set(tx, i as i64 + 1)?;
        }
        Ok(())
    })
    .unwrap();

    for (i, r) in all.iter().enumerate() {
        assert_eq!(r.atomic_get().unwrap(), i as i64 + 1);
        assert_eq!(r.version(), 2);
        assert_released(r);
    }
}
