//! Pool Safety Tests
//!
//! Tranlocals are recycled between attempts. A recycled object must never
//! leak into what other transactions read.

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn test_recycled_tranlocals_never_surface_as_committed_values() {
    init_tracing();
    let stm = Stm::new();
    // Both halves are always written together
    let pair = stm.new_ref((0u64, 0u64));
    let stop = Arc::new(AtomicBool::new(false));

    let writers = {
        let (stm, pair, stop) = (stm.clone(), pair.clone(), Arc::clone(&stop));
        std::thread::spawn(move || {
            let mut tx = stm.start();
            let mut n = 0u64;
            while !stop.load(Ordering::Relaxed) {
                n += 1;
                // Every other write is abandoned after dirtying the tranlocal
                let _ = pair.set(&mut tx, (n, n));
                if n % 2 == 0 {
                    let _ = tx.commit();
                } else {
                    let _ = tx.abort();
                }
                tx.hard_reset();
            }
            n
        })
    };

    let readers = {
        let (stm, pair) = (stm.clone(), pair.clone());
        run_concurrently(3, move |_| {
            let mut last = 0u64;
            for _ in 0..2_000 {
                let (a, b) = stm.atomically(|tx| pair.get(tx)).unwrap();
                assert_eq!(a, b, "torn value");
                // Aborted writes are odd and never published
                assert_eq!(a % 2, 0, "aborted write observed");
                assert!(a >= last, "value went backwards");
                last = a;
            }
        })
    };
    assert_eq!(readers.len(), 3);

    stop.store(true, Ordering::Relaxed);
    writers.join().unwrap();
    assert_released(&pair);
}

#[test]
fn test_reset_keeps_pool_and_clears_attachments() {
    let stm = Stm::new();
    let refs = refs(&stm, 3, 0);
    let mut tx = stm.start();
    for r in &refs {
        r.get(&mut tx).unwrap();
    }
    assert_eq!(tx.pooled_count(), 0);
    tx.abort().unwrap();
    assert_eq!(tx.pooled_count(), 3);
    assert_eq!(tx.attached_count(), 0);

    tx.hard_reset();
    assert_eq!(tx.status(), TransactionStatus::Active);
    for r in &refs {
        r.get(&mut tx).unwrap();
    }
    assert_eq!(tx.pooled_count(), 0);
    tx.commit().unwrap();
    for r in &refs {
        assert_released(r);
    }
}

#[test]
fn test_recycled_tranlocal_starts_clean() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    r.set(&mut tx, 99).unwrap();
    tx.abort().unwrap();

    tx.hard_reset();
    // The pooled tranlocal held 99; the next read must see the committed value
    let view = tx.open_for_read(&r, LockMode::None).unwrap();
    assert_eq!(*view.value(), 1);
    assert_eq!(view.version(), r.version());
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn test_executor_reuses_transaction_between_attempts() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let config = TxnConfig::default().with_family_name("reuse");
    let mut ids = Vec::new();

    stm.atomically_with(config, |tx| {
        ids.push(tx.id());
        let value = r.get(tx)?;
        if tx.attempt() < 3 {
            // Force a conflict on the first two attempts
            r.atomic_set(value + 1)?;
            r.set(tx, value + 10)?;
            return tx.commit();
        }
        r.set(tx, value + 10)
    })
    .unwrap();

    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(r.atomic_get().unwrap(), 12);
    assert_released(&r);
}
