//! Isolation Tests
//!
//! No transaction observes another transaction's uncommitted writes.

use crate::common::*;
use std::sync::mpsc;
use std::thread;

#[test]
fn test_uncommitted_write_is_invisible() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);

    let mut writer = stm.start();
    r.set(&mut writer, 99).unwrap();

    // Another transaction and the atomic path both see the committed value
    let mut reader = stm.start();
    assert_eq!(r.get(&mut reader).unwrap(), 1);
    reader.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);

    writer.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 99);
}

#[test]
fn test_uncommitted_write_invisible_across_threads() {
    let stm = Stm::new();
    let r = stm.new_ref(String::from("committed"));
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let writer = {
        let (stm, r) = (stm.clone(), r.clone());
        thread::spawn(move || {
            let mut tx = stm.start();
            r.set(&mut tx, "dirty".to_string()).unwrap();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            tx.abort().unwrap();
        })
    };

    ready_rx.recv().unwrap();
    let seen = stm.atomically(|tx| r.get(tx)).unwrap();
    assert_eq!(seen, "committed");
    go_tx.send(()).unwrap();
    writer.join().unwrap();

    assert_eq!(r.atomic_get().unwrap(), "committed");
    assert_released(&r);
}

#[test]
fn test_prepared_write_blocks_readers_until_commit() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);

    let mut writer = stm.start();
    r.set(&mut writer, 2).unwrap();
    writer.prepare().unwrap();

    // Commit locked: a reader with a tiny spin budget reports a conflict
    let config = TxnConfig::default().with_spin_count(1);
    let mut reader = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    assert!(r.get(&mut reader).unwrap_err().is_conflict());

    writer.commit().unwrap();
    let mut reader = stm.start();
    assert_eq!(r.get(&mut reader).unwrap(), 2);
}

#[test]
fn test_repeated_reads_are_stable() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    assert_eq!(r.get(&mut tx).unwrap(), 1);

    r.atomic_set(2).unwrap();
    // Attached: the transaction keeps seeing its own snapshot
    assert_eq!(r.get(&mut tx).unwrap(), 1);
    tx.commit().unwrap();
}

#[test]
fn test_own_writes_are_visible() {
    let stm = Stm::new();
    let r = stm.new_ref(vec![1, 2]);
    let mut tx = stm.start();
    r.alter(&mut tx, |mut v| {
        v.push(3);
        v
    })
    .unwrap();
    assert_eq!(r.get(&mut tx).unwrap(), vec![1, 2, 3]);
    tx.abort().unwrap();
    assert_eq!(r.atomic_get().unwrap(), vec![1, 2]);
}

#[test]
fn test_concurrent_serializable_readers_never_conflict() {
    let stm = Stm::new();
    let r = stm.new_ref(5i64);
    let config = TxnConfig::default()
        .with_family_name("serializable_reader")
        .with_isolation_level(IsolationLevel::Serializable)
        .with_readonly(true);

    let attempts = {
        let (stm, r) = (stm.clone(), r.clone());
        run_concurrently(4, move |_| {
            let mut max_attempt = 0;
            for _ in 0..500 {
                let (value, attempt) = stm
                    .atomically_with(config.clone(), |tx| Ok((r.get(tx)?, tx.attempt())))
                    .unwrap();
                assert_eq!(value, 5);
                max_attempt = max_attempt.max(attempt);
            }
            max_attempt
        })
    };

    // Nothing was written, so no reader was ever rerun
    assert!(attempts.iter().all(|&attempt| attempt == 1));
    assert_released(&r);
}
