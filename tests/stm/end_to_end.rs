//! End-to-End Tests
//!
//! Full lifecycle of a reference from creation to a committed update, with
//! the orec checked at every step.

use crate::common::*;
use strata_stm::{TranlocalStatus, INITIAL_VERSION};

#[test]
fn test_write_commit_read_lifecycle() {
    init_tracing();
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    let v0 = r.version();
    assert_eq!(v0, INITIAL_VERSION);
    assert_released(&r);

    let mut tx = stm.start();
    let tranlocal = tx.open_for_write(&r, LockMode::None).unwrap();
    assert_eq!(tranlocal.status(), TranlocalStatus::Update);
    tranlocal.set_value(5);
    // Reading back inside the transaction sees the private copy
    assert_eq!(r.get(&mut tx).unwrap(), 5);
    // Outside it nothing changed yet
    assert_eq!(r.atomic_get().unwrap(), 0);
    assert_eq!(r.version(), v0);

    tx.commit().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Committed);
    assert_eq!(r.version(), v0 + 1);
    assert_released(&r);

    let mut reader = stm.start();
    assert_eq!(r.get(&mut reader).unwrap(), 5);
    reader.commit().unwrap();
    assert_released(&r);
}

#[test]
fn test_executor_lifecycle() {
    let stm = Stm::new();
    let account = stm.new_ref(100i64);
    let log = stm.new_ref(Vec::<String>::new());

    let balance = stm
        .atomically(|tx| {
            let balance = account.alter_and_get(tx, |v| v - 30)?;
            log.alter(tx, |mut entries| {
                entries.push(format!("withdrew 30, left {}", balance));
                entries
            })?;
            Ok(balance)
        })
        .unwrap();

    assert_eq!(balance, 70);
    assert_eq!(account.atomic_get().unwrap(), 70);
    assert_eq!(log.atomic_get().unwrap(), vec!["withdrew 30, left 70".to_string()]);
    assert_released(&account);
    assert_released(&log);
}

#[test]
fn test_transaction_ends_exactly_once() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);

    let mut tx = stm.start();
    r.set(&mut tx, 2).unwrap();
    tx.commit().unwrap();
    // Repeated commit is a no-op, abort after commit is refused
    tx.commit().unwrap();
    assert!(matches!(
        tx.abort().unwrap_err(),
        StmError::DeadTransaction {
            status: TransactionStatus::Committed,
            ..
        }
    ));
    assert!(matches!(
        r.get(&mut tx).unwrap_err(),
        StmError::DeadTransaction { .. }
    ));

    let mut aborted = stm.start();
    r.set(&mut aborted, 3).unwrap();
    aborted.abort().unwrap();
    aborted.abort().unwrap();
    assert!(matches!(
        aborted.commit().unwrap_err(),
        StmError::DeadTransaction {
            status: TransactionStatus::Aborted,
            ..
        }
    ));
    assert_eq!(r.atomic_get().unwrap(), 2);
}

#[test]
fn test_two_phase_commit() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    r.set(&mut tx, 2).unwrap();

    tx.prepare().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Prepared);
    assert_eq!(r.lock_mode(), LockMode::Commit);
    assert!(matches!(
        r.set(&mut tx, 3).unwrap_err(),
        StmError::PreparedTransaction { .. }
    ));
    assert_eq!(tx.status(), TransactionStatus::Aborted);
    assert_eq!(r.atomic_get().unwrap(), 1);
    assert_released(&r);
}

#[test]
fn test_prepared_transaction_commits() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    r.set(&mut tx, 2).unwrap();
    tx.prepare().unwrap();
    tx.prepare().unwrap();
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 2);
    assert_released(&r);
}

#[test]
fn test_default_stm_and_free_atomically() {
    let r = strata_stm::default_stm().new_ref(String::from("a"));
    strata_stm::atomically(|tx| r.alter(tx, |s| s + "b")).unwrap();
    assert_eq!(r.atomic_get().unwrap(), "ab");
}
