//! Construction Tests
//!
//! References created inside a transaction stay private until it commits.

use crate::common::*;
use strata_stm::Tranlocal;

#[test]
fn test_reopening_returns_same_attachment() {
    let stm = Stm::new();
    let mut tx = stm.start();
    let r = TRef::new_uncommitted(&mut tx, 1i64).unwrap();

    let first = tx.open_for_construction(&r).unwrap() as *const Tranlocal<i64> as usize;
    let second = tx.open_for_construction(&r).unwrap() as *const Tranlocal<i64> as usize;
    assert_eq!(first, second);
    assert_eq!(tx.attached_count(), 1);

    tx.open_for_construction(&r).unwrap().set_value(2);
    // Reads and writes go through the same attachment
    assert_eq!(r.get(&mut tx).unwrap(), 2);
    r.set(&mut tx, 3).unwrap();
    assert_eq!(tx.attached_count(), 1);
    tx.commit().unwrap();

    assert_eq!(r.atomic_get().unwrap(), 3);
    assert_eq!(r.version(), strata_stm::INITIAL_VERSION);
    assert_released(&r);
}

#[test]
fn test_constructed_reference_invisible_before_commit() {
    let stm = Stm::new();
    let mut tx = stm.start();
    let r = TRef::new_uncommitted(&mut tx, "draft".to_string()).unwrap();
    assert_eq!(r.version(), strata_stm::VERSION_UNCOMMITTED);

    let config = TxnConfig::default().with_spin_count(1);
    let mut other = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    assert!(r.get(&mut other).unwrap_err().is_conflict());
    assert!(r.atomic_get().unwrap_err().is_conflict());

    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), "draft");
}

#[test]
fn test_opening_committed_reference_for_construction_fails() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);
    let mut tx = stm.start();
    let err = tx.open_for_construction(&r).unwrap_err();
    assert!(matches!(err, StmError::IllegalArgument(_)));
    assert_eq!(tx.status(), TransactionStatus::Aborted);
}

#[test]
fn test_foreign_construction_is_refused() {
    let stm = Stm::new();
    let mut owner = stm.start();
    let r = TRef::new_uncommitted(&mut owner, 1i64).unwrap();

    let mut thief = stm.start();
    assert!(matches!(
        thief.open_for_construction(&r).unwrap_err(),
        StmError::IllegalArgument(_)
    ));
    owner.commit().unwrap();
}

#[test]
fn test_readonly_cannot_construct() {
    let stm = Stm::new();
    let config = TxnConfig::default().with_readonly(true);
    let mut tx = stm.start_with(config, TransactionKind::fat_map()).unwrap();
    let err = TRef::new_uncommitted(&mut tx, 0i64).unwrap_err();
    assert!(matches!(
        err,
        StmError::Readonly {
            operation: "open_for_construction",
            ..
        }
    ));
}

#[test]
fn test_construction_inside_executor() {
    let stm = Stm::new();
    let head = stm.new_ref(None::<TRef<i64>>);

    stm.atomically(|tx| {
        let node = TRef::new_uncommitted(tx, 42i64)?;
        head.set(tx, Some(node))
    })
    .unwrap();

    let node = head.atomic_get().unwrap().expect("node published");
    assert_eq!(node.atomic_get().unwrap(), 42);
}

#[test]
fn test_aborted_construction_is_never_readable() {
    let stm = Stm::new();
    let mut tx = stm.start();
    let r = TRef::new_uncommitted(&mut tx, 5i64).unwrap();
    drop(tx);

    assert!(matches!(r.atomic_get().unwrap_err(), StmError::IllegalState(_)));
    assert_released(&r);
}
