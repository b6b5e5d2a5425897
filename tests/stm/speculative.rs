//! Speculative Configuration Tests
//!
//! Executors start lean and small, and grow a family's transaction shape
//! only when a run proves it is needed.

use crate::common::*;
use strata_stm::StorageKind;

fn grow_config(family: &str) -> TxnConfig {
    TxnConfig::default()
        .with_family_name(family)
        .with_max_array_capacity(4)
}

fn read_all(tx: &mut Transaction, refs: &[TRef<i64>]) -> StmResult<i64> {
    let mut total = 0;
    for r in refs {
        total += r.get(tx)?;
    }
    Ok(total)
}

#[test]
fn test_family_grows_mono_array_map() {
    let stm = Stm::new();
    let refs = refs(&stm, 6, 1);
    let mut kinds = Vec::new();

    let one = stm
        .atomically_with(grow_config("grow"), |tx| {
            kinds.push(tx.kind());
            read_all(tx, &refs[..1])
        })
        .unwrap();
    assert_eq!(one, 1);
    assert_eq!(kinds, vec![TransactionKind::lean_mono()]);

    kinds.clear();
    let three = stm
        .atomically_with(grow_config("grow"), |tx| {
            kinds.push(tx.kind());
            read_all(tx, &refs[..3])
        })
        .unwrap();
    assert_eq!(three, 3);
    assert_eq!(
        kinds,
        vec![TransactionKind::lean_mono(), TransactionKind::lean_array(4)]
    );

    kinds.clear();
    let six = stm
        .atomically_with(grow_config("grow"), |tx| {
            kinds.push(tx.kind());
            read_all(tx, &refs)
        })
        .unwrap();
    assert_eq!(six, 6);
    assert_eq!(
        kinds,
        vec![TransactionKind::lean_array(4), TransactionKind::lean_map()]
    );

    let learned = stm.speculation("grow").unwrap();
    assert_eq!(learned.min_capacity(), 5);
    assert!(!learned.is_fat());
    for r in &refs {
        assert_released(r);
    }
}

#[test]
fn test_learned_shape_is_reused() {
    let stm = Stm::new();
    let refs = refs(&stm, 3, 1);
    stm.atomically_with(grow_config("steady"), |tx| read_all(tx, &refs))
        .unwrap();

    let mut attempts = 0;
    stm.atomically_with(grow_config("steady"), |tx| {
        attempts += 1;
        assert_eq!(tx.kind().storage, StorageKind::Array { capacity: 4 });
        read_all(tx, &refs)
    })
    .unwrap();
    assert_eq!(attempts, 1);
}

#[test]
fn test_commute_escalates_to_fat() {
    let stm = Stm::new();
    let counter = stm.new_ref(0i64);
    let mut kinds = Vec::new();

    stm.atomically_with(grow_config("count"), |tx| {
        kinds.push(tx.kind());
        counter.increment(tx, 1)
    })
    .unwrap();

    assert_eq!(
        kinds,
        vec![TransactionKind::lean_mono(), TransactionKind::fat_mono()]
    );
    assert!(stm.speculation("count").unwrap().is_fat());
    assert_eq!(counter.atomic_get().unwrap(), 1);
}

#[test]
fn test_families_learn_independently() {
    let stm = Stm::new();
    let refs = refs(&stm, 2, 0);
    stm.atomically_with(grow_config("wide"), |tx| read_all(tx, &refs))
        .unwrap();
    stm.atomically_with(grow_config("narrow"), |tx| read_all(tx, &refs[..1]))
        .unwrap();

    assert_eq!(stm.speculation("wide").unwrap().min_capacity(), 2);
    assert_eq!(stm.speculation("narrow").unwrap().min_capacity(), 1);
    assert!(stm.speculation("unused").is_none());
}

#[test]
fn test_disabled_speculation_starts_fat_map() {
    let stm = Stm::new();
    let counter = stm.new_ref(0i64);
    let config = TxnConfig::default()
        .with_family_name("plain")
        .with_speculative_config(false);
    let mut kinds = Vec::new();

    stm.atomically_with(config, |tx| {
        kinds.push(tx.kind());
        counter.increment(tx, 1)
    })
    .unwrap();
    assert_eq!(kinds, vec![TransactionKind::fat_map()]);
}

#[test]
fn test_atomic_operations_use_their_own_family() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);
    r.atomic_set(1).unwrap();
    assert!(stm.speculation(strata_stm::ATOMIC_FAMILY).is_some());
    assert!(stm.speculation("default").is_none());
}
