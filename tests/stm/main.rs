//! STM Integration Tests
//!
//! End-to-end behaviour of transactions over shared references: atomicity,
//! isolation, conflict detection, blocking retry, commute and the executor.

#[path = "../common/mod.rs"]
mod common;

mod atomicity;
mod commute;
mod conflict_detection;
mod construction;
mod end_to_end;
mod isolation;
mod pool_safety;
mod speculative;
mod write_skew;
