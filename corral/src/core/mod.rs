//! Deterministic, pure coordination logic.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests: state
//! machine tables, guard evaluation, bundle aggregation, and dependency
//! graph checks.

pub mod brief;
pub mod bundle;
pub mod fsm;
pub mod graph;
pub mod report;
pub mod session;
pub mod task;
