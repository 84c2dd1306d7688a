//! Filesystem-coordinated task orchestration for autonomous agents.
//!
//! Multiple independent agent processes collaborate on one repository with no
//! server and no database: all coordination state is JSON records on a shared
//! filesystem, serialized per record by advisory locks and made crash-safe by
//! atomic temp-write-then-rename. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machines, bundle
//!   aggregation, dependency checks). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (locks, atomic record storage,
//!   configuration, workspaces). Isolated to enable temp-root tests.
//!
//! Registry modules ([`tasks`], [`sessions`], [`evidence`]) combine core
//! logic with I/O; [`coordinator`] composes them into the public operations
//! (claim, transition, submit-report, promote).

pub mod coordinator;
pub mod core;
pub mod error;
pub mod evidence;
pub mod io;
pub mod logging;
pub mod retry;
pub mod sessions;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
