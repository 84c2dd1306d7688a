//! Side-effecting storage and collaborator plumbing.
//!
//! Everything here touches the filesystem or external processes. Registries
//! combine these primitives with the pure logic in [`crate::core`].

pub mod config;
pub mod layout;
pub mod lock;
pub mod record;
pub mod workspace;
