//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! session records and return deterministic outputs suitable for tests.

pub mod handle;
pub mod invariants;
pub mod selector;
pub mod state_update;
pub mod types;
