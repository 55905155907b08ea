//! Resumable engagement orchestration engine.
//!
//! A session holds an ordered queue of work items, each moved through four
//! atomic steps (classify, primary engagement, generated response, generated
//! secondary message) by a single run-loop that can be started, paused,
//! resumed, and reset. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, scan policy, state
//!   transitions, invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, session store, generator,
//!   actuator, broadcaster). Isolated behind traits to enable scripting in
//!   tests.
//!
//! Orchestration modules ([`step`], [`looping`], [`controller`]) coordinate
//! core logic with I/O; [`start`] and [`select`] back the CLI commands.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
