//! Stable exit codes for engager CLI commands.

/// Command succeeded, or `select` found an actionable item.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/session or a failed run.
pub const INVALID: i32 = 1;
/// `engager select` found nothing left to do for the session.
pub const COMPLETE: i32 = 2;
