//! Stable exit codes for `prj` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid definition, arguments, configuration, or usage.
pub const INVALID: i32 = 1;
/// The run executed and failed.
pub const FAILED: i32 = 2;
