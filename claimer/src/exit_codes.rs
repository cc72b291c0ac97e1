//! Stable exit codes for claimer runs and CLI commands.

/// Run finished with no offer left `failed`.
pub const OK: i32 = 0;
/// An offer ended `failed`, the run aborted, or a command failed.
pub const FAILURE: i32 = 1;
/// The run was cancelled by SIGINT / Ctrl-C.
pub const INTERRUPTED: i32 = 130;
