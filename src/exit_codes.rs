//! Stable exit codes for operon CLI commands.

/// Command succeeded (symbol found, docs written, run finished).
pub const OK: i32 = 0;
/// Internal error: unexpected I/O, parse, or git failure.
pub const INTERNAL: i32 = 1;
/// `explain`/`usages` could not find the requested symbol or file.
pub const MISS: i32 = 2;
/// `rename`/`signature` failed to apply cleanly.
pub const APPLY_FAILED: i32 = 3;
/// User cancelled (Ctrl-C).
pub const CANCELLED: i32 = 130;
