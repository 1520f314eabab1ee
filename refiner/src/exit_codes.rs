//! Stable exit codes for refiner CLI commands.

/// Command succeeded; for `run`, the best candidate passes every check.
pub const OK: i32 = 0;
/// Invalid input, config or an infrastructure failure.
pub const INVALID: i32 = 1;
/// `run` finished but the best candidate still fails checks.
pub const NOT_CONVERGED: i32 = 2;
/// `check` found a syntax error in the candidate.
pub const SYNTAX_ERROR: i32 = 3;
/// `run` stopped early because `refine.run_timeout_secs` elapsed.
///
/// The CLI installs no signal handler; Ctrl-C terminates the process with the
/// platform's default status instead.
pub const CANCELLED: i32 = 4;
