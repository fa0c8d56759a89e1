//! Bank sizes, lookahead and preload budgets.

/// Number of guest registers per bank (32 GPRs, 32 FPRs).
pub const PREG_COUNT: usize = 32;

/// Number of host x86_64 registers available to a bank (general-purpose
/// registers for the GPR bank, XMM registers for the FPR bank).
pub const XREG_COUNT: usize = 16;

/// Cap on how many upcoming instructions the spill heuristic scans when
/// computing "distance to next use". Prevents quadratic compile time on
/// long blocks.
pub const LOOKAHEAD_CAP: usize = 64;

/// How many free host registers `Preload` must leave behind after
/// opportunistically binding its requested set.
pub const PRELOAD_MIN_FREE: usize = 2;

/// Ceiling on the combined live-in/live-out register footprint of an
/// in-block-branch region a single bank may preload across a fork.
pub const MAX_PRELOADABLE_REGISTERS: usize = 6;

static_assertions::const_assert!(XREG_COUNT <= PREG_COUNT);
static_assertions::const_assert!(MAX_PRELOADABLE_REGISTERS <= XREG_COUNT);
