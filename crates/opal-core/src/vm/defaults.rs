//! Default constants for VM configuration.
//!
//! Centralizes the tunable sizes so the engine, collector, and options all
//! read from one place.

/// Default operand stack limit (in slots).
pub const STACK_SIZE: usize = 8192;

/// Default call stack limit (frames, including handler frames).
pub const CALL_STACK_SIZE: usize = 1024;

/// Default loop stack limit.
pub const LOOP_STACK_SIZE: usize = 256;

/// Default switch stack limit.
pub const SWITCH_STACK_SIZE: usize = 128;

/// Number of global variable slots.
pub const GLOBAL_VAR_COUNT: usize = 1024;

/// Young-generation object count that triggers an opportunistic minor collection.
pub const YOUNG_GC_THRESHOLD: usize = 100;

/// Minor collections an object must survive beyond before promotion.
pub const TENURE_THRESHOLD: u8 = 4;

/// Maximum bytes accepted from one `INPUT` record.
pub const INPUT_LINE_LIMIT: usize = 1024;
