//! Opal VM Core Runtime
//!
//! This crate provides the virtual machine runtime including:
//! - Bytecode interpreter (operand stack, frames, instruction dispatch)
//! - Generational mark-and-sweep garbage collector
//! - Value model and heap object kinds
//! - Weak reference registry

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod frames;
pub mod gc;
pub mod object;
pub mod stack;
pub mod value;
pub mod vm;
pub mod weak;

pub use frames::{CallFrame, LoopFrame, LoopKind, SwitchFrame};
pub use gc::{GarbageCollector, GcStats, Generation, Handle, Heap};
pub use object::{hash_key, Array, Closure, Function, HeapObject, MapObject, Record};
pub use stack::OperandStack;
pub use value::Value;
pub use vm::{Vm, VmOptions};
pub use weak::{WeakId, WeakRegistry};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Operand, call, loop, or switch stack overflow
    #[error("Stack overflow")]
    StackOverflow,

    /// Stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// Malformed or unexecutable instruction
    #[error("Invalid instruction at {0}")]
    InvalidInstruction(usize),

    /// Jump target outside the program
    #[error("Invalid jump target {0}")]
    InvalidJump(i64),

    /// Operand type mismatch
    #[error("Type error: {0}")]
    TypeError(String),

    /// Value cannot be converted to the required representation
    #[error("Invalid cast: {0}")]
    InvalidCast(String),

    /// Frame-relative or global slot read past the live region
    #[error("Undefined variable (slot {0})")]
    UndefinedVariable(usize),

    /// Division or modulo by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Array or string index outside the valid range
    #[error("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// The offending index
        index: i64,
        /// Length of the indexed value
        len: usize,
    },

    /// Record field absent
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// `BREAK` with no active loop frame
    #[error("Break outside loop")]
    BreakOutsideLoop,

    /// `CONTINUE` with no active loop frame
    #[error("Continue outside loop")]
    ContinueOutsideLoop,

    /// Operation not valid in the current engine state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// User `THROW` that reached the top without a handler
    #[error("Uncaught exception: {0}")]
    RuntimeException(String),

    /// Failure on the standard input/output channels
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
