//! Opal VM Bytecode Definitions
//!
//! This crate provides the instruction set, the program container, and the
//! binary program format for the Opal virtual machine.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod instruction;
pub mod opcode;
pub mod program;
pub mod verify;

pub use encoder::{DecodeError, ProgramReader, ProgramWriter};
pub use instruction::{literal, DebugInfo, Instruction};
pub use opcode::Opcode;
pub use program::{Program, ProgramError};
pub use verify::{verify_program, VerifyError};
