//! Program container and binary format
//!
//! A [`Program`] is the immutable instruction vector the engine executes,
//! plus a display name. Programs can be serialized to a compact binary form
//! for the host driver: magic, version, flags, name, instruction records,
//! and an FNV-1a checksum trailer.

use crate::encoder::{DecodeError, ProgramReader, ProgramWriter};
use crate::instruction::{DebugInfo, Instruction};
use crate::opcode::Opcode;
use thiserror::Error;

/// Magic number for Opal program files: "OPAL"
pub const MAGIC: [u8; 4] = *b"OPAL";

/// Current program format version
pub const VERSION: u32 = 1;

/// Program flags
pub mod flags {
    /// Instruction records carry debug info fields
    pub const HAS_DEBUG_INFO: u32 = 1 << 0;
}

/// Program encoding/decoding errors
#[derive(Debug, Error)]
pub enum ProgramError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected OPAL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum recorded in the file
        expected: u32,
        /// Checksum computed over the decoded body
        actual: u32,
    },
}

/// A complete Opal program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Display name (diagnostics only)
    pub name: String,
    /// The instruction vector; immutable once execution starts
    pub instructions: Vec<Instruction>,
    /// String literal pool, indexed by `PUSH` with the string selector
    pub strings: Vec<String>,
}

impl Program {
    /// Create an empty program
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            strings: Vec::new(),
        }
    }

    /// Create a program from an instruction vector
    pub fn from_instructions(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
            strings: Vec::new(),
        }
    }

    /// Intern a string literal, returning its pool index
    ///
    /// Identical literals share one pool entry.
    pub fn intern(&mut self, s: impl AsRef<str>) -> i64 {
        let s = s.as_ref();
        if let Some(pos) = self.strings.iter().position(|entry| entry == s) {
            return pos as i64;
        }
        self.strings.push(s.to_owned());
        (self.strings.len() - 1) as i64
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if the program has no instructions
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Encode the program to its binary form
    pub fn encode(&self) -> Vec<u8> {
        let has_debug = self.instructions.iter().any(|i| i.debug.is_some());
        let flags = if has_debug { flags::HAS_DEBUG_INFO } else { 0 };

        let mut body = ProgramWriter::with_capacity(16 + self.instructions.len() * 25);
        body.emit_u32(VERSION);
        body.emit_u32(flags);
        body.emit_str(&self.name);
        body.emit_u32(self.strings.len() as u32);
        for s in &self.strings {
            body.emit_str(s);
        }
        body.emit_u32(self.instructions.len() as u32);
        for inst in &self.instructions {
            body.emit_u8(inst.opcode.to_u8());
            body.emit_i64(inst.operand);
            body.emit_i64(inst.operand2);
            body.emit_i64(inst.operand3);
            if has_debug {
                match inst.debug {
                    Some(info) => {
                        body.emit_u8(1);
                        body.emit_u32(info.line);
                    }
                    None => body.emit_u8(0),
                }
            }
        }

        let body = body.into_bytes();
        let mut out = ProgramWriter::with_capacity(body.len() + 8);
        out.emit_raw(&MAGIC);
        out.emit_raw(&body);
        out.emit_u32(fnv1a(&body));
        out.into_bytes()
    }

    /// Decode a program from its binary form
    pub fn decode(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut reader = ProgramReader::new(bytes);

        let magic = reader.read_raw(4)?;
        if magic != &MAGIC[..] {
            return Err(ProgramError::InvalidMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }

        // Body spans everything between the magic and the checksum trailer.
        if bytes.len() < 8 {
            return Err(DecodeError::UnexpectedEnd(bytes.len()).into());
        }
        let body = &bytes[4..bytes.len() - 4];
        let expected = {
            let mut tail = ProgramReader::new(&bytes[bytes.len() - 4..]);
            tail.read_u32()?
        };
        let actual = fnv1a(body);
        if expected != actual {
            return Err(ProgramError::ChecksumMismatch { expected, actual });
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ProgramError::UnsupportedVersion(version));
        }
        let file_flags = reader.read_u32()?;
        let has_debug = file_flags & flags::HAS_DEBUG_INFO != 0;
        let name = reader.read_str()?;
        let string_count = reader.read_u32()? as usize;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            strings.push(reader.read_str()?);
        }
        let count = reader.read_u32()? as usize;

        let mut instructions = Vec::with_capacity(count);
        for _ in 0..count {
            let at = reader.offset();
            let byte = reader.read_u8()?;
            let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, at))?;
            let operand = reader.read_i64()?;
            let operand2 = reader.read_i64()?;
            let operand3 = reader.read_i64()?;
            let debug = if has_debug && reader.read_u8()? != 0 {
                Some(DebugInfo {
                    line: reader.read_u32()?,
                })
            } else {
                None
            };
            instructions.push(Instruction {
                opcode,
                operand,
                operand2,
                operand3,
                debug,
            });
        }

        Ok(Self {
            name,
            instructions,
            strings,
        })
    }
}

/// FNV-1a hash, truncated to 32 bits
fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    (hash ^ (hash >> 32)) as u32
}
