//! Static program verification
//!
//! Checks every control-flow target and literal selector before execution so
//! the engine never has to re-validate a structurally broken program mid-run.
//! The engine still guards jumps at runtime; verification exists to reject
//! bad programs at load time with a precise location.

use crate::instruction::literal;
use crate::opcode::Opcode;
use crate::program::Program;
use thiserror::Error;

/// Program verification errors
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A jump, call, or handler target points outside the program
    #[error("Instruction {at}: target {target} out of range (program length {len})")]
    TargetOutOfRange {
        /// Index of the offending instruction
        at: usize,
        /// The out-of-range target
        target: i64,
        /// Program length
        len: usize,
    },

    /// A `PUSH` instruction carries an unknown literal selector
    #[error("Instruction {at}: invalid literal selector {selector}")]
    InvalidLiteralSelector {
        /// Index of the offending instruction
        at: usize,
        /// The unknown selector
        selector: i64,
    },

    /// A variable, global, or count operand is negative
    #[error("Instruction {at}: negative operand {value}")]
    NegativeOperand {
        /// Index of the offending instruction
        at: usize,
        /// The negative operand
        value: i64,
    },

    /// A `FUNCTION_DEF` varargs flag is neither 0 nor 1
    #[error("Instruction {at}: invalid varargs flag {value}")]
    InvalidVarargsFlag {
        /// Index of the offending instruction
        at: usize,
        /// The invalid flag value
        value: i64,
    },

    /// A string-literal `PUSH` indexes past the string pool
    #[error("Instruction {at}: string index {index} out of range (pool size {count})")]
    StringIndexOutOfRange {
        /// Index of the offending instruction
        at: usize,
        /// The out-of-range pool index
        index: i64,
        /// String pool size
        count: usize,
    },
}

/// Verify the structural validity of a program
pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    let len = program.instructions.len();

    let check_target = |at: usize, target: i64| -> Result<(), VerifyError> {
        if target < 0 || target as usize >= len {
            return Err(VerifyError::TargetOutOfRange { at, target, len });
        }
        Ok(())
    };
    let check_non_negative = |at: usize, value: i64| -> Result<(), VerifyError> {
        if value < 0 {
            return Err(VerifyError::NegativeOperand { at, value });
        }
        Ok(())
    };

    for (at, inst) in program.instructions.iter().enumerate() {
        match inst.opcode {
            Opcode::Push => match inst.operand2 {
                literal::INT | literal::FLOAT | literal::BOOL | literal::NIL => {}
                literal::STR => {
                    if inst.operand < 0 || inst.operand as usize >= program.strings.len() {
                        return Err(VerifyError::StringIndexOutOfRange {
                            at,
                            index: inst.operand,
                            count: program.strings.len(),
                        });
                    }
                }
                selector => {
                    return Err(VerifyError::InvalidLiteralSelector { at, selector });
                }
            },

            Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::WhileStart
            | Opcode::SwitchStart
            | Opcode::Case
            | Opcode::DefaultCase
            | Opcode::TryStart => check_target(at, inst.operand)?,

            Opcode::ForInit => {
                check_target(at, inst.operand)?;
                check_target(at, inst.operand2)?;
            }

            Opcode::Call => {
                check_non_negative(at, inst.operand)?;
                check_target(at, inst.operand2)?;
            }

            Opcode::FunctionDef => {
                check_non_negative(at, inst.operand)?;
                check_target(at, inst.operand2)?;
                if !matches!(inst.operand3, 0 | 1) {
                    return Err(VerifyError::InvalidVarargsFlag {
                        at,
                        value: inst.operand3,
                    });
                }
            }

            Opcode::LoadVar
            | Opcode::StoreVar
            | Opcode::LoadArg
            | Opcode::StoreArg
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal => check_non_negative(at, inst.operand)?,

            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    fn program(instructions: Vec<Instruction>) -> Program {
        Program::from_instructions("verify", instructions)
    }

    #[test]
    fn test_valid_program() {
        let p = program(vec![
            Instruction::push_int(1),
            Instruction::op1(Opcode::JumpIfFalse, 3),
            Instruction::op1(Opcode::Jump, 0),
            Instruction::op(Opcode::Halt),
        ]);
        assert!(verify_program(&p).is_ok());
    }

    #[test]
    fn test_jump_out_of_range() {
        let p = program(vec![Instruction::op1(Opcode::Jump, 10)]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::TargetOutOfRange { at: 0, target: 10, len: 1 })
        ));
    }

    #[test]
    fn test_negative_jump_target() {
        let p = program(vec![Instruction::op1(Opcode::Jump, -1)]);
        assert!(verify_program(&p).is_err());
    }

    #[test]
    fn test_for_init_checks_both_targets() {
        let p = program(vec![
            Instruction::op2(Opcode::ForInit, 1, 9),
            Instruction::op(Opcode::Halt),
        ]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::TargetOutOfRange { target: 9, .. })
        ));
    }

    #[test]
    fn test_bad_literal_selector() {
        let p = program(vec![Instruction::op2(Opcode::Push, 0, 7)]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::InvalidLiteralSelector { selector: 7, .. })
        ));
    }

    #[test]
    fn test_string_literal_index_checked() {
        let mut p = program(vec![Instruction::push_str(0), Instruction::op(Opcode::Halt)]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::StringIndexOutOfRange { index: 0, count: 0, .. })
        ));

        p.intern("ok");
        assert!(verify_program(&p).is_ok());
    }

    #[test]
    fn test_negative_var_index() {
        let p = program(vec![Instruction::op1(Opcode::LoadVar, -3)]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::NegativeOperand { value: -3, .. })
        ));
    }

    #[test]
    fn test_call_entry_checked() {
        let p = program(vec![Instruction::op2(Opcode::Call, 0, 5)]);
        assert!(verify_program(&p).is_err());
    }

    #[test]
    fn test_varargs_flag() {
        let p = program(vec![
            Instruction::op3(Opcode::FunctionDef, 2, 1, 3),
            Instruction::op(Opcode::Halt),
        ]);
        assert!(matches!(
            verify_program(&p),
            Err(VerifyError::InvalidVarargsFlag { value: 3, .. })
        ));
    }
}
