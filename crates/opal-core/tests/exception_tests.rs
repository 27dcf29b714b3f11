//! Exception handling suite
//!
//! Throw/catch within one frame, unwinding through call frames, nested
//! handlers, and the uncaught path.

mod common;

use common::{program, run, run_err, vm_with_output};
use opal_bytecode::{Instruction, Opcode, Program};
use opal_core::{Value, VmError};

#[test]
fn test_throw_reaches_catch() {
    let mut p = Program::new("try");
    let boom = p.intern("boom");
    p.instructions = vec![
        /* 0 */ Instruction::op1(Opcode::TryStart, 4),
        /* 1 */ Instruction::push_str(boom),
        /* 2 */ Instruction::op(Opcode::Throw),
        /* 3 */ Instruction::op(Opcode::Halt),
        /* 4 */ Instruction::op(Opcode::Catch),
        /* 5 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 6 */ Instruction::op(Opcode::TryEnd),
        /* 7 */ Instruction::op(Opcode::Halt),
    ];
    let vm = run(p);
    assert_eq!(vm.global(0), Some(&Value::str("boom")));
    assert_eq!(vm.call_depth(), 0);
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.current_exception(), None);
}

#[test]
fn test_try_end_pops_handler_on_normal_path() {
    let vm = common::run_instructions(vec![
        Instruction::op1(Opcode::TryStart, 3),
        Instruction::op(Opcode::Nop),
        Instruction::op(Opcode::TryEnd),
        Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_unwind_restores_stack_depth() {
    let mut p = Program::new("unwind-sp");
    let oops = p.intern("oops");
    p.instructions = vec![
        /* 0 */ Instruction::push_int(1),
        /* 1 */ Instruction::push_int(2),
        /* 2 */ Instruction::op1(Opcode::TryStart, 7),
        /* 3 */ Instruction::push_int(3),
        /* 4 */ Instruction::push_str(oops),
        /* 5 */ Instruction::op(Opcode::Throw),
        /* 6 */ Instruction::op(Opcode::Halt),
        /* 7 */ Instruction::op(Opcode::Catch),
        /* 8 */ Instruction::op(Opcode::Halt),
    ];
    let vm = run(p);
    // The two values below the handler survive; the catch pushed the message.
    assert_eq!(vm.stack_depth(), 3);
    assert_eq!(vm.stack().peek().unwrap(), &Value::str("oops"));
    assert_eq!(vm.stack().peek_at(0).unwrap(), &Value::Int(1));
    assert_eq!(vm.stack().peek_at(1).unwrap(), &Value::Int(2));
}

#[test]
fn test_nested_handlers_unwind_outward() {
    let mut p = Program::new("nested");
    let inner = p.intern("inner");
    let outer = p.intern("outer");
    p.instructions = vec![
        /* 0 */ Instruction::op1(Opcode::TryStart, 10),
        /* 1 */ Instruction::op1(Opcode::TryStart, 5),
        /* 2 */ Instruction::push_str(inner),
        /* 3 */ Instruction::op(Opcode::Throw),
        /* 4 */ Instruction::op(Opcode::Halt),
        /* 5 */ Instruction::op(Opcode::Catch),
        /* 6 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 7 */ Instruction::push_str(outer),
        /* 8 */ Instruction::op(Opcode::Throw),
        /* 9 */ Instruction::op(Opcode::Halt),
        /* 10 */ Instruction::op(Opcode::Catch),
        /* 11 */ Instruction::op1(Opcode::StoreGlobal, 1),
        /* 12 */ Instruction::op(Opcode::Halt),
    ];
    let vm = run(p);
    assert_eq!(vm.global(0), Some(&Value::str("inner")));
    assert_eq!(vm.global(1), Some(&Value::str("outer")));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_throw_unwinds_through_call_frames() {
    let mut p = Program::new("unwind-call");
    let err = p.intern("err");
    p.instructions = vec![
        /* 0 */ Instruction::op1(Opcode::TryStart, 4),
        /* 1 */ Instruction::op2(Opcode::Call, 0, 6),
        /* 2 */ Instruction::op(Opcode::Nop),
        /* 3 */ Instruction::op(Opcode::Halt),
        /* 4 */ Instruction::op(Opcode::Catch),
        /* 5 */ Instruction::op(Opcode::Halt),
        /* 6 */ Instruction::push_str(err),
        /* 7 */ Instruction::op(Opcode::Throw),
    ];
    let vm = run(p);
    assert_eq!(vm.stack().peek().unwrap(), &Value::str("err"));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_catch_without_exception_pushes_nil() {
    let vm = common::run_instructions(vec![
        Instruction::op(Opcode::Catch),
        Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.stack().peek().unwrap(), &Value::Nil);
}

#[test]
fn test_try_end_is_noop_without_handler_on_top() {
    let vm = common::run_instructions(vec![
        Instruction::op(Opcode::TryEnd),
        Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_throw_requires_string() {
    let (_, err) = run_err(program(vec![
        Instruction::push_int(1),
        Instruction::op(Opcode::Throw),
    ]));
    assert!(matches!(err, VmError::TypeError(_)));
}

#[test]
fn test_uncaught_throw_surfaces_and_leaves_empty_stack() {
    let mut p = Program::new("uncaught");
    let boom = p.intern("boom");
    p.instructions = vec![
        Instruction::push_str(boom),
        Instruction::op(Opcode::Throw),
    ];
    let (mut vm, out) = vm_with_output(p);
    match vm.execute() {
        Err(VmError::RuntimeException(message)) => assert_eq!(message, "boom"),
        other => panic!("expected RuntimeException, got {other:?}"),
    }
    vm.print_stack().unwrap();
    assert_eq!(out.contents(), "stack: empty\n");
}

#[test]
fn test_division_by_zero_bypasses_handlers() {
    // Engine-level errors are not caught by TRY/CATCH.
    let (_, err) = run_err(program(vec![
        Instruction::op1(Opcode::TryStart, 6),
        Instruction::push_int(1),
        Instruction::push_int(0),
        Instruction::op(Opcode::Div),
        Instruction::op(Opcode::TryEnd),
        Instruction::op(Opcode::Halt),
        Instruction::op(Opcode::Catch),
        Instruction::op(Opcode::Halt),
    ]));
    assert!(matches!(err, VmError::DivisionByZero));
}
