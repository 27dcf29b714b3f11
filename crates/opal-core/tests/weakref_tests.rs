//! Weak reference suite
//!
//! Observers survive their targets, identifiers stay stable for the VM
//! lifetime, and collection nulls every observer of a finalized object.

mod common;

use common::{program, run_instructions};
use opal_bytecode::{Instruction, Opcode};
use opal_core::{Value, Vm};

#[test]
fn test_weak_ref_resolves_while_target_lives() {
    let vm = run_instructions(vec![
        /* 0 */ Instruction::op(Opcode::ArrayNew),
        /* 1 */ Instruction::op(Opcode::Dup),
        /* 2 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 3 */ Instruction::op(Opcode::WeakRefNew),
        /* 4 */ Instruction::op(Opcode::WeakRefGet),
        /* 5 */ Instruction::op(Opcode::Halt),
    ]);
    let target = vm.stack().peek().unwrap();
    assert!(matches!(target, Value::Array(_)));
    assert_eq!(target, vm.global(0).unwrap());
}

#[test]
fn test_weak_ref_nulled_after_target_collected() {
    let vm = run_instructions(vec![
        /* 0 */ Instruction::op(Opcode::ArrayNew),
        /* 1 */ Instruction::op(Opcode::Dup),
        /* 2 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 3 */ Instruction::op(Opcode::WeakRefNew),
        /* 4 */ Instruction::op1(Opcode::StoreGlobal, 1),
        /* 5 */ Instruction::op(Opcode::GcCollect),
        // Still rooted: the observer resolves.
        /* 6 */ Instruction::op1(Opcode::LoadGlobal, 1),
        /* 7 */ Instruction::op(Opcode::WeakRefGet),
        /* 8 */ Instruction::op1(Opcode::StoreGlobal, 2),
        // Drop every strong reference and collect again.
        /* 9 */ Instruction::push_nil(),
        /* 10 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 11 */ Instruction::push_nil(),
        /* 12 */ Instruction::op1(Opcode::StoreGlobal, 2),
        /* 13 */ Instruction::op(Opcode::GcCollect),
        /* 14 */ Instruction::op1(Opcode::LoadGlobal, 1),
        /* 15 */ Instruction::op(Opcode::WeakRefGet),
        /* 16 */ Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.stack().peek().unwrap(), &Value::Nil);
    assert_eq!(vm.heap().live_objects(), 0);
    // The registry entry itself is never reclaimed during execution.
    assert_eq!(vm.weak_ref_count(), 1);
}

#[test]
fn test_weak_ref_on_primitive_is_dead() {
    for inst in [
        Instruction::push_int(5),
        Instruction::push_bool(true),
        Instruction::push_nil(),
    ] {
        let vm = run_instructions(vec![
            inst,
            Instruction::op(Opcode::WeakRefNew),
            Instruction::op(Opcode::WeakRefGet),
            Instruction::op(Opcode::Halt),
        ]);
        assert_eq!(vm.stack().peek().unwrap(), &Value::Nil);
    }
}

#[test]
fn test_identifiers_are_distinct_and_stable() {
    let vm = run_instructions(vec![
        Instruction::op(Opcode::ArrayNew),
        Instruction::op(Opcode::WeakRefNew),
        Instruction::op(Opcode::ArrayNew),
        Instruction::op(Opcode::WeakRefNew),
        Instruction::op(Opcode::Halt),
    ]);
    let second = vm.stack().peek_at(1).unwrap();
    let first = vm.stack().peek_at(0).unwrap();
    assert!(matches!(first, Value::Int(_)));
    assert!(matches!(second, Value::Int(_)));
    assert_ne!(first, second);
    assert_eq!(vm.weak_ref_count(), 2);
}

#[test]
fn test_unknown_identifier_yields_nil() {
    let vm = run_instructions(vec![
        Instruction::push_int(9999),
        Instruction::op(Opcode::WeakRefGet),
        Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.stack().peek().unwrap(), &Value::Nil);
}

#[test]
fn test_multiple_observers_of_one_target() {
    let vm = run_instructions(vec![
        /* 0 */ Instruction::op(Opcode::ArrayNew),
        /* 1 */ Instruction::op(Opcode::Dup),
        /* 2 */ Instruction::op(Opcode::Dup),
        /* 3 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 4 */ Instruction::op(Opcode::WeakRefNew),
        /* 5 */ Instruction::op1(Opcode::StoreGlobal, 1),
        /* 6 */ Instruction::op(Opcode::WeakRefNew),
        /* 7 */ Instruction::op1(Opcode::StoreGlobal, 2),
        /* 8 */ Instruction::push_nil(),
        /* 9 */ Instruction::op1(Opcode::StoreGlobal, 0),
        /* 10 */ Instruction::op(Opcode::GcCollect),
        /* 11 */ Instruction::op1(Opcode::LoadGlobal, 1),
        /* 12 */ Instruction::op(Opcode::WeakRefGet),
        /* 13 */ Instruction::op1(Opcode::LoadGlobal, 2),
        /* 14 */ Instruction::op(Opcode::WeakRefGet),
        /* 15 */ Instruction::op(Opcode::Halt),
    ]);
    assert_eq!(vm.stack().peek_at(0).unwrap(), &Value::Nil);
    assert_eq!(vm.stack().peek_at(1).unwrap(), &Value::Nil);
}

#[test]
fn test_registry_survives_until_teardown() {
    let vm: Vm = run_instructions(vec![
        Instruction::op(Opcode::ArrayNew),
        Instruction::op(Opcode::WeakRefNew),
        Instruction::op(Opcode::GcCollect),
        Instruction::op(Opcode::GcCollect),
        Instruction::op(Opcode::Halt),
    ]);
    // Repeated collections never shrink the registry.
    assert_eq!(vm.weak_ref_count(), 1);
    drop(vm);
}

#[test]
fn test_weak_ref_program_builds() {
    // The identifier is an ordinary int value; arithmetic on it is legal.
    let p = program(vec![
        Instruction::op(Opcode::ArrayNew),
        Instruction::op(Opcode::WeakRefNew),
        Instruction::push_int(0),
        Instruction::op(Opcode::Add),
        Instruction::op(Opcode::WeakRefGet),
        Instruction::op(Opcode::Halt),
    ]);
    let vm = common::run(p);
    assert!(matches!(vm.stack().peek().unwrap(), Value::Array(_)));
}
