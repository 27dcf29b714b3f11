//! Shared harness for the engine integration suites
//!
//! Builds programs from instruction vectors and runs them against captured
//! standard streams.

#![allow(dead_code)]

use opal_bytecode::{Instruction, Program};
use opal_core::{Vm, VmOptions, VmResult};
use std::cell::RefCell;
use std::io::{self, Cursor, Write};
use std::rc::Rc;

/// Shared buffer standing in for standard output
#[derive(Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wrap instructions into a program
pub fn program(instructions: Vec<Instruction>) -> Program {
    Program::from_instructions("test", instructions)
}

/// VM with captured output and empty input
pub fn vm_with_output(program: Program) -> (Vm, SharedOutput) {
    let out = SharedOutput::new();
    let vm = Vm::with_io(
        program,
        VmOptions::default(),
        Box::new(out.clone()),
        Box::new(io::empty()),
    );
    (vm, out)
}

/// VM with captured output and scripted input
pub fn vm_with_input(program: Program, input: &str) -> (Vm, SharedOutput) {
    let out = SharedOutput::new();
    let vm = Vm::with_io(
        program,
        VmOptions::default(),
        Box::new(out.clone()),
        Box::new(Cursor::new(input.as_bytes().to_vec())),
    );
    (vm, out)
}

/// Execute a program that must succeed; returns the finished VM
pub fn run(p: Program) -> Vm {
    let (mut vm, _) = vm_with_output(p);
    vm.execute().expect("program failed");
    vm
}

/// Execute a program that must succeed; returns the VM and captured stdout
pub fn run_capturing(p: Program) -> (Vm, String) {
    let (mut vm, out) = vm_with_output(p);
    vm.execute().expect("program failed");
    let text = out.contents();
    (vm, text)
}

/// Execute a program that must fail; returns the VM and the error
pub fn run_err(p: Program) -> (Vm, opal_core::VmError) {
    let (mut vm, _) = vm_with_output(p);
    let err = vm.execute().expect_err("program unexpectedly succeeded");
    (vm, err)
}

/// Convenience: run instructions with no string pool
pub fn run_instructions(instructions: Vec<Instruction>) -> Vm {
    run(program(instructions))
}

/// Result type re-export for suites that drive the VM directly
pub type TestResult = VmResult<()>;
