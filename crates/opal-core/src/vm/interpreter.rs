//! Virtual machine interpreter
//!
//! The engine processes one instruction at a time: fetch, advance the
//! instruction pointer, dispatch. Jumps overwrite the advanced pointer.
//! Collections run either opportunistically before an allocation (once the
//! young generation outgrows its threshold) or explicitly via `GC_COLLECT`;
//! in both cases the engine gathers its roots first.

use crate::frames::{CallFrame, LoopFrame, LoopKind, SwitchFrame};
use crate::gc::{GarbageCollector, GcStats, Handle, Heap};
use crate::object::{Array, Closure, Function, HeapObject, MapObject, Record};
use crate::stack::OperandStack;
use crate::value::Value;
use crate::vm::{defaults, VmOptions};
use crate::weak::{WeakId, WeakRegistry};
use crate::{VmError, VmResult};
use opal_bytecode::{literal, Opcode, Program};
use std::io::{self, BufRead, BufReader, Write};
use std::rc::Rc;

/// Opal virtual machine
pub struct Vm {
    /// The immutable instruction vector
    program: Program,
    /// Program string literals, interned once at construction
    string_literals: Vec<Rc<str>>,
    /// Operand stack
    stack: OperandStack,
    /// Global variable slots, initialized to nil
    globals: Vec<Value>,
    /// Call stack (function activations and exception handlers)
    call_stack: Vec<CallFrame>,
    /// Loop stack
    loop_stack: Vec<LoopFrame>,
    /// Switch stack
    switch_stack: Vec<SwitchFrame>,
    /// Garbage collector (owns the heap)
    gc: GarbageCollector,
    /// Weak reference registry; lives until VM teardown
    weak: WeakRegistry,
    /// Instruction pointer
    ip: usize,
    /// Base pointer of the active frame
    bp: usize,
    /// Exception installed by unwinding, consumed by `CATCH`
    current_exception: Option<Rc<str>>,
    /// Set by `HALT` or a top-level `RETURN`
    halted: bool,
    options: VmOptions,
    stdout: Box<dyn Write>,
    stdin: Box<dyn BufRead>,
}

impl Vm {
    /// Create a VM over a program with default options and standard streams
    pub fn new(program: Program) -> Self {
        Self::with_options(program, VmOptions::default())
    }

    /// Create a VM with explicit options
    pub fn with_options(program: Program, options: VmOptions) -> Self {
        Self::with_io(
            program,
            options,
            Box::new(io::stdout()),
            Box::new(BufReader::new(io::stdin())),
        )
    }

    /// Create a VM with redirected standard streams
    pub fn with_io(
        program: Program,
        options: VmOptions,
        stdout: Box<dyn Write>,
        stdin: Box<dyn BufRead>,
    ) -> Self {
        let string_literals = program.strings.iter().map(|s| Rc::from(s.as_str())).collect();
        Self {
            string_literals,
            program,
            stack: OperandStack::new(options.stack_size),
            globals: vec![Value::Nil; options.global_count],
            call_stack: Vec::new(),
            loop_stack: Vec::new(),
            switch_stack: Vec::new(),
            gc: GarbageCollector::new(options.young_gc_threshold),
            weak: WeakRegistry::new(),
            ip: 0,
            bp: 0,
            current_exception: None,
            halted: false,
            options,
            stdout,
            stdin,
        }
    }

    /// Run the program to completion
    pub fn execute(&mut self) -> VmResult<()> {
        while !self.halted {
            if self.ip >= self.program.instructions.len() {
                return Err(VmError::InvalidInstruction(self.ip));
            }
            let inst = &self.program.instructions[self.ip];
            let (opcode, a, b, c) = (inst.opcode, inst.operand, inst.operand2, inst.operand3);
            self.ip += 1;
            self.step(opcode, a, b, c)?;
        }
        Ok(())
    }

    fn step(&mut self, opcode: Opcode, a: i64, b: i64, c: i64) -> VmResult<()> {
        match opcode {
            // ===== Stack Manipulation & Literals =====
            Opcode::Nop => Ok(()),
            Opcode::Halt => {
                self.halted = true;
                Ok(())
            }
            Opcode::Push => self.op_push(a, b),
            Opcode::Pop => self.stack.pop().map(|_| ()),
            Opcode::Dup => self.op_dup(),
            Opcode::Swap => self.op_swap(),

            // ===== Arithmetic =====
            Opcode::Add => self.op_add(),
            Opcode::Sub => self.op_sub(),
            Opcode::Mul => self.op_mul(),
            Opcode::Div => self.op_div(),
            Opcode::Mod => self.op_mod(),
            Opcode::Neg => self.op_neg(),

            // ===== Comparison & Logical =====
            Opcode::Eq => self.op_eq(),
            Opcode::Ne => self.op_ne(),
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => self.op_ordered(opcode),
            Opcode::And => self.op_and(),
            Opcode::Or => self.op_or(),
            Opcode::Not => self.op_not(),

            // ===== Variables & Globals =====
            Opcode::LoadVar | Opcode::LoadArg => self.op_load_var(a),
            Opcode::StoreVar | Opcode::StoreArg => self.op_store_var(a),
            Opcode::LoadGlobal => self.op_load_global(a),
            Opcode::StoreGlobal => self.op_store_global(a),

            // ===== Jumps & Calls =====
            Opcode::Jump => self.op_jump(a),
            Opcode::JumpIfFalse => self.op_jump_if_false(a),
            Opcode::JumpIfTrue => self.op_jump_if_true(a),
            Opcode::Call => self.op_call(a, b),
            Opcode::Return => self.op_return(),

            // ===== Loops =====
            Opcode::ForInit => self.op_for_init(a, b),
            Opcode::ForCondition | Opcode::WhileCondition => self.op_loop_condition(),
            Opcode::ForIncrement => self.op_loop_restart(),
            Opcode::ForEnd => self.op_for_end(),
            Opcode::WhileStart => self.op_while_start(a),
            Opcode::WhileEnd => self.op_loop_restart(),
            Opcode::Break => self.op_break(),
            Opcode::Continue => self.op_continue(),

            // ===== Switch =====
            Opcode::SwitchStart => self.op_switch_start(a),
            Opcode::Case => self.op_case(a),
            Opcode::DefaultCase => self.op_default_case(a),
            Opcode::SwitchEnd => self.op_switch_end(),

            // ===== Exceptions =====
            Opcode::TryStart => self.op_try_start(a),
            Opcode::Catch => self.op_catch(),
            Opcode::Throw => self.op_throw(),
            Opcode::TryEnd => self.op_try_end(),

            // ===== Arrays =====
            Opcode::ArrayNew => self.op_array_new(),
            Opcode::ArrayGet => self.op_array_get(),
            Opcode::ArraySet => self.op_array_set(),
            Opcode::ArrayLen => self.op_array_len(),
            Opcode::ArrayPush => self.op_array_push(),
            Opcode::ArrayPop => self.op_array_pop(),

            // ===== Maps & Records =====
            Opcode::HashmapNew => self.op_hashmap_new(),
            Opcode::HashmapGet => self.op_hashmap_get(),
            Opcode::HashmapSet => self.op_hashmap_set(),
            Opcode::HashmapHas => self.op_hashmap_has(),
            Opcode::HashmapDelete => self.op_hashmap_delete(),
            Opcode::StructNew => self.op_struct_new(),
            Opcode::StructGet => self.op_struct_get(),
            Opcode::StructSet => self.op_struct_set(),

            // ===== Functions & Closures =====
            Opcode::FunctionDef => self.op_function_def(a, b, c),
            Opcode::ClosureNew => self.op_closure_new(),
            Opcode::ClosureCapture => self.op_closure_capture(),

            // ===== Strings =====
            Opcode::StringConcat => self.op_string_concat(),
            Opcode::StringSubstr => self.op_string_substr(),
            Opcode::StringLen => self.op_string_len(),
            Opcode::StringCompare => self.op_string_compare(),

            // ===== I/O =====
            Opcode::Print => self.op_print(),
            Opcode::Input => self.op_input(),

            // ===== Collector & Weak References =====
            Opcode::GcCollect => self.op_gc_collect(),
            Opcode::WeakRefNew => self.op_weak_ref_new(),
            Opcode::WeakRefGet => self.op_weak_ref_get(),
        }
    }

    // ========================================================================
    // Operand helpers
    // ========================================================================

    /// Validate a jump/call target against the program length
    fn jump_target(&self, target: i64) -> VmResult<usize> {
        if target < 0 || target as usize >= self.program.instructions.len() {
            return Err(VmError::InvalidJump(target));
        }
        Ok(target as usize)
    }

    /// Convert a slot/count operand to usize
    fn slot_index(&self, operand: i64) -> VmResult<usize> {
        usize::try_from(operand)
            .map_err(|_| VmError::InvalidOperation(format!("negative operand {operand}")))
    }

    fn truthy(&self, value: &Value) -> bool {
        value.is_truthy(self.gc.heap())
    }

    fn pop_pair(&mut self) -> VmResult<(Value, Value)> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        Ok((a, b))
    }

    fn pop_int(&mut self, what: &str) -> VmResult<i64> {
        match self.stack.pop()? {
            Value::Int(i) => Ok(i),
            v => Err(VmError::TypeError(format!(
                "{what} expects an int, got {}",
                v.type_name()
            ))),
        }
    }

    fn pop_str(&mut self, what: &str) -> VmResult<Rc<str>> {
        match self.stack.pop()? {
            Value::Str(s) => Ok(s),
            v => Err(VmError::TypeError(format!(
                "{what} expects a string, got {}",
                v.type_name()
            ))),
        }
    }

    fn expect_array(&self, value: &Value, what: &str) -> VmResult<Handle> {
        match value {
            Value::Array(h) => Ok(*h),
            v => Err(VmError::TypeError(format!(
                "{what} expects an array, got {}",
                v.type_name()
            ))),
        }
    }

    fn expect_map(&self, value: &Value, what: &str) -> VmResult<Handle> {
        match value {
            Value::Map(h) => Ok(*h),
            v => Err(VmError::TypeError(format!(
                "{what} expects a map, got {}",
                v.type_name()
            ))),
        }
    }

    fn expect_record(&self, value: &Value, what: &str) -> VmResult<Handle> {
        match value {
            Value::Record(h) => Ok(*h),
            v => Err(VmError::TypeError(format!(
                "{what} expects a record, got {}",
                v.type_name()
            ))),
        }
    }

    fn released(what: &str) -> VmError {
        VmError::InvalidOperation(format!("{what} on a released heap object"))
    }

    fn binary_type_error(op: &str, a: &Value, b: &Value) -> VmError {
        VmError::TypeError(format!(
            "{op} cannot combine {} and {}",
            a.type_name(),
            b.type_name()
        ))
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Gather every root the collector must trace: the live operand stack
    /// prefix, non-nil globals, and each frame's argument region.
    fn collect_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        roots.extend(self.stack.values().iter().filter(|v| v.is_heap_ref()).cloned());
        roots.extend(self.globals.iter().filter(|v| v.is_heap_ref()).cloned());
        for frame in &self.call_stack {
            let top = (frame.base_ptr + frame.arg_count).min(self.stack.depth());
            for pos in frame.base_ptr..top {
                if let Ok(v) = self.stack.peek_at(pos) {
                    if v.is_heap_ref() {
                        roots.push(v.clone());
                    }
                }
            }
        }
        roots
    }

    /// Opportunistic minor collection, run before an allocation while every
    /// operand of the current instruction is still on the stack.
    fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            let roots = self.collect_roots();
            self.gc.collect_minor(&roots, &mut self.weak);
        }
    }

    /// GC_COLLECT - Run a full collection
    fn op_gc_collect(&mut self) -> VmResult<()> {
        let roots = self.collect_roots();
        self.gc.collect_full(&roots, &mut self.weak);
        Ok(())
    }

    // ========================================================================
    // Stack manipulation & literals
    // ========================================================================

    /// PUSH - Push a literal; `selector` picks the variant
    fn op_push(&mut self, payload: i64, selector: i64) -> VmResult<()> {
        let value = match selector {
            literal::INT => Value::Int(payload),
            literal::FLOAT => Value::Float(payload as f64),
            literal::BOOL => Value::Bool(payload != 0),
            literal::NIL => Value::Nil,
            literal::STR => {
                let index = self.slot_index(payload)?;
                let s = self
                    .string_literals
                    .get(index)
                    .ok_or_else(|| VmError::InvalidInstruction(self.ip.saturating_sub(1)))?;
                Value::Str(Rc::clone(s))
            }
            _ => return Err(VmError::InvalidInstruction(self.ip.saturating_sub(1))),
        };
        self.stack.push(value)
    }

    /// DUP - Duplicate top stack value
    fn op_dup(&mut self) -> VmResult<()> {
        let value = self.stack.peek()?.clone();
        self.stack.push(value)
    }

    /// SWAP - Swap top two stack values
    fn op_swap(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        self.stack.push(b)?;
        self.stack.push(a)
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    /// ADD - Numeric addition with int-to-float promotion
    fn op_add(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(*y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x + y),
            (Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 + y),
            (Value::Float(x), Value::Int(y)) => Value::Float(x + *y as f64),
            _ => return Err(Self::binary_type_error("ADD", &a, &b)),
        };
        self.stack.push(result)
    }

    /// SUB - Numeric subtraction
    fn op_sub(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_sub(*y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x - y),
            (Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 - y),
            (Value::Float(x), Value::Int(y)) => Value::Float(x - *y as f64),
            _ => return Err(Self::binary_type_error("SUB", &a, &b)),
        };
        self.stack.push(result)
    }

    /// MUL - Numeric multiplication
    fn op_mul(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_mul(*y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x * y),
            (Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 * y),
            (Value::Float(x), Value::Int(y)) => Value::Float(x * *y as f64),
            _ => return Err(Self::binary_type_error("MUL", &a, &b)),
        };
        self.stack.push(result)
    }

    /// DIV - Numeric division; integer division truncates toward zero
    fn op_div(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => {
                if *y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Int(x.wrapping_div(*y))
            }
            (Value::Float(x), Value::Float(y)) => {
                if *y == 0.0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Float(x / y)
            }
            (Value::Int(x), Value::Float(y)) => {
                if *y == 0.0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Float(*x as f64 / y)
            }
            (Value::Float(x), Value::Int(y)) => {
                if *y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Value::Float(x / *y as f64)
            }
            _ => return Err(Self::binary_type_error("DIV", &a, &b)),
        };
        self.stack.push(result)
    }

    /// MOD - Integer modulo; non-negative result for positive divisors
    fn op_mod(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => {
                if *y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                let result = x.checked_rem_euclid(*y).unwrap_or(0);
                self.stack.push(Value::Int(result))
            }
            _ => Err(Self::binary_type_error("MOD", &a, &b)),
        }
    }

    /// NEG - Numeric negation, preserving the variant
    fn op_neg(&mut self) -> VmResult<()> {
        let result = match self.stack.pop()? {
            Value::Int(i) => Value::Int(i.wrapping_neg()),
            Value::Float(f) => Value::Float(-f),
            v => {
                return Err(VmError::TypeError(format!(
                    "NEG expects a number, got {}",
                    v.type_name()
                )))
            }
        };
        self.stack.push(result)
    }

    // ========================================================================
    // Comparison & logical
    // ========================================================================

    /// EQ - Structural equality
    fn op_eq(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        self.stack.push(Value::Bool(a == b))
    }

    /// NE - Structural inequality
    fn op_ne(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        self.stack.push(Value::Bool(a != b))
    }

    /// LT/LE/GT/GE - Ordered comparison
    ///
    /// Numerics compare with int-to-float promotion, bools as false < true,
    /// strings by byte length. Any other pairing yields false.
    fn op_ordered(&mut self, opcode: Opcode) -> VmResult<()> {
        use std::cmp::Ordering;

        let (a, b) = self.pop_pair()?;
        let ordering = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
            (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
            (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => Some(x.len().cmp(&y.len())),
            _ => None,
        };
        let result = match ordering {
            Some(ord) => match opcode {
                Opcode::Lt => ord == Ordering::Less,
                Opcode::Le => ord != Ordering::Greater,
                Opcode::Gt => ord == Ordering::Greater,
                Opcode::Ge => ord != Ordering::Less,
                _ => false,
            },
            None => false,
        };
        self.stack.push(Value::Bool(result))
    }

    /// AND - Truthiness conjunction (both operands already evaluated)
    fn op_and(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = self.truthy(&a) && self.truthy(&b);
        self.stack.push(Value::Bool(result))
    }

    /// OR - Truthiness disjunction
    fn op_or(&mut self) -> VmResult<()> {
        let (a, b) = self.pop_pair()?;
        let result = self.truthy(&a) || self.truthy(&b);
        self.stack.push(Value::Bool(result))
    }

    /// NOT - Truthiness negation
    fn op_not(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let result = !self.truthy(&v);
        self.stack.push(Value::Bool(result))
    }

    // ========================================================================
    // Variables & globals
    // ========================================================================

    /// LOAD_VAR - Push the frame-relative slot `bp + k`
    fn op_load_var(&mut self, operand: i64) -> VmResult<()> {
        let k = self.slot_index(operand)?;
        let pos = self.bp + k;
        if pos >= self.stack.depth() {
            return Err(VmError::UndefinedVariable(k));
        }
        let value = self.stack.peek_at(pos)?.clone();
        self.stack.push(value)
    }

    /// STORE_VAR - Pop into the frame-relative slot `bp + k`
    fn op_store_var(&mut self, operand: i64) -> VmResult<()> {
        let k = self.slot_index(operand)?;
        let value = self.stack.pop()?;
        self.stack.store_extending(self.bp + k, value)
    }

    /// LOAD_GLOBAL - Push a global slot
    fn op_load_global(&mut self, operand: i64) -> VmResult<()> {
        let k = self.slot_index(operand)?;
        if k >= self.globals.len() {
            return Err(VmError::UndefinedVariable(k));
        }
        let value = self.globals[k].clone();
        self.stack.push(value)
    }

    /// STORE_GLOBAL - Pop into a global slot
    fn op_store_global(&mut self, operand: i64) -> VmResult<()> {
        let k = self.slot_index(operand)?;
        if k >= self.globals.len() {
            return Err(VmError::UndefinedVariable(k));
        }
        self.globals[k] = self.stack.pop()?;
        Ok(())
    }

    // ========================================================================
    // Jumps & calls
    // ========================================================================

    /// JUMP - Unconditional jump
    fn op_jump(&mut self, target: i64) -> VmResult<()> {
        self.ip = self.jump_target(target)?;
        Ok(())
    }

    /// JUMP_IF_FALSE - Pop and branch on falsiness
    fn op_jump_if_false(&mut self, target: i64) -> VmResult<()> {
        let target = self.jump_target(target)?;
        let v = self.stack.pop()?;
        if !self.truthy(&v) {
            self.ip = target;
        }
        Ok(())
    }

    /// JUMP_IF_TRUE - Pop and branch on truthiness
    fn op_jump_if_true(&mut self, target: i64) -> VmResult<()> {
        let target = self.jump_target(target)?;
        let v = self.stack.pop()?;
        if self.truthy(&v) {
            self.ip = target;
        }
        Ok(())
    }

    /// CALL - Push a call frame and enter the callee
    fn op_call(&mut self, argc: i64, entry: i64) -> VmResult<()> {
        let n = self.slot_index(argc)?;
        let entry = self.jump_target(entry)?;
        if self.call_stack.len() >= self.options.call_stack_size {
            return Err(VmError::StackOverflow);
        }
        let sp = self.stack.depth();
        if sp < n {
            return Err(VmError::StackUnderflow);
        }
        let base = sp - n;
        self.call_stack.push(CallFrame::call(self.ip, base, self.bp, n));
        self.bp = base;
        self.ip = entry;
        Ok(())
    }

    /// RETURN - Discard the frame region and resume the caller
    ///
    /// With no frame on the call stack this is a clean halt.
    fn op_return(&mut self) -> VmResult<()> {
        match self.call_stack.pop() {
            None => self.halted = true,
            Some(frame) => {
                self.stack.truncate(frame.base_ptr);
                self.bp = frame.saved_bp;
                self.ip = frame.return_ip;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Loops
    // ========================================================================

    /// FOR_INIT - Push a for-loop frame
    fn op_for_init(&mut self, cond: i64, end: i64) -> VmResult<()> {
        if self.loop_stack.len() >= self.options.loop_stack_size {
            return Err(VmError::StackOverflow);
        }
        let start = self.jump_target(cond)?;
        let end = self.jump_target(end)?;
        self.loop_stack.push(LoopFrame {
            start,
            end,
            kind: LoopKind::For,
        });
        Ok(())
    }

    /// FOR_CONDITION / WHILE_CONDITION - Pop the condition; on false, leave
    /// the loop and pop its frame
    fn op_loop_condition(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let frame = *self
            .loop_stack
            .last()
            .ok_or_else(|| VmError::InvalidOperation("loop condition outside a loop".into()))?;
        if !self.truthy(&v) {
            self.ip = frame.end;
            self.loop_stack.pop();
        }
        Ok(())
    }

    /// FOR_INCREMENT / WHILE_END - Jump back to the loop start
    fn op_loop_restart(&mut self) -> VmResult<()> {
        let frame = self
            .loop_stack
            .last()
            .ok_or_else(|| VmError::InvalidOperation("loop back-edge outside a loop".into()))?;
        self.ip = frame.start;
        Ok(())
    }

    /// FOR_END - Pop the loop frame
    fn op_for_end(&mut self) -> VmResult<()> {
        self.loop_stack
            .pop()
            .map(|_| ())
            .ok_or_else(|| VmError::InvalidOperation("FOR_END outside a loop".into()))
    }

    /// WHILE_START - Push a while-loop frame starting at the next instruction
    fn op_while_start(&mut self, end: i64) -> VmResult<()> {
        if self.loop_stack.len() >= self.options.loop_stack_size {
            return Err(VmError::StackOverflow);
        }
        let end = self.jump_target(end)?;
        self.loop_stack.push(LoopFrame {
            start: self.ip,
            end,
            kind: LoopKind::While,
        });
        Ok(())
    }

    /// BREAK - Jump to the loop end and pop its frame
    fn op_break(&mut self) -> VmResult<()> {
        let frame = self.loop_stack.pop().ok_or(VmError::BreakOutsideLoop)?;
        self.ip = frame.end;
        Ok(())
    }

    /// CONTINUE - Jump to the loop start, keeping its frame
    fn op_continue(&mut self) -> VmResult<()> {
        let frame = self.loop_stack.last().ok_or(VmError::ContinueOutsideLoop)?;
        self.ip = frame.start;
        Ok(())
    }

    // ========================================================================
    // Switch
    // ========================================================================

    /// SWITCH_START - Push a switch frame; the discriminant stays on the stack
    fn op_switch_start(&mut self, end: i64) -> VmResult<()> {
        if self.switch_stack.len() >= self.options.switch_stack_size {
            return Err(VmError::StackOverflow);
        }
        let end = self.jump_target(end)?;
        self.switch_stack.push(SwitchFrame::new(end));
        Ok(())
    }

    /// CASE - Pop the case value, compare against the peeked discriminant
    fn op_case(&mut self, target: i64) -> VmResult<()> {
        let target = self.jump_target(target)?;
        if self.switch_stack.is_empty() {
            return Err(VmError::InvalidOperation("CASE outside a switch".into()));
        }
        let case_value = self.stack.pop()?;
        let matched = *self.stack.peek()? == case_value;
        if matched {
            // The discriminant stays; SWITCH_END pops it.
            self.ip = target;
        }
        Ok(())
    }

    /// DEFAULT_CASE - Record the default target in the top switch frame
    fn op_default_case(&mut self, target: i64) -> VmResult<()> {
        let target = self.jump_target(target)?;
        let frame = self
            .switch_stack
            .last_mut()
            .ok_or_else(|| VmError::InvalidOperation("DEFAULT_CASE outside a switch".into()))?;
        frame.default = Some(target);
        Ok(())
    }

    /// SWITCH_END - Pop the discriminant and the switch frame
    fn op_switch_end(&mut self) -> VmResult<()> {
        self.switch_stack
            .pop()
            .ok_or_else(|| VmError::InvalidOperation("SWITCH_END outside a switch".into()))?;
        self.stack.pop()?;
        Ok(())
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    /// TRY_START - Push a handler frame remembering the current sp/bp
    fn op_try_start(&mut self, catch: i64) -> VmResult<()> {
        if self.call_stack.len() >= self.options.call_stack_size {
            return Err(VmError::StackOverflow);
        }
        let catch = self.jump_target(catch)?;
        self.call_stack
            .push(CallFrame::handler(catch, self.stack.depth(), self.bp, self.ip));
        Ok(())
    }

    /// THROW - Pop a message and unwind to the nearest handler
    fn op_throw(&mut self) -> VmResult<()> {
        let message = self.pop_str("THROW")?;
        while let Some(frame) = self.call_stack.pop() {
            if frame.is_handler {
                self.ip = frame.catch_ip;
                self.stack.truncate(frame.saved_sp);
                self.bp = frame.saved_bp;
                self.current_exception = Some(message);
                return Ok(());
            }
        }
        Err(VmError::RuntimeException(message.to_string()))
    }

    /// CATCH - Push the installed exception message (or nil) and clear it
    fn op_catch(&mut self) -> VmResult<()> {
        let value = match self.current_exception.take() {
            Some(message) => Value::Str(message),
            None => Value::Nil,
        };
        self.stack.push(value)
    }

    /// TRY_END - Pop the top frame iff it is a handler
    fn op_try_end(&mut self) -> VmResult<()> {
        if matches!(self.call_stack.last(), Some(f) if f.is_handler) {
            self.call_stack.pop();
        }
        Ok(())
    }

    // ========================================================================
    // Arrays
    // ========================================================================

    /// ARRAY_NEW - Allocate an empty array
    fn op_array_new(&mut self) -> VmResult<()> {
        self.maybe_collect();
        let handle = self.gc.allocate(HeapObject::Array(Array::new()));
        self.stack.push(Value::Array(handle))
    }

    /// ARRAY_GET - Bounds-checked element read
    fn op_array_get(&mut self) -> VmResult<()> {
        let index = self.pop_int("ARRAY_GET index")?;
        let v = self.stack.pop()?;
        let handle = self.expect_array(&v, "ARRAY_GET")?;
        let arr = self
            .gc
            .heap()
            .array(handle)
            .ok_or_else(|| Self::released("ARRAY_GET"))?;
        if index < 0 || index as usize >= arr.len() {
            return Err(VmError::IndexOutOfBounds {
                index,
                len: arr.len(),
            });
        }
        let element = arr.get(index as usize).cloned().unwrap_or(Value::Nil);
        self.stack.push(element)
    }

    /// ARRAY_SET - Element write; grows the array with nil padding
    fn op_array_set(&mut self) -> VmResult<()> {
        let value = self.stack.pop()?;
        let index = self.pop_int("ARRAY_SET index")?;
        let v = self.stack.pop()?;
        let handle = self.expect_array(&v, "ARRAY_SET")?;
        let arr = self
            .gc
            .heap_mut()
            .array_mut(handle)
            .ok_or_else(|| Self::released("ARRAY_SET"))?;
        if index < 0 {
            return Err(VmError::IndexOutOfBounds {
                index,
                len: arr.len(),
            });
        }
        arr.set(index as usize, value);
        Ok(())
    }

    /// ARRAY_LEN - Push the array length
    fn op_array_len(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let handle = self.expect_array(&v, "ARRAY_LEN")?;
        let len = self
            .gc
            .heap()
            .array(handle)
            .ok_or_else(|| Self::released("ARRAY_LEN"))?
            .len();
        self.stack.push(Value::Int(len as i64))
    }

    /// ARRAY_PUSH - Append an element
    fn op_array_push(&mut self) -> VmResult<()> {
        let value = self.stack.pop()?;
        let v = self.stack.pop()?;
        let handle = self.expect_array(&v, "ARRAY_PUSH")?;
        self.gc
            .heap_mut()
            .array_mut(handle)
            .ok_or_else(|| Self::released("ARRAY_PUSH"))?
            .push(value);
        Ok(())
    }

    /// ARRAY_POP - Remove and push the last element; fails when empty
    fn op_array_pop(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let handle = self.expect_array(&v, "ARRAY_POP")?;
        let element = self
            .gc
            .heap_mut()
            .array_mut(handle)
            .ok_or_else(|| Self::released("ARRAY_POP"))?
            .pop()
            .ok_or(VmError::IndexOutOfBounds { index: 0, len: 0 })?;
        self.stack.push(element)
    }

    // ========================================================================
    // Maps & records
    // ========================================================================

    /// HASHMAP_NEW - Allocate an empty map
    fn op_hashmap_new(&mut self) -> VmResult<()> {
        self.maybe_collect();
        let handle = self.gc.allocate(HeapObject::Map(MapObject::new()));
        self.stack.push(Value::Map(handle))
    }

    /// HASHMAP_GET - Pop key and map, push the value or nil
    fn op_hashmap_get(&mut self) -> VmResult<()> {
        let key = self.pop_str("HASHMAP_GET key")?;
        let v = self.stack.pop()?;
        let handle = self.expect_map(&v, "HASHMAP_GET")?;
        let value = self
            .gc
            .heap()
            .map(handle)
            .ok_or_else(|| Self::released("HASHMAP_GET"))?
            .get(&key)
            .cloned()
            .unwrap_or(Value::Nil);
        self.stack.push(value)
    }

    /// HASHMAP_SET - Pop value and key; the map stays on the stack
    fn op_hashmap_set(&mut self) -> VmResult<()> {
        let value = self.stack.pop()?;
        let key = self.pop_str("HASHMAP_SET key")?;
        let handle = {
            let top = self.stack.peek()?;
            self.expect_map(top, "HASHMAP_SET")?
        };
        self.gc
            .heap_mut()
            .map_mut(handle)
            .ok_or_else(|| Self::released("HASHMAP_SET"))?
            .set(&key, value);
        Ok(())
    }

    /// HASHMAP_HAS - Pop key, push a bool; the map stays on the stack
    fn op_hashmap_has(&mut self) -> VmResult<()> {
        let key = self.pop_str("HASHMAP_HAS key")?;
        let handle = {
            let top = self.stack.peek()?;
            self.expect_map(top, "HASHMAP_HAS")?
        };
        let has = self
            .gc
            .heap()
            .map(handle)
            .ok_or_else(|| Self::released("HASHMAP_HAS"))?
            .has(&key);
        self.stack.push(Value::Bool(has))
    }

    /// HASHMAP_DELETE - Pop key, push a bool; the map stays on the stack
    fn op_hashmap_delete(&mut self) -> VmResult<()> {
        let key = self.pop_str("HASHMAP_DELETE key")?;
        let handle = {
            let top = self.stack.peek()?;
            self.expect_map(top, "HASHMAP_DELETE")?
        };
        let removed = self
            .gc
            .heap_mut()
            .map_mut(handle)
            .ok_or_else(|| Self::released("HASHMAP_DELETE"))?
            .delete(&key);
        self.stack.push(Value::Bool(removed))
    }

    /// STRUCT_NEW - Allocate an empty record
    fn op_struct_new(&mut self) -> VmResult<()> {
        self.maybe_collect();
        let handle = self.gc.allocate(HeapObject::Record(Record::new()));
        self.stack.push(Value::Record(handle))
    }

    /// STRUCT_GET - Pop field name and record, push the field value
    ///
    /// Records are product types: an absent field is an error, not nil.
    fn op_struct_get(&mut self) -> VmResult<()> {
        let field = self.pop_str("STRUCT_GET field")?;
        let v = self.stack.pop()?;
        let handle = self.expect_record(&v, "STRUCT_GET")?;
        let value = self
            .gc
            .heap()
            .record(handle)
            .ok_or_else(|| Self::released("STRUCT_GET"))?
            .get(&field)
            .cloned()
            .ok_or_else(|| VmError::KeyNotFound(field.to_string()))?;
        self.stack.push(value)
    }

    /// STRUCT_SET - Pop value and field name; the record stays on the stack
    fn op_struct_set(&mut self) -> VmResult<()> {
        let value = self.stack.pop()?;
        let field = self.pop_str("STRUCT_SET field")?;
        let handle = {
            let top = self.stack.peek()?;
            self.expect_record(top, "STRUCT_SET")?
        };
        self.gc
            .heap_mut()
            .record_mut(handle)
            .ok_or_else(|| Self::released("STRUCT_SET"))?
            .set(&field, value);
        Ok(())
    }

    // ========================================================================
    // Functions & closures
    // ========================================================================

    /// FUNCTION_DEF - Allocate a function descriptor
    fn op_function_def(&mut self, arity: i64, entry: i64, varargs: i64) -> VmResult<()> {
        let arity = self.slot_index(arity)?;
        let entry = self.jump_target(entry)?;
        self.maybe_collect();
        let handle = self
            .gc
            .allocate(HeapObject::Function(Function::new(entry, arity, varargs != 0)));
        self.stack.push(Value::Function(handle))
    }

    /// CLOSURE_NEW - Pop a function, push a closure wrapping it
    fn op_closure_new(&mut self) -> VmResult<()> {
        // Collect before popping so the function operand stays rooted.
        self.maybe_collect();
        let v = self.stack.pop()?;
        let function = match v {
            Value::Function(h) => h,
            v => {
                return Err(VmError::TypeError(format!(
                    "CLOSURE_NEW expects a function, got {}",
                    v.type_name()
                )))
            }
        };
        let handle = self.gc.allocate(HeapObject::Closure(Closure::new(function)));
        self.stack.push(Value::Closure(handle))
    }

    /// CLOSURE_CAPTURE - Pop a value into the captures of the top closure
    fn op_closure_capture(&mut self) -> VmResult<()> {
        let value = self.stack.pop()?;
        let handle = match self.stack.peek()? {
            Value::Closure(h) => *h,
            v => {
                return Err(VmError::TypeError(format!(
                    "CLOSURE_CAPTURE expects a closure on top, got {}",
                    v.type_name()
                )))
            }
        };
        self.gc
            .heap_mut()
            .closure_mut(handle)
            .ok_or_else(|| Self::released("CLOSURE_CAPTURE"))?
            .capture(value);
        Ok(())
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// STRING_CONCAT - Join two strings into a new allocation
    fn op_string_concat(&mut self) -> VmResult<()> {
        let b = self.pop_str("STRING_CONCAT")?;
        let a = self.pop_str("STRING_CONCAT")?;
        self.stack.push(Value::str(format!("{a}{b}")))
    }

    /// STRING_SUBSTR - Byte slice; start is range-checked, length clipped
    fn op_string_substr(&mut self) -> VmResult<()> {
        let length = self.pop_int("STRING_SUBSTR length")?;
        let start = self.pop_int("STRING_SUBSTR start")?;
        let s = self.pop_str("STRING_SUBSTR")?;

        if start < 0 || start as usize > s.len() {
            return Err(VmError::IndexOutOfBounds {
                index: start,
                len: s.len(),
            });
        }
        if length < 0 {
            return Err(VmError::IndexOutOfBounds {
                index: length,
                len: s.len(),
            });
        }
        let start = start as usize;
        let end = start.saturating_add(length as usize).min(s.len());
        let slice = s.get(start..end).ok_or_else(|| {
            VmError::InvalidCast("substring does not fall on character boundaries".into())
        })?;
        self.stack.push(Value::str(slice))
    }

    /// STRING_LEN - Push the byte length
    fn op_string_len(&mut self) -> VmResult<()> {
        let s = self.pop_str("STRING_LEN")?;
        self.stack.push(Value::Int(s.len() as i64))
    }

    /// STRING_COMPARE - Push -1/0/+1 per lexical ordering
    fn op_string_compare(&mut self) -> VmResult<()> {
        use std::cmp::Ordering;

        let b = self.pop_str("STRING_COMPARE")?;
        let a = self.pop_str("STRING_COMPARE")?;
        let result = match a.as_ref().cmp(b.as_ref()) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
        self.stack.push(Value::Int(result))
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// PRINT - Pop, render, write a line to standard output
    fn op_print(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let text = self.render_value(&v);
        writeln!(self.stdout, "{text}")?;
        self.stdout.flush()?;
        Ok(())
    }

    /// INPUT - Read one newline-terminated record, at most 1024 bytes
    fn op_input(&mut self) -> VmResult<()> {
        let mut line = String::new();
        self.stdin.read_line(&mut line)?;
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let mut limit = defaults::INPUT_LINE_LIMIT.min(trimmed.len());
        while !trimmed.is_char_boundary(limit) {
            limit -= 1;
        }
        self.stack.push(Value::str(&trimmed[..limit]))
    }

    // ========================================================================
    // Weak references
    // ========================================================================

    /// WEAK_REF_NEW - Pop a value, push an identifier observing it
    ///
    /// A non-heap operand yields a dead weak reference.
    fn op_weak_ref_new(&mut self) -> VmResult<()> {
        let v = self.stack.pop()?;
        let target = v.handle().filter(|&h| self.gc.heap().contains(h));
        let id = self.weak.create(target);
        if let Some(handle) = target {
            if let Some(header) = self.gc.heap_mut().header_mut(handle) {
                header.observers.push(id);
            }
        }
        self.stack.push(Value::Int(id.to_i64()))
    }

    /// WEAK_REF_GET - Pop an identifier, push the live target or nil
    fn op_weak_ref_get(&mut self) -> VmResult<()> {
        let raw = self.pop_int("WEAK_REF_GET")?;
        let value = WeakId::from_i64(raw)
            .and_then(|id| self.weak.get(id))
            .and_then(|handle| self.value_for_handle(handle))
            .unwrap_or(Value::Nil);
        self.stack.push(value)
    }

    /// Rebuild the handle-variant value for a live heap object
    fn value_for_handle(&self, handle: Handle) -> Option<Value> {
        Some(match self.gc.heap().get(handle)? {
            HeapObject::Array(_) => Value::Array(handle),
            HeapObject::Map(_) => Value::Map(handle),
            HeapObject::Record(_) => Value::Record(handle),
            HeapObject::Function(_) => Value::Function(handle),
            HeapObject::Closure(_) => Value::Closure(handle),
        })
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Render a value the way `PRINT` does
    pub fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Array(h) => match self.gc.heap().array(*h) {
                Some(a) => format!("Array[{}]", a.len()),
                None => format!("Array@{}", h.index()),
            },
            Value::Map(h) => match self.gc.heap().map(*h) {
                Some(m) => format!("Map[{}]", m.len()),
                None => format!("Map@{}", h.index()),
            },
            Value::Record(h) => match self.gc.heap().record(*h) {
                Some(r) => format!("Record[{}]", r.len()),
                None => format!("Record@{}", h.index()),
            },
            Value::Function(h) => match self.gc.heap().function(*h) {
                Some(f) => format!("Function@{}", f.entry),
                None => format!("Function@{}", h.index()),
            },
            Value::Closure(h) => {
                let entry = self
                    .gc
                    .heap()
                    .closure(*h)
                    .and_then(|c| self.gc.heap().function(c.function))
                    .map(|f| f.entry);
                match entry {
                    Some(entry) => format!("Closure@{entry}"),
                    None => format!("Closure@{}", h.index()),
                }
            }
        }
    }

    /// Dump the operand stack, top first
    pub fn print_stack(&mut self) -> VmResult<()> {
        let depth = self.stack.depth();
        if depth == 0 {
            writeln!(self.stdout, "stack: empty")?;
            return Ok(());
        }
        writeln!(self.stdout, "stack ({depth} values, top first):")?;
        for pos in (0..depth).rev() {
            let rendered = match self.stack.peek_at(pos) {
                Ok(v) => self.render_value(v),
                Err(_) => continue,
            };
            writeln!(self.stdout, "  [{pos}] {rendered}")?;
        }
        Ok(())
    }

    /// Dump every non-nil global
    pub fn print_globals(&mut self) -> VmResult<()> {
        let lines: Vec<String> = self
            .globals
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| format!("  [{k}] {}", self.render_value(v)))
            .collect();
        if lines.is_empty() {
            writeln!(self.stdout, "globals: all nil")?;
            return Ok(());
        }
        writeln!(self.stdout, "globals ({} set):", lines.len())?;
        for line in lines {
            writeln!(self.stdout, "{line}")?;
        }
        Ok(())
    }

    /// Dump heap and collector statistics
    pub fn print_memory_stats(&mut self) -> VmResult<()> {
        let (young, old, bytes) = {
            let heap = self.gc.heap();
            (heap.young_count(), heap.old_count(), heap.live_bytes())
        };
        let stats = self.gc.stats().clone();
        writeln!(self.stdout, "heap: {young} young, {old} old, ~{bytes} bytes")?;
        writeln!(
            self.stdout,
            "collections: {} full, {} minor",
            stats.collections, stats.minor_collections
        )?;
        writeln!(
            self.stdout,
            "objects: {} freed, {} promoted",
            stats.objects_freed, stats.objects_promoted
        )?;
        writeln!(self.stdout, "weak refs: {}", self.weak.len())?;
        Ok(())
    }

    // ===== Read-only accessors =====

    /// Borrow the operand stack
    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    /// Current operand stack depth
    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    /// Current call stack depth
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Current loop stack depth
    pub fn loop_depth(&self) -> usize {
        self.loop_stack.len()
    }

    /// Current switch stack depth
    pub fn switch_depth(&self) -> usize {
        self.switch_stack.len()
    }

    /// Read a global slot
    pub fn global(&self, index: usize) -> Option<&Value> {
        self.globals.get(index)
    }

    /// Borrow the heap
    pub fn heap(&self) -> &Heap {
        self.gc.heap()
    }

    /// Collector statistics
    pub fn gc_stats(&self) -> &GcStats {
        self.gc.stats()
    }

    /// Number of weak references ever created
    pub fn weak_ref_count(&self) -> usize {
        self.weak.len()
    }

    /// The exception installed by unwinding, if any
    pub fn current_exception(&self) -> Option<&str> {
        self.current_exception.as_deref()
    }

    /// Whether the engine has halted
    pub fn is_halted(&self) -> bool {
        self.halted
    }
}
