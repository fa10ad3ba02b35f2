// File: src/vm.rs
//
// Virtual machine for executing Moss bytecode.
// A value-stack VM with call frames, closures over open/closed upvalues,
// classes with copy-down inheritance, and GC-aware allocation: every value
// held outside a root is pinned on the stack before anything can allocate.

use std::io::{self, Write};

use ahash::AHashMap;
use chrono::Utc;

use crate::bytecode::{Chunk, OpCode};
use crate::compiler;
use crate::gc::Gc;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, Obj, ObjRef,
    UpvalueObj,
};
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of interpreting one source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Sentinel for a runtime error that has already been reported.
pub struct RuntimeTrap;

/// One in-progress call: the closure being run, its instruction pointer,
/// and where its slot window starts. Slot zero holds the callee (or the
/// receiver for methods); arguments follow.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

pub struct Vm {
    gc: Gc,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, sorted by decreasing stack slot.
    open_upvalues: Vec<ObjRef>,
    output: Box<dyn Write>,
    /// Disassemble each instruction to stderr as it executes.
    pub trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose program output goes to the given sink instead of
    /// stdout. Diagnostics still go to stderr.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            gc: Gc::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            output,
            trace: false,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Collect on every allocation. Test tooling.
    pub fn set_gc_stress(&mut self, on: bool) {
        self.gc.stress = on;
    }

    /// Sorted names of all defined globals (REPL introspection).
    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.gc.globals.keys().map(|&name| self.gc.as_str(name).to_string()).collect();
        names.sort();
        names
    }

    /// Compiles and runs one source string. Globals persist across calls,
    /// which is what keeps a REPL session alive.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = compiler::compile(source, &mut self.gc) else {
            return InterpretResult::CompileError;
        };

        // Pin the function while the closure wrapping it is allocated.
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ClosureObj { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure));
        if self.call_closure(closure, 0).is_err() {
            return InterpretResult::RuntimeError;
        }

        let result = match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(RuntimeTrap) => InterpretResult::RuntimeError,
        };
        self.output.flush().expect("output flush failed");
        result
    }

    /// Compiles without running and dumps every reachable chunk to stdout.
    pub fn dump_bytecode(&mut self, source: &str) -> InterpretResult {
        let Some(function) = compiler::compile(source, &mut self.gc) else {
            return InterpretResult::CompileError;
        };
        self.push(Value::Obj(function));
        let mut rendered = Vec::new();
        let mut pending = vec![function];
        while let Some(next) = pending.pop() {
            let func = self.gc.function(next);
            let name = match func.name {
                Some(name) => format!("<fn {}>", self.gc.as_str(name)),
                None => "<script>".to_string(),
            };
            rendered.push(func.chunk.disassemble(&name, &self.gc));
            for &constant in &func.chunk.constants {
                if let Value::Obj(obj) = constant {
                    if matches!(self.gc.get(obj), Obj::Function(_)) {
                        pending.push(obj);
                    }
                }
            }
        }
        self.pop();
        for text in rendered {
            print!("{}", text);
        }
        InterpretResult::Ok
    }

    // === Stack ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // === Allocation ===
    //
    // All runtime allocation funnels through here so a collection can fire
    // with the VM's roots marked first.

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        self.gc.alloc(obj)
    }

    fn intern(&mut self, chars: &str) -> ObjRef {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        self.gc.intern(chars)
    }

    fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.gc.mark_value(value);
        }
        for frame in &self.frames {
            self.gc.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.gc.mark_object(upvalue);
        }
        self.gc.collect();
    }

    // === Errors ===

    /// Reports a runtime error with a stack trace, innermost frame first,
    /// then resets the stack.
    fn runtime_error<T>(&mut self, message: &str) -> Result<T, RuntimeTrap> {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let closure = self.gc.closure(frame.closure);
            let function = self.gc.function(closure.function);
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.gc.as_str(name)),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.reset_stack();
        Err(RuntimeTrap)
    }

    // === Bytecode reading ===

    fn current_chunk(&self) -> &Chunk {
        let frame = self.frames.last().expect("no active frame");
        let closure = self.gc.closure(frame.closure);
        &self.gc.function(closure.function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frames.last().expect("no active frame").ip;
        let byte = self.current_chunk().code[ip];
        self.frames.last_mut().expect("no active frame").ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frames.last().expect("no active frame").ip;
        let value = self.current_chunk().read_u16(ip);
        self.frames.last_mut().expect("no active frame").ip = ip + 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    /// Reads a constant known to be an interned name.
    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(obj) => obj,
            _ => unreachable!("name constant is not an object"),
        }
    }

    // === Dispatch ===

    fn run(&mut self) -> Result<(), RuntimeTrap> {
        loop {
            if self.trace {
                let mut slots = String::from("          ");
                for &value in &self.stack {
                    slots.push_str(&format!("[ {} ]", value.display(&self.gc)));
                }
                eprintln!("{}", slots);
                let ip = self.frames.last().expect("no active frame").ip;
                let (text, _) = self.current_chunk().disassemble_instruction(ip, &self.gc);
                eprintln!("{}", text);
            }

            let op = OpCode::try_from(self.read_byte()).expect("corrupt bytecode");
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active frame").slots_base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active frame").slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let value = self.gc.globals.get(&name).copied();
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.gc.as_str(name));
                            return self.runtime_error(&message);
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    // Insert before popping so a collection during the
                    // insert still sees the value on the stack.
                    let value = self.peek(0);
                    self.gc.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.gc.globals.insert(name, value).is_none() {
                        // Undo the binding the insert just created.
                        self.gc.globals.remove(&name);
                        let message = format!("Undefined variable '{}'.", self.gc.as_str(name));
                        return self.runtime_error(&message);
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let frame = self.frames.last().expect("no active frame");
                    let upvalue_ref = self.gc.closure(frame.closure).upvalues[index];
                    let upvalue = self.gc.upvalue(upvalue_ref);
                    let value = match upvalue.location {
                        Some(slot) => self.stack[slot],
                        None => upvalue.closed,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let frame = self.frames.last().expect("no active frame");
                    let upvalue_ref = self.gc.closure(frame.closure).upvalues[index];
                    let location = self.gc.upvalue(upvalue_ref).location;
                    match location {
                        Some(slot) => self.stack[slot] = value,
                        None => self.gc.upvalue_mut(upvalue_ref).closed = value,
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance_ref = match receiver.as_obj() {
                        Some(obj) if matches!(self.gc.get(obj), Obj::Instance(_)) => obj,
                        _ => return self.runtime_error("Only instances have properties."),
                    };
                    // Fields shadow methods.
                    let field = self.gc.instance(instance_ref).fields.get(&name).copied();
                    if let Some(field) = field {
                        self.pop();
                        self.push(field);
                    } else {
                        let class = self.gc.instance(instance_ref).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    let instance_ref = match target.as_obj() {
                        Some(obj) if matches!(self.gc.get(obj), Obj::Instance(_)) => obj,
                        _ => return self.runtime_error("Only instances have fields."),
                    };
                    let value = self.peek(0);
                    self.gc.instance_mut(instance_ref).fields.insert(name, value);
                    // The assigned value is the expression's result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("superclass slot is not a class");
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.gc.get(a), Obj::Str(_))
                            && matches!(self.gc.get(b), Obj::Str(_)) =>
                    {
                        // Operands stay on the stack across the allocating
                        // intern call.
                        let mut chars = self.gc.as_str(a).to_string();
                        chars.push_str(self.gc.as_str(b));
                        let result = self.intern(&chars);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => {
                        return self
                            .runtime_error("Operands must be two numbers or two strings.");
                    }
                },
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => {
                    let Value::Number(value) = self.peek(0) else {
                        return self.runtime_error("Operand must be a number.");
                    };
                    self.pop();
                    self.push(Value::Number(-value));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.gc);
                    writeln!(self.output, "{}", text).expect("output write failed");
                }
                OpCode::Jump => {
                    let distance = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip += distance;
                }
                OpCode::JumpIfFalse => {
                    let distance = self.read_u16() as usize;
                    if self.peek(0).is_falsy() {
                        self.frames.last_mut().expect("no active frame").ip += distance;
                    }
                }
                OpCode::Loop => {
                    let distance = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip -= distance;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().expect("superclass slot is not a class");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let constant = self.read_constant();
                    let function = constant.as_obj().expect("closure constant is not a function");
                    let upvalue_count = self.gc.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before any upvalue allocation happens.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().expect("no active frame").slots_base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frames.last().expect("no active frame").closure;
                            self.gc.closure(enclosing).upvalues[index]
                        };
                        match self.gc.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure changed kind"),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        // The script closure itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(ClassObj { name, methods: AHashMap::new() }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass_ref = match self.peek(1).as_obj() {
                        Some(obj) if matches!(self.gc.get(obj), Obj::Class(_)) => obj,
                        _ => return self.runtime_error("Superclass must be a class."),
                    };
                    let subclass_ref = self.peek(0).as_obj().expect("subclass slot is not a class");
                    // Copy-down inheritance: the subclass starts with its
                    // superclass's methods and overrides on top.
                    let methods = self.gc.class(superclass_ref).methods.clone();
                    self.gc.class_mut(subclass_ref).methods = methods;
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class_ref = self.peek(1).as_obj().expect("method target is not a class");
                    self.gc.class_mut(class_ref).methods.insert(name, method);
                    self.pop();
                }
            }
        }
    }

    fn binary_number_op(&mut self, op: fn(f64, f64) -> Value) -> Result<(), RuntimeTrap> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return self.runtime_error("Operands must be numbers.");
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeTrap> {
        enum Callee {
            Bound(Value, ObjRef),
            Class,
            Closure,
            Native(NativeFn),
            NotCallable,
        }

        let Some(callee_ref) = callee.as_obj() else {
            return self.runtime_error("Can only call functions and classes.");
        };
        let kind = match self.gc.get(callee_ref) {
            Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
            Obj::Class(_) => Callee::Class,
            Obj::Closure(_) => Callee::Closure,
            Obj::Native(native) => Callee::Native(native.function),
            _ => Callee::NotCallable,
        };

        match kind {
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::Class => {
                let slot = self.stack.len() - argc - 1;
                let instance = self
                    .alloc(Obj::Instance(InstanceObj { class: callee_ref, fields: AHashMap::new() }));
                self.stack[slot] = Value::Obj(instance);
                let init_name = self.gc.init_string;
                let initializer = self.gc.class(callee_ref).methods.get(&init_name).copied();
                if let Some(initializer) = initializer {
                    let closure = initializer.as_obj().expect("initializer is not a closure");
                    return self.call_closure(closure, argc);
                }
                if argc != 0 {
                    let message = format!("Expected 0 arguments but got {}.", argc);
                    return self.runtime_error(&message);
                }
                Ok(())
            }
            Callee::Closure => self.call_closure(callee_ref, argc),
            Callee::Native(function) => {
                let first_arg = self.stack.len() - argc;
                let result = function(&self.stack[first_arg..]);
                self.stack.truncate(first_arg - 1);
                self.push(result);
                Ok(())
            }
            Callee::NotCallable => self.runtime_error("Can only call functions and classes."),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeTrap> {
        let arity = self.gc.function(self.gc.closure(closure).function).arity as usize;
        if argc != arity {
            let message = format!("Expected {} arguments but got {}.", arity, argc);
            return self.runtime_error(&message);
        }
        if self.frames.len() == FRAMES_MAX {
            return self.runtime_error("Stack overflow.");
        }
        self.frames.push(CallFrame { closure, ip: 0, slots_base: self.stack.len() - argc - 1 });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeTrap> {
        let receiver = self.peek(argc);
        let instance_ref = match receiver.as_obj() {
            Some(obj) if matches!(self.gc.get(obj), Obj::Instance(_)) => obj,
            _ => return self.runtime_error("Only instances have methods."),
        };
        // A field holding a callable wins over a method of the same name.
        let field = self.gc.instance(instance_ref).fields.get(&name).copied();
        if let Some(field) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        let class = self.gc.instance(instance_ref).class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: usize,
    ) -> Result<(), RuntimeTrap> {
        let method = self.gc.class(class).methods.get(&name).copied();
        let Some(method) = method else {
            let message = format!("Undefined property '{}'.", self.gc.as_str(name));
            return self.runtime_error(&message);
        };
        let closure = method.as_obj().expect("method is not a closure");
        self.call_closure(closure, argc)
    }

    /// Produces a bound method for `name` on `class` against the receiver
    /// at the top of the stack, replacing it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeTrap> {
        let method = self.gc.class(class).methods.get(&name).copied();
        let Some(method) = method else {
            let message = format!("Undefined property '{}'.", self.gc.as_str(name));
            return self.runtime_error(&message);
        };
        let method_ref = method.as_obj().expect("method is not a closure");
        let receiver = self.peek(0);
        let bound =
            self.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method: method_ref }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Captures the stack slot as an open upvalue, sharing an existing one
    /// when the slot is already captured.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let location =
                self.gc.upvalue(upvalue).location.expect("open-upvalue list holds a closed upvalue");
            if location == slot {
                return upvalue;
            }
            if location < slot {
                insert_at = i;
                break;
            }
        }
        let created =
            self.alloc(Obj::Upvalue(UpvalueObj { location: Some(slot), closed: Value::Nil }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above the threshold slot. The list
    /// is sorted by decreasing slot, so this removes exactly the prefix.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let location =
                self.gc.upvalue(upvalue).location.expect("open-upvalue list holds a closed upvalue");
            if location < threshold {
                break;
            }
            let value = self.stack[location];
            let closed = self.gc.upvalue_mut(upvalue);
            closed.location = None;
            closed.closed = value;
            self.open_upvalues.remove(0);
        }
    }

    // === Natives ===

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.intern(name);
        // Both stay pinned until the global binding exists.
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(NativeObj { function }));
        self.push(Value::Obj(native));
        self.gc.globals.insert(name_ref, Value::Obj(native));
        self.pop();
        self.pop();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the Unix epoch, as a double.
fn native_clock(_args: &[Value]) -> Value {
    Value::Number(Utc::now().timestamp_micros() as f64 / 1_000_000.0)
}
