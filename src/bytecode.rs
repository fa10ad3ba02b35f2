// File: src/bytecode.rs
//
// Bytecode instruction definitions and chunk storage for the Moss VM.
// Instructions are a flat byte stream: a one-byte opcode followed by its
// fixed-width operands. Jumps and loops carry 16-bit big-endian distances;
// constant pool indices are 8-bit.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::gc::Gc;
use crate::object::Obj;
use crate::value::Value;

/// Bytecode opcodes for the Moss VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // === Stack and constants ===
    /// Push `constants[operand]`.
    Constant,
    Nil,
    True,
    False,
    /// Drop the top of the stack.
    Pop,

    // === Variables ===
    /// Push the frame-relative slot named by the operand.
    GetLocal,
    /// Write the top of the stack into a frame-relative slot; does not pop.
    SetLocal,
    /// Look the named constant up in the globals table; undefined is a
    /// runtime error.
    GetGlobal,
    /// Install the top of the stack under the named constant, then pop.
    DefineGlobal,
    /// Overwrite an existing global; undefined is a runtime error.
    SetGlobal,
    /// Push through the closure's upvalue at the operand index.
    GetUpvalue,
    /// Write through the closure's upvalue at the operand index.
    SetUpvalue,

    // === Properties ===
    /// Field read, falling back to a bound method.
    GetProperty,
    /// Field write; the value stays on the stack.
    SetProperty,
    /// Bind a superclass method against the receiver below it.
    GetSuper,

    // === Comparison and arithmetic ===
    Equal,
    Greater,
    Less,
    /// Numbers add; two strings concatenate into an interned result.
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,

    // === Control flow ===
    Print,
    /// Unconditional forward jump by a 16-bit distance.
    Jump,
    /// Forward jump when the (unpopped) condition is falsy.
    JumpIfFalse,
    /// Backward jump by a 16-bit distance.
    Loop,
    /// Call the value sitting under its `argc` arguments.
    Call,
    /// Fused property access and call: `receiver.name(args)`.
    Invoke,
    /// Fused superclass method lookup and call.
    SuperInvoke,
    /// Wrap a function constant in a closure; followed by one
    /// `(is_local, index)` byte pair per upvalue.
    Closure,
    /// Hoist the topmost open upvalue off the stack, then pop.
    CloseUpvalue,
    Return,

    // === Classes ===
    /// Push a fresh class with the named constant as its name.
    Class,
    /// Copy the superclass's methods down into the subclass.
    Inherit,
    /// Bind the closure on top of the stack as a named method on the class
    /// beneath it.
    Method,
}

/// A function's compiled code: the instruction bytes, one source line per
/// byte, and the constant pool the instructions index into.
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self { code: Vec::new(), lines: Vec::new(), constants: Vec::new() }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op.into(), line);
    }

    /// Adds a constant to the pool and returns its index, reusing an
    /// existing equal entry. Returns `None` once 256 constants exist.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if let Some(index) = self.constants.iter().position(|c| c == &value) {
            return Some(index as u8);
        }
        if self.constants.len() >= 256 {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u8)
    }

    /// Renders the whole chunk. The output is deterministic for a given
    /// chunk and heap.
    pub fn disassemble(&self, name: &str, gc: &Gc) -> String {
        let mut out = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.code.len() {
            let (text, next) = self.disassemble_instruction(offset, gc);
            out.push_str(&text);
            out.push('\n');
            offset = next;
        }
        out
    }

    /// Renders one instruction and returns the offset of the next.
    pub fn disassemble_instruction(&self, offset: usize, gc: &Gc) -> (String, usize) {
        let mut text = format!("{:04} ", offset);
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            text.push_str("   | ");
        } else {
            text.push_str(&format!("{:4} ", self.lines[offset]));
        }

        let op = match OpCode::try_from(self.code[offset]) {
            Ok(op) => op,
            Err(_) => {
                text.push_str(&format!("Unknown opcode {}", self.code[offset]));
                return (text, offset + 1);
            }
        };
        let name = format!("{:?}", op);

        use OpCode::*;
        match op {
            Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
            | GetSuper | Class | Method => {
                let index = self.code[offset + 1];
                text.push_str(&format!(
                    "{:<16} {:4} '{}'",
                    name,
                    index,
                    self.constants[index as usize].display(gc)
                ));
                (text, offset + 2)
            }
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
                let slot = self.code[offset + 1];
                text.push_str(&format!("{:<16} {:4}", name, slot));
                (text, offset + 2)
            }
            Jump | JumpIfFalse | Loop => {
                let distance = self.read_u16(offset + 1) as isize;
                let sign: isize = if op == Loop { -1 } else { 1 };
                let target = offset as isize + 3 + sign * distance;
                text.push_str(&format!("{:<16} {:4} -> {}", name, offset, target));
                (text, offset + 3)
            }
            Invoke | SuperInvoke => {
                let index = self.code[offset + 1];
                let argc = self.code[offset + 2];
                text.push_str(&format!(
                    "{:<16} ({} args) {:4} '{}'",
                    name,
                    argc,
                    index,
                    self.constants[index as usize].display(gc)
                ));
                (text, offset + 3)
            }
            Closure => {
                let index = self.code[offset + 1];
                let constant = self.constants[index as usize];
                text.push_str(&format!("{:<16} {:4} {}", name, index, constant.display(gc)));
                let mut next = offset + 2;
                if let Value::Obj(obj) = constant {
                    if let Obj::Function(function) = gc.get(obj) {
                        for _ in 0..function.upvalue_count {
                            let is_local = self.code[next];
                            let capture = self.code[next + 1];
                            text.push_str(&format!(
                                "\n{:04}    |   {:<14} {}",
                                next,
                                if is_local == 1 { "local" } else { "upvalue" },
                                capture
                            ));
                            next += 2;
                        }
                    }
                }
                (text, next)
            }
            _ => {
                text.push_str(&name);
                (text, offset + 1)
            }
        }
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}
