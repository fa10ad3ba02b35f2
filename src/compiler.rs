// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Moss programming language.
// Pulls tokens straight from the scanner and emits bytecode as it parses;
// no AST is ever built. Expressions go through a Pratt table of prefix and
// infix handlers, declarations and statements through recursive descent.

use crate::bytecode::{Chunk, OpCode};
use crate::gc::Gc;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{FunctionObj, Obj, ObjRef};
use crate::value::Value;

/// Locals (including the reserved slot zero) and upvalues per function both
/// fit in a byte-indexed table.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles a source string to the top-level script function. Diagnostics
/// go to stderr; returns `None` when any error was reported, and the
/// partially built output is left to the collector.
pub fn compile(source: &str, gc: &mut Gc) -> Option<ObjRef> {
    let mut compiler = Compiler::new(source, gc);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// Expression precedence, lowest to highest. The Pratt loop keeps consuming
/// infix operators while their precedence is at least the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// A parse handler takes the whole compiler plus the can-assign flag that
/// keeps `a.b = c` and `a = c` from parsing inside higher-precedence spots.
type ParseFn<'src, 'gc> = fn(&mut Compiler<'src, 'gc>, bool);

struct ParseRule<'src, 'gc> {
    prefix: Option<ParseFn<'src, 'gc>>,
    infix: Option<ParseFn<'src, 'gc>>,
    precedence: Precedence,
}

/// The Pratt table, one row per token kind.
fn rule_for<'src, 'gc>(kind: TokenKind) -> ParseRule<'src, 'gc> {
    use TokenKind::*;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'gc>>,
        Option<ParseFn<'src, 'gc>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        Str => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and_), Precedence::And),
        Or => (None, Some(Compiler::or_), Precedence::Or),
        False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
        Super => (Some(Compiler::super_), None, Precedence::None),
        This => (Some(Compiler::this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A declared local. `depth == -1` marks "declared but not yet initialized",
/// which is what outlaws `var a = a;`.
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state; one entry per function currently being
/// compiled, innermost last.
struct FnState<'src> {
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FnState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot zero belongs to the VM: the called closure, or the receiver
        // in methods and initializers.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        FnState {
            function: FunctionObj::new(name),
            kind,
            locals: vec![Local { name: slot_zero, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Tracks the innermost class declaration so `this` and `super` know when
/// they are legal.
struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src, 'gc> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    states: Vec<FnState<'src>>,
    classes: Vec<ClassState>,
    gc: &'gc mut Gc,
}

impl<'src, 'gc> Compiler<'src, 'gc> {
    fn new(source: &'src str, gc: &'gc mut Gc) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Compiler {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            states: vec![FnState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            gc,
        }
    }

    fn finish(mut self) -> Option<ObjRef> {
        let (function, _) = self.end_state();
        if self.had_error {
            None
        } else {
            Some(function)
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Diagnostics ===

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
        self.had_error = true;
    }

    /// Drops tokens until a statement boundary so one mistake reports once.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emission ===

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.states.last_mut().expect("compiler state underflow").function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Emits a jump with a two-byte placeholder and returns the placeholder
    /// offset for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    /// Back-fills a placeholder with the big-endian distance from just past
    /// the operand bytes to the current write cursor.
    fn patch_jump(&mut self, offset: usize) {
        let distance = self.current_chunk().code.len() - offset - 2;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (distance as u16).to_be_bytes();
        let chunk = self.current_chunk();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.current_chunk().code.len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (distance as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    /// The implicit return: initializers hand back `this`, everything else
    /// returns nil.
    fn emit_return(&mut self) {
        if self.states.last().expect("compiler state underflow").kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    // === Allocation ===
    //
    // Compile-time allocations (interned identifiers and literals, finished
    // functions) can trigger a collection; the compiler chain is the root
    // set, alongside the collector's persistent tables.

    fn intern(&mut self, chars: &str) -> ObjRef {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        self.gc.intern(chars)
    }

    fn collect_garbage(&mut self) {
        for state in &self.states {
            if let Some(name) = state.function.name {
                self.gc.mark_object(name);
            }
            for &constant in &state.function.chunk.constants {
                self.gc.mark_value(constant);
            }
        }
        self.gc.collect();
    }

    /// Seals the innermost function: emits the implicit return, pops the
    /// state, and moves the function into the heap.
    fn end_state(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        // Collect before the pop so the function's constants are still
        // reachable through the compiler chain.
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        let state = self.states.pop().expect("compiler state underflow");
        let upvalues = state.upvalues;
        let mut function = state.function;
        function.upvalue_count = upvalues.len();
        let obj = self.gc.alloc(Obj::Function(function));
        (obj, upvalues)
    }

    // === Scopes and variables ===

    fn begin_scope(&mut self) {
        self.states.last_mut().expect("compiler state underflow").scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.states.last_mut().expect("compiler state underflow").scope_depth -= 1;
        loop {
            let state = self.states.last_mut().expect("compiler state underflow");
            let Some(last) = state.locals.last() else { break };
            if last.depth <= state.scope_depth {
                break;
            }
            let captured = last.is_captured;
            state.locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.intern(name);
        self.make_constant(Value::Obj(obj))
    }

    /// Consumes an identifier and declares it. Returns the name's constant
    /// index at global scope, 0 for locals (which live on the stack).
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.states.last().expect("compiler state underflow").scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    /// Globals are late-bound, so this only records locals. Declaring the
    /// same name twice in one scope is an error.
    fn declare_variable(&mut self) {
        let name = self.previous.lexeme;
        let state = self.states.last().expect("compiler state underflow");
        if state.scope_depth == 0 {
            return;
        }
        let mut collides = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                collides = true;
                break;
            }
        }
        if collides {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.states.last().expect("compiler state underflow").locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.states
            .last_mut()
            .expect("compiler state underflow")
            .locals
            .push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let state = self.states.last_mut().expect("compiler state underflow");
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().expect("no local to initialize").depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.states.last().expect("compiler state underflow").scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Top-down scan of one function's locals.
    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (slot, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(slot as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Walks outward through enclosing functions. A capture from the
    /// immediately enclosing function flags that local as captured; deeper
    /// captures chain through the enclosing function's own upvalues.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return self.add_upvalue(state_index, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return self.add_upvalue(state_index, upvalue, false);
        }
        None
    }

    /// Structurally identical captures share one descriptor.
    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> Option<u8> {
        for (i, upvalue) in self.states[state_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Some(i as u8);
            }
        }
        let count = self.states[state_index].upvalues.len();
        if count >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        self.states[state_index].upvalues.push(UpvalueDesc { index, is_local });
        Some(count as u8)
    }

    /// Resolution order: local, then upvalue, then global.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let state_index = self.states.len() - 1;
        let get_op;
        let set_op;
        let arg;
        if let Some(local) = self.resolve_local(state_index, name.lexeme) {
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
            arg = local;
        } else if let Some(upvalue) = self.resolve_upvalue(state_index, name.lexeme) {
            get_op = OpCode::GetUpvalue;
            set_op = OpCode::SetUpvalue;
            arg = upvalue;
        } else {
            arg = self.identifier_constant(name.lexeme);
            get_op = OpCode::GetGlobal;
            set_op = OpCode::SetGlobal;
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn synthetic_token(&self, text: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Identifier, lexeme: text, line: self.previous.line }
    }

    // === Expressions ===

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule_for(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary handler on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule_for(operator).precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary handler on non-binary token"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1]; // strip the quotes
        let obj = self.intern(chars);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!("literal handler on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("class state").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        let this_token = self.synthetic_token("this");
        self.named_variable(this_token, false);
        let super_token = self.synthetic_token("super");
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // === Declarations and statements ===

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; its name is usable inside its own
        // body, unlike a plain variable initializer.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles one function body in a fresh state and emits the closure in
    /// the enclosing function.
    fn function(&mut self, kind: FunctionKind) {
        let lexeme = self.previous.lexeme;
        let name = self.intern(lexeme);
        self.states.push(FnState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.states.last().expect("compiler state underflow").function.arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.states.last_mut().expect("compiler state underflow").function.arity =
                        arity + 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: popping the state discards its locals wholesale.
        let (function, upvalues) = self.end_state();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);
        let kind = if lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // `super` lives in its own scope so sibling classes each capture
            // their own superclass.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class state").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("class state").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.states.last().expect("compiler state underflow").kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.states.last().expect("compiler state underflow").kind
                == FunctionKind::Initializer
            {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` desugars in place: initializer in its own scope, condition with
    /// an exit jump, and an increment clause the body jumps back through.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_chunk_code(source: &str, gc: &mut Gc) -> Vec<u8> {
        let function = compile(source, gc).expect("source should compile");
        gc.function(function).chunk.code.clone()
    }

    #[test]
    fn recompiling_identical_source_yields_identical_bytes() {
        let mut gc = Gc::new();
        let source = "var a = 1; fun f(x) { return x + a; } print f(2);";
        let first = compile_chunk_code(source, &mut gc);
        let second = compile_chunk_code(source, &mut gc);
        assert_eq!(first, second);
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_an_error() {
        let mut gc = Gc::new();
        assert!(compile("{ var a = a; }", &mut gc).is_none());
    }

    #[test]
    fn global_self_reference_is_late_bound_and_compiles() {
        let mut gc = Gc::new();
        assert!(compile("var a = 1; var a = a;", &mut gc).is_some());
    }

    #[test]
    fn same_scope_redeclaration_is_an_error() {
        let mut gc = Gc::new();
        assert!(compile("{ var a = 1; var a = 2; }", &mut gc).is_none());
        assert!(compile("{ var a = 1; { var a = 2; } }", &mut gc).is_some());
    }

    #[test]
    fn assignment_needs_a_valid_target() {
        let mut gc = Gc::new();
        assert!(compile("var a = 1; var b = 2; a + b = 3;", &mut gc).is_none());
    }

    #[test]
    fn return_is_rejected_at_top_level() {
        let mut gc = Gc::new();
        assert!(compile("return 1;", &mut gc).is_none());
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let mut gc = Gc::new();
        assert!(compile("class C { init() { return 1; } }", &mut gc).is_none());
        assert!(compile("class C { init() { return; } }", &mut gc).is_some());
    }

    #[test]
    fn this_and_super_are_scoped_to_classes() {
        let mut gc = Gc::new();
        assert!(compile("print this;", &mut gc).is_none());
        assert!(compile("fun f() { return super.x; }", &mut gc).is_none());
        assert!(compile("class A { } class B < A { m() { return super.m; } }", &mut gc).is_some());
        assert!(compile("class A { m() { return super.m; } }", &mut gc).is_none());
    }

    #[test]
    fn a_class_cannot_inherit_from_itself() {
        let mut gc = Gc::new();
        assert!(compile("class A < A { }", &mut gc).is_none());
    }

    #[test]
    fn script_function_ends_with_the_implicit_return() {
        let mut gc = Gc::new();
        let function = compile("print 1;", &mut gc).unwrap();
        let code = &gc.function(function).chunk.code;
        assert_eq!(code[code.len() - 2], OpCode::Nil.into());
        assert_eq!(code[code.len() - 1], OpCode::Return.into());
    }

    #[test]
    fn super_expression_emits_exactly_one_super_opcode() {
        let mut gc = Gc::new();
        let script = compile(
            "class A { m() { } } class B < A { m() { return super.m; } n() { return super.m(); } }",
            &mut gc,
        )
        .unwrap();

        // Dig out every compiled function and count super opcodes per chunk.
        let mut per_chunk = Vec::new();
        let mut pending = vec![script];
        while let Some(function) = pending.pop() {
            let chunk = &gc.function(function).chunk;
            for constant in &chunk.constants {
                if let Value::Obj(obj) = constant {
                    if matches!(gc.get(*obj), Obj::Function(_)) {
                        pending.push(*obj);
                    }
                }
            }
            let mut gets = 0;
            let mut invokes = 0;
            let mut offset = 0;
            while offset < chunk.code.len() {
                let (_, next) = chunk.disassemble_instruction(offset, &gc);
                match OpCode::try_from(chunk.code[offset]) {
                    Ok(OpCode::GetSuper) => gets += 1,
                    Ok(OpCode::SuperInvoke) => invokes += 1,
                    _ => {}
                }
                offset = next;
            }
            per_chunk.push((gets, invokes));
        }

        let total_gets: usize = per_chunk.iter().map(|(g, _)| g).sum();
        let total_invokes: usize = per_chunk.iter().map(|(_, i)| i).sum();
        assert_eq!(total_gets, 1);
        assert_eq!(total_invokes, 1);
    }

    #[test]
    fn jump_distances_land_after_their_operands() {
        let mut gc = Gc::new();
        let function = compile("if (true) { print 1; } else { print 2; }", &mut gc).unwrap();
        let chunk = &gc.function(function).chunk;
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[offset]).unwrap();
            let (_, next) = chunk.disassemble_instruction(offset, &gc);
            if matches!(op, OpCode::Jump | OpCode::JumpIfFalse) {
                let distance = chunk.read_u16(offset + 1) as usize;
                let target = offset + 3 + distance;
                assert!(target <= chunk.code.len());
            }
            if op == OpCode::Loop {
                let distance = chunk.read_u16(offset + 1) as usize;
                assert!(distance <= offset + 3);
            }
            offset = next;
        }
    }
}
