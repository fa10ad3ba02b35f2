// File: src/object.rs
//
// Heap object kinds for the Moss runtime.
// Objects live in the garbage collector's arena and are reached through
// copyable ObjRef handles; the GC is their only owner.

use ahash::AHashMap;

use crate::bytecode::Chunk;
use crate::value::Value;

/// Handle to a heap object. Handles compare by identity, which is also how
/// object equality behaves in the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

/// A native function takes the argument slice and produces a value.
pub type NativeFn = fn(&[Value]) -> Value;

/// The heap object sum. Strings and functions are immutable once built;
/// classes and instances mutate through their tables.
pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
}

/// An interned immutable string with its precomputed FNV-1a hash.
pub struct StrObj {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: its bytecode chunk plus arity and capture count.
/// The name is an interned string, or `None` for the top-level script.
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

impl FunctionObj {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

pub struct NativeObj {
    pub function: NativeFn,
}

/// A function plus the upvalues it closes over. The upvalue vector is sized
/// at creation and filled while the closure sits on the stack.
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. While open it points at a live stack slot; when that
/// slot is popped the value moves into `closed`.
pub struct UpvalueObj {
    pub location: Option<usize>,
    pub closed: Value,
}

pub struct ClassObj {
    pub name: ObjRef,
    pub methods: AHashMap<ObjRef, Value>,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: AHashMap<ObjRef, Value>,
}

/// A method pulled off an instance: the receiver paired with the closure to
/// run against it.
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// 32-bit FNV-1a over the string bytes.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }
}
