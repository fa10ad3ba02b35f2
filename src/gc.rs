// File: src/gc.rs
//
// Precise mark-sweep garbage collector for the Moss runtime.
// The collector owns every heap object in an arena of slots addressed by
// ObjRef handles, together with the string intern table and the globals
// table. Collection is triggered from the allocating call sites: both the
// VM and the compiler check `should_collect` and mark their own roots
// before allocating; the collector always marks its persistent tables.

use ahash::AHashMap;

use crate::object::{
    hash_str, ClassObj, ClosureObj, FunctionObj, InstanceObj, Obj, ObjRef, StrObj, UpvalueObj,
};
use crate::value::Value;

/// First collection fires once a megabyte is live.
const INITIAL_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// One arena cell: the object plus its mark bit and the byte size charged
/// against `bytes_allocated` when it was created.
struct Slot {
    marked: bool,
    size: usize,
    obj: Obj,
}

pub struct Gc {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Gray worklist, reused across cycles.
    gray: Vec<ObjRef>,
    /// Child-gathering scratch, reused across cycles.
    scratch: Vec<ObjRef>,
    /// Weak map from string content to its unique interned object.
    strings: AHashMap<String, ObjRef>,
    /// Global bindings, keyed by interned name.
    pub globals: AHashMap<ObjRef, Value>,
    /// Pre-interned "init", looked up on every class call.
    pub init_string: ObjRef,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation. Test tooling only.
    pub stress: bool,
}

impl Gc {
    pub fn new() -> Self {
        let mut gc = Gc {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            scratch: Vec::new(),
            strings: AHashMap::new(),
            globals: AHashMap::new(),
            init_string: ObjRef(0),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress: false,
        };
        gc.init_string = gc.intern("init");
        gc
    }

    /// Installs an object in the arena. Callers are responsible for calling
    /// `collect` first when `should_collect` says so, with every value they
    /// hold outside a root pinned on the VM stack.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj_size(&obj);
        self.bytes_allocated += size;
        let slot = Slot { marked: false, size, obj };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                ObjRef(index as u32)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Returns the unique string object for this content, creating it on
    /// first sight. At most one string object per distinct byte sequence
    /// exists at any time.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(chars) {
            return existing;
        }
        let hash = hash_str(chars);
        let obj = self.alloc(Obj::Str(StrObj { chars: chars.to_string(), hash }));
        self.strings.insert(chars.to_string(), obj);
        obj
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Live objects in the arena. Test visibility.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        Self::mark_into(&mut self.slots, &mut self.gray, obj);
    }

    fn mark_into(slots: &mut [Option<Slot>], gray: &mut Vec<ObjRef>, obj: ObjRef) {
        let slot = slots[obj.0 as usize].as_mut().expect("marked a freed object");
        if slot.marked {
            return;
        }
        slot.marked = true;
        gray.push(obj);
    }

    /// Runs a full cycle. External roots (VM stack, call frames, open
    /// upvalues, compiler chain) must have been marked by the caller; the
    /// collector adds its own persistent roots, traces, prunes the weak
    /// intern table, and sweeps.
    pub fn collect(&mut self) {
        self.mark_object(self.init_string);
        let Gc { slots, gray, globals, .. } = self;
        for (&name, &value) in globals.iter() {
            Self::mark_into(slots, gray, name);
            if let Value::Obj(obj) = value {
                Self::mark_into(slots, gray, obj);
            }
        }

        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }

        // Interned strings are weak references: unmarked entries go away
        // before the sweep frees their objects.
        let slots = &self.slots;
        self.strings
            .retain(|_, obj| slots[obj.0 as usize].as_ref().is_some_and(|slot| slot.marked));

        for index in 0..self.slots.len() {
            let free = match &mut self.slots[index] {
                Some(slot) => {
                    if slot.marked {
                        slot.marked = false;
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if free {
                let slot = self.slots[index].take().expect("slot vanished during sweep");
                self.bytes_allocated -= slot.size;
                self.free.push(index);
            }
        }

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }

    /// Marks every outgoing reference of one gray object.
    fn blacken(&mut self, obj: ObjRef) {
        let mut pending = std::mem::take(&mut self.scratch);
        pending.clear();
        {
            let slot = self.slots[obj.0 as usize].as_ref().expect("blackened a freed object");
            match &slot.obj {
                Obj::Str(_) | Obj::Native(_) => {}
                Obj::Function(function) => {
                    if let Some(name) = function.name {
                        pending.push(name);
                    }
                    for &constant in &function.chunk.constants {
                        if let Value::Obj(child) = constant {
                            pending.push(child);
                        }
                    }
                }
                Obj::Closure(closure) => {
                    pending.push(closure.function);
                    pending.extend(closure.upvalues.iter().copied());
                }
                Obj::Upvalue(upvalue) => {
                    if let Value::Obj(child) = upvalue.closed {
                        pending.push(child);
                    }
                }
                Obj::Class(class) => {
                    pending.push(class.name);
                    for (&name, &method) in &class.methods {
                        pending.push(name);
                        if let Value::Obj(child) = method {
                            pending.push(child);
                        }
                    }
                }
                Obj::Instance(instance) => {
                    pending.push(instance.class);
                    for (&name, &field) in &instance.fields {
                        pending.push(name);
                        if let Value::Obj(child) = field {
                            pending.push(child);
                        }
                    }
                }
                Obj::BoundMethod(bound) => {
                    if let Value::Obj(receiver) = bound.receiver {
                        pending.push(receiver);
                    }
                    pending.push(bound.method);
                }
            }
        }
        for child in pending.drain(..) {
            self.mark_object(child);
        }
        self.scratch = pending;
    }

    // Typed extractors. Each assumes the caller established the object kind;
    // a mismatch is a VM bug, not a user error.

    pub fn get(&self, obj: ObjRef) -> &Obj {
        &self.slots[obj.0 as usize].as_ref().expect("read a freed object").obj
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> &mut Obj {
        &mut self.slots[obj.0 as usize].as_mut().expect("wrote a freed object").obj
    }

    pub fn as_str(&self, obj: ObjRef) -> &str {
        match self.get(obj) {
            Obj::Str(s) => &s.chars,
            _ => panic!("object is not a string"),
        }
    }

    pub fn function(&self, obj: ObjRef) -> &FunctionObj {
        match self.get(obj) {
            Obj::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn closure(&self, obj: ObjRef) -> &ClosureObj {
        match self.get(obj) {
            Obj::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn class(&self, obj: ObjRef) -> &ClassObj {
        match self.get(obj) {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, obj: ObjRef) -> &mut ClassObj {
        match self.get_mut(obj) {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn instance(&self, obj: ObjRef) -> &InstanceObj {
        match self.get(obj) {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, obj: ObjRef) -> &mut InstanceObj {
        match self.get_mut(obj) {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn upvalue(&self, obj: ObjRef) -> &UpvalueObj {
        match self.get(obj) {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, obj: ObjRef) -> &mut UpvalueObj {
        match self.get_mut(obj) {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

fn obj_size(obj: &Obj) -> usize {
    use std::mem::size_of;
    let payload = match obj {
        Obj::Str(s) => s.chars.capacity(),
        Obj::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * size_of::<u32>()
                + f.chunk.constants.capacity() * size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.capacity() * (size_of::<ObjRef>() + size_of::<Value>()),
        Obj::Instance(i) => i.fields.capacity() * (size_of::<ObjRef>() + size_of::<Value>()),
        Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
    };
    size_of::<Slot>() + payload
}
