//! Value representation for the Tabula VM.
//!
//! Design goals:
//! - Explicit sum type: a `Unit` is exactly one of scalar-or-reference,
//!   never an overlapping union
//! - Cheap to clone: heap payloads are `Arc` handles, scalars are `Copy`
//! - Thread-shareable: every variant is `Send + Sync` so parallel bulk
//!   operations can hand values to worker clones without copying

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::chunk::{ConstantPool, Instruction, PositionTable};

/// A runtime value: scalar payloads inline, everything else behind a
/// heap reference.
#[derive(Clone, Default)]
pub enum Unit {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Heap(HeapRef),
}

/// A reference to a heap value kind.
///
/// All handles are `Arc`, so cloning a `HeapRef` aliases the same object.
/// Mutable kinds (tables, upvalues) wrap their payload in a lock; the run
/// loop is single-threaded per VM, the lock exists for the parallel bulk
/// operations where workers may read shared structures.
#[derive(Clone)]
pub enum HeapRef {
    Str(Arc<str>),
    Function(Arc<FunctionValue>),
    Intrinsic(Arc<IntrinsicFn>),
    Closure(Arc<ClosureValue>),
    UpValue(Arc<RwLock<UpValue>>),
    Table(Arc<RwLock<TableValue>>),
    Module(Arc<ModuleValue>),
    Wrapper(Arc<WrapperValue>),
}

/// Key type for the sparse part of a table (must be hashable).
#[derive(Debug, Clone)]
pub enum TableKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Stored as raw bits so NaN keys are at least self-consistent.
    Float(u64),
    Char(char),
    Str(Arc<str>),
}

impl TableKey {
    /// Convert a unit into a key, if its kind is hashable.
    pub fn from_unit(unit: &Unit) -> Option<TableKey> {
        match unit {
            Unit::Null => Some(TableKey::Null),
            Unit::Bool(b) => Some(TableKey::Bool(*b)),
            Unit::Int(i) => Some(TableKey::Int(*i)),
            Unit::Float(f) => Some(TableKey::Float(f.to_bits())),
            Unit::Char(c) => Some(TableKey::Char(*c)),
            Unit::Heap(HeapRef::Str(s)) => Some(TableKey::Str(s.clone())),
            Unit::Heap(_) => None,
        }
    }

    /// Convert back into a unit (used when listing table keys).
    pub fn to_unit(&self) -> Unit {
        match self {
            TableKey::Null => Unit::Null,
            TableKey::Bool(b) => Unit::Bool(*b),
            TableKey::Int(i) => Unit::Int(*i),
            TableKey::Float(bits) => Unit::Float(f64::from_bits(*bits)),
            TableKey::Char(c) => Unit::Char(*c),
            TableKey::Str(s) => Unit::Heap(HeapRef::Str(s.clone())),
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableKey::Null, TableKey::Null) => true,
            (TableKey::Bool(a), TableKey::Bool(b)) => a == b,
            (TableKey::Int(a), TableKey::Int(b)) => a == b,
            (TableKey::Float(a), TableKey::Float(b)) => a == b,
            (TableKey::Char(a), TableKey::Char(b)) => a == b,
            (TableKey::Str(a), TableKey::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            TableKey::Null => {}
            TableKey::Bool(b) => b.hash(state),
            TableKey::Int(i) => i.hash(state),
            TableKey::Float(bits) => bits.hash(state),
            TableKey::Char(c) => c.hash(state),
            TableKey::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_unit())
    }
}

/// A table: dense element list plus sparse key map.
///
/// Invariant: the dense indices `0..items.len()` and the keys of `map`
/// partition disjointly — an integer key inside the dense range is never
/// present in the map.
#[derive(Default)]
pub struct TableValue {
    pub items: Vec<Unit>,
    pub map: HashMap<TableKey, Unit>,
}

impl TableValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Unit>) -> Self {
        Self { items, map: HashMap::new() }
    }

    /// Total number of entries, dense and sparse.
    pub fn len(&self) -> usize {
        self.items.len() + self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.map.is_empty()
    }

    /// Keyed read. Integer keys inside the dense range read the element
    /// list; everything else goes through the sparse map. Missing keys
    /// read as null.
    pub fn get(&self, key: &Unit) -> Result<Unit, RuntimeError> {
        if let Unit::Int(i) = key {
            if *i >= 0 && (*i as usize) < self.items.len() {
                return Ok(self.items[*i as usize].clone());
            }
        }
        let key = TableKey::from_unit(key).ok_or_else(|| RuntimeError::TypeError {
            expected: "hashable key".to_string(),
            found: key.kind_name().to_string(),
        })?;
        Ok(self.map.get(&key).cloned().unwrap_or(Unit::Null))
    }

    /// Keyed write. Writing to index == dense length appends; writing to
    /// an in-range index overwrites in place; any other key lands in the
    /// sparse map. An integer key that becomes contiguous with the dense
    /// range is migrated out of the map so the partition stays disjoint.
    pub fn set(&mut self, key: &Unit, value: Unit) -> Result<(), RuntimeError> {
        if let Unit::Int(i) = key {
            let i = *i;
            if i >= 0 && (i as usize) < self.items.len() {
                self.items[i as usize] = value;
                return Ok(());
            }
            if i >= 0 && i as usize == self.items.len() {
                self.items.push(value);
                self.absorb_dense_successors();
                return Ok(());
            }
        }
        let key = TableKey::from_unit(key).ok_or_else(|| RuntimeError::TypeError {
            expected: "hashable key".to_string(),
            found: key.kind_name().to_string(),
        })?;
        self.map.insert(key, value);
        Ok(())
    }

    pub fn push(&mut self, value: Unit) {
        self.items.push(value);
        self.absorb_dense_successors();
    }

    /// Pull integer keys that continue the dense run out of the sparse map.
    fn absorb_dense_successors(&mut self) {
        while let Some(value) = self.map.remove(&TableKey::Int(self.items.len() as i64)) {
            self.items.push(value);
        }
    }

    /// All keys, dense indices first, sparse keys in arbitrary order.
    pub fn keys(&self) -> Vec<Unit> {
        let mut keys: Vec<Unit> = (0..self.items.len() as i64).map(Unit::Int).collect();
        keys.extend(self.map.keys().map(TableKey::to_unit));
        keys
    }

    /// Mutable view over every stored value, dense then sparse. Used by
    /// module relocation to rewrite function entries in place.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.items.iter_mut().chain(self.map.values_mut())
    }

    /// Length of the dense element run, the part bulk operations walk.
    pub fn dense_len(&self) -> usize {
        self.items.len()
    }

    /// Copy of the dense elements, taken so bulk operations can release
    /// the table lock before calling back into script code.
    pub fn dense_snapshot(&self) -> Vec<Unit> {
        self.items.clone()
    }
}

impl Clone for TableValue {
    fn clone(&self) -> Self {
        Self { items: self.items.clone(), map: self.map.clone() }
    }
}

/// Descriptor of one captured variable, produced at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// Captures a live variable slot: address within its environment frame
    /// plus how many frames up from the instantiation point it lives.
    Local { slot: u16, depth: u16 },
    /// Captures an upvalue of the enclosing closure by index, sharing its
    /// cell. Needed when the variable's own frame may already be gone by
    /// the time the inner closure is created.
    Enclosing(u8),
}

/// Runtime state of a captured variable.
///
/// Starts `Open`, aliasing a live slot in the shared variable array, and
/// transitions to `Closed` at most once, when the owning environment frame
/// closes. The transition copies the slot's value into private storage.
#[derive(Debug, Clone)]
pub enum UpValue {
    Open { env: usize, slot: usize },
    Closed(Unit),
}

impl UpValue {
    pub fn is_open(&self) -> bool {
        matches!(self, UpValue::Open { .. })
    }
}

/// A compiled function.
///
/// Function bodies are compiled inline into the enclosing chunk and then
/// sliced out, so `code` is the body's own instruction run while `pool` is
/// shared with every function of the same compilation unit.
pub struct FunctionValue {
    pub name: String,
    pub arity: u8,
    pub code: Arc<[Instruction]>,
    pub pool: Arc<ConstantPool>,
    pub positions: PositionTable,
    /// Module this function was compiled in, set during relocation.
    pub module: Option<Arc<str>>,
    /// Source line of the declaration.
    pub line: u32,
    /// Capture descriptors; empty for plain functions.
    pub upvalues: SmallVec<[UpvalueDesc; 4]>,
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionValue")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("code_len", &self.code.len())
            .field("module", &self.module)
            .field("line", &self.line)
            .field("upvalues", &self.upvalues)
            .finish()
    }
}

/// A closure: function plus its instantiated upvalue cells, in descriptor
/// order.
pub struct ClosureValue {
    pub function: Arc<FunctionValue>,
    pub upvalues: Vec<Arc<RwLock<UpValue>>>,
}

/// Signature of a native callback. Receives the VM so intrinsics can call
/// back into script code and inspect memory statistics.
pub type NativeCallback =
    dyn Fn(&mut crate::vm::Vm, &[Unit]) -> Result<Unit, RuntimeError> + Send + Sync;

/// A native host function exposed to script code as a callable global.
pub struct IntrinsicFn {
    pub name: String,
    pub arity: u8,
    pub callback: Box<NativeCallback>,
}

impl fmt::Debug for IntrinsicFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrinsicFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// The externally-visible surface of one imported module.
pub struct ModuleValue {
    /// Normalized module name (path separators replaced by `.`).
    pub name: Arc<str>,
    /// Index in the importing VM's module table.
    pub index: u16,
    /// The value the module's top-level code returned, already relocated.
    pub exported: RwLock<Unit>,
    /// Private globals copied over by relocation, addressed by the
    /// (module, global) operands of cross-module load instructions.
    pub globals: RwLock<Vec<Unit>>,
    /// Names parallel to `globals`, for keyed access on the module object.
    pub global_names: RwLock<Vec<String>>,
}

impl ModuleValue {
    /// Keyed read on a module object: exported table first, then the
    /// module's own globals by name.
    pub fn get(&self, key: &Unit) -> Result<Unit, RuntimeError> {
        if let Unit::Heap(HeapRef::Table(t)) = &*self.exported.read() {
            let found = t.read().get(key)?;
            if !matches!(found, Unit::Null) {
                return Ok(found);
            }
        }
        if let Unit::Heap(HeapRef::Str(s)) = key {
            let names = self.global_names.read();
            if let Some(idx) = names.iter().position(|n| n == s.as_ref()) {
                return Ok(self.globals.read()[idx].clone());
            }
        }
        Ok(Unit::Null)
    }
}

/// An opaque host object handed to script code, with an optional method
/// table consulted by keyed access.
pub struct WrapperValue {
    pub type_name: String,
    pub payload: Box<dyn Any + Send + Sync>,
    pub methods: Option<Arc<RwLock<TableValue>>>,
}

/// Runtime errors. Faults are fatal to the executing VM instance; the
/// scripting language exposes no catch construct.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("type error: expected {expected}, got {found}")]
    TypeError { expected: String, found: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range (length {length})")]
    IndexOutOfRange { index: i64, length: usize },

    #[error("value of kind {0} is not callable")]
    NotCallable(String),

    #[error("value of kind {0} is not indexable")]
    NotIndexable(String),

    #[error("{name} expects {expected} argument(s), got {found}")]
    ArityMismatch { name: String, expected: u8, found: usize },

    #[error("stack overflow")]
    StackOverflow,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("undefined global slot {0}")]
    UndefinedGlobal(u16),

    #[error("parallel task failed: {0}")]
    ParallelFault(Box<RuntimeError>),

    #[error("{error} in {function} ({module}, line {line})")]
    Faulted {
        error: Box<RuntimeError>,
        function: String,
        module: String,
        line: u32,
    },
}

impl RuntimeError {
    /// Attach the offending function, module and source line. Applied once
    /// at the fault site; re-wrapping while unwinding is a no-op.
    pub fn trace(self, function: &str, module: &str, line: u32) -> RuntimeError {
        match self {
            RuntimeError::Faulted { .. } => self,
            error => RuntimeError::Faulted {
                error: Box::new(error),
                function: function.to_string(),
                module: module.to_string(),
                line,
            },
        }
    }
}

// === Value protocol ===

impl Unit {
    /// Kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Unit::Null => "null",
            Unit::Bool(_) => "bool",
            Unit::Int(_) => "int",
            Unit::Float(_) => "float",
            Unit::Char(_) => "char",
            Unit::Heap(h) => h.kind_name(),
        }
    }

    /// Truthiness. Only booleans and null coerce; every other kind is a
    /// type error rather than silently truthy.
    pub fn truthy(&self) -> Result<bool, RuntimeError> {
        match self {
            Unit::Bool(b) => Ok(*b),
            Unit::Null => Ok(false),
            other => Err(RuntimeError::TypeError {
                expected: "bool".to_string(),
                found: other.kind_name().to_string(),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Unit::Null)
    }

    /// Structural equality. Tables compare by contents, functions and
    /// other atomic heap kinds by identity. Cyclic tables terminate: a
    /// pair already under comparison contributes no disagreement.
    pub fn equals(&self, other: &Unit) -> bool {
        self.equals_seen(other, &mut Vec::new())
    }

    fn equals_seen(&self, other: &Unit, seen: &mut Vec<(*const (), *const ())>) -> bool {
        match (self, other) {
            (Unit::Null, Unit::Null) => true,
            (Unit::Bool(a), Unit::Bool(b)) => a == b,
            (Unit::Int(a), Unit::Int(b)) => a == b,
            (Unit::Float(a), Unit::Float(b)) => a == b,
            (Unit::Char(a), Unit::Char(b)) => a == b,
            (Unit::Heap(a), Unit::Heap(b)) => a.equals_seen(b, seen),
            _ => false,
        }
    }

    /// Total order across all kinds, used for sorting and as the table-key
    /// comparator. Unlike kinds order by kind rank, so the order is total
    /// even for mixed tables.
    pub fn total_cmp(&self, other: &Unit) -> std::cmp::Ordering {
        self.total_cmp_seen(other, &mut Vec::new())
    }

    fn total_cmp_seen(
        &self,
        other: &Unit,
        seen: &mut Vec<(*const (), *const ())>,
    ) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let rank = |u: &Unit| match u {
            Unit::Null => 0,
            Unit::Bool(_) => 1,
            Unit::Int(_) => 2,
            Unit::Float(_) => 3,
            Unit::Char(_) => 4,
            Unit::Heap(HeapRef::Str(_)) => 5,
            Unit::Heap(HeapRef::Table(_)) => 6,
            Unit::Heap(HeapRef::Function(_)) => 7,
            Unit::Heap(HeapRef::Closure(_)) => 8,
            Unit::Heap(HeapRef::Intrinsic(_)) => 9,
            Unit::Heap(HeapRef::Module(_)) => 10,
            Unit::Heap(HeapRef::UpValue(_)) => 11,
            Unit::Heap(HeapRef::Wrapper(_)) => 12,
        };
        match (self, other) {
            (Unit::Bool(a), Unit::Bool(b)) => a.cmp(b),
            (Unit::Int(a), Unit::Int(b)) => a.cmp(b),
            (Unit::Float(a), Unit::Float(b)) => a.total_cmp(b),
            (Unit::Char(a), Unit::Char(b)) => a.cmp(b),
            (Unit::Heap(HeapRef::Str(a)), Unit::Heap(HeapRef::Str(b))) => a.cmp(b),
            (Unit::Heap(HeapRef::Table(a)), Unit::Heap(HeapRef::Table(b))) => {
                if Arc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                let pair = (Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ());
                if seen.contains(&pair) {
                    return Ordering::Equal;
                }
                seen.push(pair);
                let (a, b) = (a.read(), b.read());
                a.items
                    .iter()
                    .zip(b.items.iter())
                    .map(|(x, y)| x.total_cmp_seen(y, seen))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or_else(|| a.len().cmp(&b.len()))
            }
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Comparison for `< <= > >=`: defined between same-kind ordered
    /// operands only.
    pub fn compare(&self, other: &Unit) -> Result<std::cmp::Ordering, RuntimeError> {
        match (self, other) {
            (Unit::Int(a), Unit::Int(b)) => Ok(a.cmp(b)),
            (Unit::Float(a), Unit::Float(b)) => Ok(a.total_cmp(b)),
            (Unit::Char(a), Unit::Char(b)) => Ok(a.cmp(b)),
            (Unit::Heap(HeapRef::Str(a)), Unit::Heap(HeapRef::Str(b))) => Ok(a.cmp(b)),
            (a, b) => Err(RuntimeError::TypeError {
                expected: format!("comparable operands of one kind, got {}", a.kind_name()),
                found: b.kind_name().to_string(),
            }),
        }
    }

    /// Table-protocol keyed read. Fails on atomic kinds.
    pub fn get_keyed(&self, key: &Unit) -> Result<Unit, RuntimeError> {
        match self {
            Unit::Heap(HeapRef::Table(t)) => t.read().get(key),
            Unit::Heap(HeapRef::Module(m)) => m.get(key),
            Unit::Heap(HeapRef::Str(s)) => match key {
                Unit::Int(i) if *i >= 0 => Ok(s
                    .chars()
                    .nth(*i as usize)
                    .map(Unit::Char)
                    .unwrap_or(Unit::Null)),
                _ => Ok(Unit::Null),
            },
            Unit::Heap(HeapRef::Wrapper(w)) => match &w.methods {
                Some(methods) => methods.read().get(key),
                None => Err(RuntimeError::NotIndexable(self.kind_name().to_string())),
            },
            other => Err(RuntimeError::NotIndexable(other.kind_name().to_string())),
        }
    }

    /// Table-protocol keyed write. Only tables are writable.
    pub fn set_keyed(&self, key: &Unit, value: Unit) -> Result<(), RuntimeError> {
        match self {
            Unit::Heap(HeapRef::Table(t)) => t.write().set(key, value),
            other => Err(RuntimeError::NotIndexable(other.kind_name().to_string())),
        }
    }

    // === Arithmetic: same-numeric-kind operands only, no widening ===

    pub fn add(&self, other: &Unit) -> Result<Unit, RuntimeError> {
        match (self, other) {
            (Unit::Int(a), Unit::Int(b)) => Ok(Unit::Int(a.wrapping_add(*b))),
            (Unit::Float(a), Unit::Float(b)) => Ok(Unit::Float(a + b)),
            (Unit::Heap(HeapRef::Str(a)), Unit::Heap(HeapRef::Str(b))) => {
                Ok(Unit::from(format!("{a}{b}")))
            }
            (a, b) => Err(Self::arith_error("+", a, b)),
        }
    }

    pub fn sub(&self, other: &Unit) -> Result<Unit, RuntimeError> {
        match (self, other) {
            (Unit::Int(a), Unit::Int(b)) => Ok(Unit::Int(a.wrapping_sub(*b))),
            (Unit::Float(a), Unit::Float(b)) => Ok(Unit::Float(a - b)),
            (a, b) => Err(Self::arith_error("-", a, b)),
        }
    }

    pub fn mul(&self, other: &Unit) -> Result<Unit, RuntimeError> {
        match (self, other) {
            (Unit::Int(a), Unit::Int(b)) => Ok(Unit::Int(a.wrapping_mul(*b))),
            (Unit::Float(a), Unit::Float(b)) => Ok(Unit::Float(a * b)),
            (a, b) => Err(Self::arith_error("*", a, b)),
        }
    }

    pub fn div(&self, other: &Unit) -> Result<Unit, RuntimeError> {
        match (self, other) {
            (Unit::Int(_), Unit::Int(0)) => Err(RuntimeError::DivisionByZero),
            (Unit::Int(a), Unit::Int(b)) => Ok(Unit::Int(a.wrapping_div(*b))),
            (Unit::Float(a), Unit::Float(b)) => Ok(Unit::Float(a / b)),
            (a, b) => Err(Self::arith_error("/", a, b)),
        }
    }

    pub fn neg(&self) -> Result<Unit, RuntimeError> {
        match self {
            Unit::Int(a) => Ok(Unit::Int(a.wrapping_neg())),
            Unit::Float(a) => Ok(Unit::Float(-a)),
            a => Err(RuntimeError::TypeError {
                expected: "numeric operand".to_string(),
                found: a.kind_name().to_string(),
            }),
        }
    }

    fn arith_error(op: &str, a: &Unit, b: &Unit) -> RuntimeError {
        RuntimeError::TypeError {
            expected: format!("same-kind numeric operands for `{op}`"),
            found: format!("{} and {}", a.kind_name(), b.kind_name()),
        }
    }
}

impl HeapRef {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapRef::Str(_) => "string",
            HeapRef::Function(_) => "function",
            HeapRef::Intrinsic(_) => "intrinsic",
            HeapRef::Closure(_) => "closure",
            HeapRef::UpValue(_) => "upvalue",
            HeapRef::Table(_) => "table",
            HeapRef::Module(_) => "module",
            HeapRef::Wrapper(_) => "wrapper",
        }
    }

    fn equals_seen(&self, other: &HeapRef, seen: &mut Vec<(*const (), *const ())>) -> bool {
        match (self, other) {
            (HeapRef::Str(a), HeapRef::Str(b)) => a == b,
            (HeapRef::Table(a), HeapRef::Table(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let pair = (Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ());
                if seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let (a, b) = (a.read(), b.read());
                a.items.len() == b.items.len()
                    && a.map.len() == b.map.len()
                    && a
                        .items
                        .iter()
                        .zip(b.items.iter())
                        .all(|(x, y)| x.equals_seen(y, seen))
                    && a.map.iter().all(|(k, v)| {
                        b.map.get(k).is_some_and(|w| v.equals_seen(w, seen))
                    })
            }
            (HeapRef::Function(a), HeapRef::Function(b)) => Arc::ptr_eq(a, b),
            (HeapRef::Closure(a), HeapRef::Closure(b)) => Arc::ptr_eq(a, b),
            (HeapRef::Intrinsic(a), HeapRef::Intrinsic(b)) => Arc::ptr_eq(a, b),
            (HeapRef::Module(a), HeapRef::Module(b)) => Arc::ptr_eq(a, b),
            (HeapRef::Wrapper(a), HeapRef::Wrapper(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_unit(self, f, &mut Vec::new())
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_heap(self, f, &mut Vec::new())
    }
}

fn fmt_unit(u: &Unit, f: &mut fmt::Formatter<'_>, seen: &mut Vec<*const ()>) -> fmt::Result {
    match u {
        Unit::Null => write!(f, "null"),
        Unit::Bool(b) => write!(f, "{b}"),
        Unit::Int(i) => write!(f, "{i}"),
        Unit::Float(x) => {
            if x.fract() == 0.0 && x.is_finite() {
                write!(f, "{x:.1}")
            } else {
                write!(f, "{x}")
            }
        }
        Unit::Char(c) => write!(f, "{c}"),
        Unit::Heap(h) => fmt_heap(h, f, seen),
    }
}

/// Tables already being printed further up the recursion show as `[...]`,
/// so a self-referential table prints finitely.
fn fmt_heap(h: &HeapRef, f: &mut fmt::Formatter<'_>, seen: &mut Vec<*const ()>) -> fmt::Result {
    match h {
        HeapRef::Str(s) => write!(f, "{s}"),
        HeapRef::Function(func) => write!(f, "<function {}>", func.name),
        HeapRef::Intrinsic(i) => write!(f, "<intrinsic {}>", i.name),
        HeapRef::Closure(c) => write!(f, "<closure {}>", c.function.name),
        HeapRef::UpValue(u) => match &*u.read() {
            UpValue::Open { env, slot } => write!(f, "<upvalue open {env}:{slot}>"),
            UpValue::Closed(v) => fmt_unit(v, f, seen),
        },
        HeapRef::Table(t) => {
            let ptr = Arc::as_ptr(t) as *const ();
            if seen.contains(&ptr) {
                return write!(f, "[...]");
            }
            seen.push(ptr);
            let t = t.read();
            write!(f, "[")?;
            let mut first = true;
            for item in &t.items {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                fmt_unit(item, f, seen)?;
            }
            let mut pairs: Vec<_> = t.map.iter().collect();
            pairs.sort_by(|(a, _), (b, _)| a.to_unit().total_cmp(&b.to_unit()));
            for (k, v) in pairs {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{k}: ")?;
                fmt_unit(v, f, seen)?;
            }
            write!(f, "]")?;
            seen.pop();
            Ok(())
        }
        HeapRef::Module(m) => write!(f, "<module {}>", m.name),
        HeapRef::Wrapper(w) => write!(f, "<{}>", w.type_name),
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Heap(HeapRef::Str(s)) => write!(f, "{s:?}"),
            Unit::Char(c) => write!(f, "{c:?}"),
            other => write!(f, "{other}"),
        }
    }
}

// === Conversions used by tests, intrinsics and the compiler ===

impl From<i64> for Unit {
    fn from(v: i64) -> Self {
        Unit::Int(v)
    }
}

impl From<f64> for Unit {
    fn from(v: f64) -> Self {
        Unit::Float(v)
    }
}

impl From<bool> for Unit {
    fn from(v: bool) -> Self {
        Unit::Bool(v)
    }
}

impl From<char> for Unit {
    fn from(v: char) -> Self {
        Unit::Char(v)
    }
}

impl From<&str> for Unit {
    fn from(v: &str) -> Self {
        Unit::Heap(HeapRef::Str(Arc::from(v)))
    }
}

impl From<String> for Unit {
    fn from(v: String) -> Self {
        Unit::Heap(HeapRef::Str(Arc::from(v.as_str())))
    }
}

impl From<TableValue> for Unit {
    fn from(v: TableValue) -> Self {
        Unit::Heap(HeapRef::Table(Arc::new(RwLock::new(v))))
    }
}

impl Unit {
    pub fn function(f: FunctionValue) -> Unit {
        Unit::Heap(HeapRef::Function(Arc::new(f)))
    }

    pub fn closure(c: ClosureValue) -> Unit {
        Unit::Heap(HeapRef::Closure(Arc::new(c)))
    }

    pub fn intrinsic(i: IntrinsicFn) -> Unit {
        Unit::Heap(HeapRef::Intrinsic(Arc::new(i)))
    }

    pub fn module(m: Arc<ModuleValue>) -> Unit {
        Unit::Heap(HeapRef::Module(m))
    }

    /// Constant-pool identity, used for literal interning and relocation
    /// dedup. Scalars and strings intern by value; other heap kinds never
    /// intern.
    pub fn same_literal(&self, other: &Unit) -> bool {
        match (self, other) {
            (Unit::Null, Unit::Null) => true,
            (Unit::Bool(a), Unit::Bool(b)) => a == b,
            (Unit::Int(a), Unit::Int(b)) => a == b,
            (Unit::Float(a), Unit::Float(b)) => a.to_bits() == b.to_bits(),
            (Unit::Char(a), Unit::Char(b)) => a == b,
            (Unit::Heap(HeapRef::Str(a)), Unit::Heap(HeapRef::Str(b))) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_rejects_mixed_kinds() {
        let err = Unit::Int(1).add(&Unit::Float(2.0)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeError { .. }));
        assert!(Unit::Int(2).mul(&Unit::Int(3)).unwrap().equals(&Unit::Int(6)));
        assert!(Unit::Float(1.5).add(&Unit::Float(0.5)).unwrap().equals(&Unit::Float(2.0)));
    }

    #[test]
    fn truthiness_faults_on_non_boolean_heap_kinds() {
        assert!(Unit::Bool(true).truthy().unwrap());
        assert!(!Unit::Null.truthy().unwrap());
        assert!(Unit::from("yes").truthy().is_err());
        assert!(Unit::Int(1).truthy().is_err());
    }

    #[test]
    fn dense_and_sparse_partition_stays_disjoint() {
        let mut t = TableValue::new();
        t.set(&Unit::Int(0), Unit::Int(10)).unwrap();
        // gap: key 2 goes to the sparse map first
        t.set(&Unit::Int(2), Unit::Int(30)).unwrap();
        assert_eq!(t.items.len(), 1);
        assert_eq!(t.map.len(), 1);
        // filling index 1 makes 2 contiguous, so it migrates to the dense part
        t.set(&Unit::Int(1), Unit::Int(20)).unwrap();
        assert_eq!(t.items.len(), 3);
        assert!(t.map.is_empty());
        assert!(t.get(&Unit::Int(2)).unwrap().equals(&Unit::Int(30)));
    }

    #[test]
    fn total_order_ranks_unlike_kinds() {
        use std::cmp::Ordering;
        assert_eq!(Unit::Null.total_cmp(&Unit::Int(0)), Ordering::Less);
        assert_eq!(Unit::Int(3).total_cmp(&Unit::Int(2)), Ordering::Greater);
        assert_eq!(Unit::from("a").total_cmp(&Unit::from("b")), Ordering::Less);
        // comparison operators stay same-kind only
        assert!(Unit::Int(1).compare(&Unit::Float(1.0)).is_err());
    }

    #[test]
    fn keyed_access_fails_on_atomic_kinds() {
        let f = Unit::intrinsic(IntrinsicFn {
            name: "id".to_string(),
            arity: 1,
            callback: Box::new(|_, args| Ok(args[0].clone())),
        });
        assert!(matches!(
            f.get_keyed(&Unit::Int(0)),
            Err(RuntimeError::NotIndexable(_))
        ));
    }

    #[test]
    fn cyclic_tables_compare_and_print_finitely() {
        use std::cmp::Ordering;
        let cyclic = || {
            let unit: Unit = TableValue::new().into();
            if let Unit::Heap(HeapRef::Table(t)) = &unit {
                t.write().push(unit.clone());
            }
            unit
        };
        let (t, u) = (cyclic(), cyclic());
        // two distinct self-referential singletons are indistinguishable
        assert!(t.equals(&u));
        assert_eq!(t.total_cmp(&u), Ordering::Equal);
        assert_eq!(format!("{t}"), "[[...]]");
        // a cycle nested behind ordinary content still terminates
        let outer: Unit = TableValue::with_items(vec![Unit::Int(1), t.clone()]).into();
        assert!(format!("{outer}").starts_with("[1, "));
        assert!(!outer.equals(&u));
    }

    #[test]
    fn literal_identity_interns_by_value() {
        assert!(Unit::from("x").same_literal(&Unit::from("x")));
        assert!(Unit::Float(1.0).same_literal(&Unit::Float(1.0)));
        assert!(!Unit::Int(1).same_literal(&Unit::Float(1.0)));
    }
}
