//! Bytecode chunks for the Tabula VM.
//!
//! A chunk is one compilation unit's flat instruction stream, its interned
//! constant pool, and a run-length compressed table mapping instruction
//! ranges back to source lines. Function bodies are compiled inline and
//! sliced out afterwards, so the pool is shared by every function of the
//! unit while each function owns its own instruction run.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::Unit;

/// Constant pool index.
pub type ConstIdx = u16;

/// Global slot index.
pub type GlobalIdx = u16;

/// Module table index.
pub type ModuleIdx = u16;

/// Variable slot address within one environment frame.
pub type SlotIdx = u16;

/// Relative environment depth (0 = innermost).
pub type EnvDepth = u16;

/// Relative jump offset, from the instruction after the jump.
pub type JumpOffset = i32;

/// Fixed-width instructions: an opcode plus up to three small unsigned
/// operands. Jumps are relative; forward jumps are emitted with a
/// placeholder and patched in place, backward jumps are computed directly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Instruction {
    // === Loads and stores ===
    /// Push `pool[idx]`.
    LoadConst(ConstIdx),
    /// Push the null singleton.
    LoadNull,
    LoadTrue,
    LoadFalse,
    /// Push variable at `slot` in the frame `depth` environments up.
    LoadLocal(SlotIdx, EnvDepth),
    /// Pop into the variable at `slot`, `depth` environments up.
    StoreLocal(SlotIdx, EnvDepth),
    /// Pop into a fresh slot appended to the innermost environment.
    DeclareLocal,
    /// Push global `idx`.
    LoadGlobal(GlobalIdx),
    /// Pop into global `idx`.
    StoreGlobal(GlobalIdx),
    /// Pop into global `idx`, extending the global table. Globals are
    /// append-only; the compiler guarantees `idx` is the next free slot.
    DeclareGlobal(GlobalIdx),
    /// Push global `global` of imported module `module`. Only produced by
    /// relocation, never by the compiler directly.
    LoadModuleGlobal(ModuleIdx, GlobalIdx),
    /// Pop into global `global` of imported module `module`. Relocation
    /// rewrites stores to a module's private globals into this.
    StoreModuleGlobal(ModuleIdx, GlobalIdx),
    /// Push the value of upvalue `idx` of the executing closure.
    LoadUpvalue(u8),
    /// Pop into upvalue `idx` of the executing closure.
    StoreUpvalue(u8),

    // === Indexed access ===
    /// Chained read: pops `count` keys and a target, pushes
    /// `target[k1][k2]...`.
    GetIndex(u8),
    /// Chained write: pops a value, `count` keys and a target, writes
    /// `target[k1]...[kn] = value`.
    SetIndex(u8),
    /// Pops `assoc` key/value pairs then `dense` elements and pushes a new
    /// table.
    NewTable(u16, u16),

    // === Stash ===
    /// Pop into the scratch slot of the current call depth.
    StashStore,
    /// Push a copy of the current call depth's scratch slot.
    StashLoad,

    // === Environments ===
    /// Open a lexical scope: push an environment frame marker.
    PushEnv,
    /// Close the innermost scope. Emitted when the scope created no
    /// closures; the interpreter still closes any upvalue registered to
    /// the frame, so the two forms differ only as a compiler hint.
    PopEnv,
    /// Close the innermost scope and capture every upvalue still open on
    /// it.
    CloseEnv,

    // === Jumps ===
    Jump(JumpOffset),
    /// Pop a boolean; jump if false.
    JumpIfFalse(JumpOffset),
    /// Backward jump: `ip -= offset` counted from the next instruction.
    JumpBack(u32),

    // === Arithmetic / logic / comparison (same-kind operands only) ===
    Add,
    Sub,
    Mul,
    Div,
    Negate,
    Not,
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // === Calls ===
    /// Pops `argc` arguments then the callee; dispatches by callee kind.
    Call(u8),
    /// Instantiate the function or closure prototype at `pool[idx]` and
    /// push it. Closures capture their upvalues against the live
    /// environment here.
    DeclareFunction(ConstIdx),
    /// Pop the frame and resume at the saved ip; top of stack is the
    /// return value.
    Return,

    // === Misc ===
    Pop,
    /// Halt; top of stack is the program result.
    Exit,
}

impl Instruction {
    /// Opcode mnemonic for the chunk dump.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::LoadConst(_) => "LOAD_CONST",
            Instruction::LoadNull => "LOAD_NULL",
            Instruction::LoadTrue => "LOAD_TRUE",
            Instruction::LoadFalse => "LOAD_FALSE",
            Instruction::LoadLocal(..) => "LOAD_LOCAL",
            Instruction::StoreLocal(..) => "STORE_LOCAL",
            Instruction::DeclareLocal => "DECLARE_LOCAL",
            Instruction::LoadGlobal(_) => "LOAD_GLOBAL",
            Instruction::StoreGlobal(_) => "STORE_GLOBAL",
            Instruction::DeclareGlobal(_) => "DECLARE_GLOBAL",
            Instruction::LoadModuleGlobal(..) => "LOAD_MODULE_GLOBAL",
            Instruction::StoreModuleGlobal(..) => "STORE_MODULE_GLOBAL",
            Instruction::LoadUpvalue(_) => "LOAD_UPVALUE",
            Instruction::StoreUpvalue(_) => "STORE_UPVALUE",
            Instruction::GetIndex(_) => "GET_INDEX",
            Instruction::SetIndex(_) => "SET_INDEX",
            Instruction::NewTable(..) => "NEW_TABLE",
            Instruction::StashStore => "STASH_STORE",
            Instruction::StashLoad => "STASH_LOAD",
            Instruction::PushEnv => "PUSH_ENV",
            Instruction::PopEnv => "POP_ENV",
            Instruction::CloseEnv => "CLOSE_ENV",
            Instruction::Jump(_) => "JUMP",
            Instruction::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Instruction::JumpBack(_) => "JUMP_BACK",
            Instruction::Add => "ADD",
            Instruction::Sub => "SUB",
            Instruction::Mul => "MUL",
            Instruction::Div => "DIV",
            Instruction::Negate => "NEGATE",
            Instruction::Not => "NOT",
            Instruction::And => "AND",
            Instruction::Or => "OR",
            Instruction::Equal => "EQUAL",
            Instruction::NotEqual => "NOT_EQUAL",
            Instruction::Less => "LESS",
            Instruction::LessEqual => "LESS_EQUAL",
            Instruction::Greater => "GREATER",
            Instruction::GreaterEqual => "GREATER_EQUAL",
            Instruction::Call(_) => "CALL",
            Instruction::DeclareFunction(_) => "DECLARE_FUNCTION",
            Instruction::Return => "RETURN",
            Instruction::Pop => "POP",
            Instruction::Exit => "EXIT",
        }
    }

    fn operands(&self) -> String {
        match self {
            Instruction::LoadConst(a)
            | Instruction::LoadGlobal(a)
            | Instruction::StoreGlobal(a)
            | Instruction::DeclareGlobal(a)
            | Instruction::DeclareFunction(a) => format!("{a}"),
            Instruction::LoadLocal(a, b)
            | Instruction::StoreLocal(a, b)
            | Instruction::LoadModuleGlobal(a, b)
            | Instruction::StoreModuleGlobal(a, b)
            | Instruction::NewTable(a, b) => format!("{a} {b}"),
            Instruction::LoadUpvalue(a)
            | Instruction::StoreUpvalue(a)
            | Instruction::GetIndex(a)
            | Instruction::SetIndex(a)
            | Instruction::Call(a) => format!("{a}"),
            Instruction::Jump(a) | Instruction::JumpIfFalse(a) => format!("{a}"),
            Instruction::JumpBack(a) => format!("{a}"),
            _ => String::new(),
        }
    }
}

/// Append-only constant pool, interned per compilation unit: identical
/// scalar/string literals share one slot.
///
/// The pool is shared between a chunk and every function sliced out of it,
/// and relocation appends to an importer's pool while worker clones read
/// it, hence the lock.
#[derive(Debug, Default)]
pub struct ConstantPool {
    items: RwLock<Vec<Unit>>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal, reusing an existing slot holding the same value.
    pub fn intern(&self, value: Unit) -> ConstIdx {
        let mut items = self.items.write();
        if let Some(idx) = items.iter().position(|v| v.same_literal(&value)) {
            return idx as ConstIdx;
        }
        items.push(value);
        (items.len() - 1) as ConstIdx
    }

    /// Append without interning (function prototypes, closure prototypes).
    pub fn add(&self, value: Unit) -> ConstIdx {
        let mut items = self.items.write();
        items.push(value);
        (items.len() - 1) as ConstIdx
    }

    /// Replace a slot in place. Used when a function constant turns out to
    /// need closure capture after its body has been compiled.
    pub fn replace(&self, idx: ConstIdx, value: Unit) {
        self.items.write()[idx as usize] = value;
    }

    pub fn get(&self, idx: ConstIdx) -> Unit {
        self.items.read()[idx as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Snapshot of all entries, for dumps and relocation walks.
    pub fn snapshot(&self) -> Vec<Unit> {
        self.items.read().clone()
    }
}

/// One run of consecutive instructions sharing a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PositionRun {
    start: u32,
    line: u32,
}

/// Run-length compressed instruction-index → source-line table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionTable {
    runs: Vec<PositionRun>,
}

impl PositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the line of the instruction at `index`. Indices must be
    /// recorded in emission order; a new run opens only when the line
    /// changes.
    pub fn record(&mut self, index: usize, line: u32) {
        match self.runs.last() {
            Some(run) if run.line == line => {}
            _ => self.runs.push(PositionRun { start: index as u32, line }),
        }
    }

    /// Source line of the instruction at `index`, if known.
    pub fn line_for(&self, index: usize) -> Option<u32> {
        let index = index as u32;
        match self.runs.binary_search_by(|run| run.start.cmp(&index)) {
            Ok(i) => Some(self.runs[i].line),
            Err(0) => None,
            Err(i) => Some(self.runs[i - 1].line),
        }
    }

    /// Extract the runs covering `range`, rebased to instruction 0. Used
    /// when a function body is sliced out of the enclosing chunk.
    pub fn slice(&self, range: std::ops::Range<usize>) -> PositionTable {
        let mut out = PositionTable::new();
        for index in range.clone() {
            if let Some(line) = self.line_for(index) {
                out.record(index - range.start, line);
            }
        }
        out
    }

    /// Drop all runs at or after `index`. Pairs with slicing a function
    /// body back out of the instruction stream.
    pub fn truncate(&mut self, index: usize) {
        self.runs.retain(|run| (run.start as usize) < index);
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

/// A compiled unit: flat instruction array, shared constant pool, position
/// table.
#[derive(Debug)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    pub pool: Arc<ConstantPool>,
    pub positions: PositionTable,
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            pool: Arc::new(ConstantPool::new()),
            positions: PositionTable::new(),
        }
    }

    /// Append an instruction and return its offset.
    pub fn emit(&mut self, instr: Instruction, line: u32) -> usize {
        let offset = self.code.len();
        self.code.push(instr);
        self.positions.record(offset, line);
        offset
    }

    /// Emit a forward jump with a placeholder offset; pair with
    /// [`Chunk::patch_jump`] once the target is known.
    pub fn emit_jump(&mut self, instr: Instruction, line: u32) -> usize {
        self.emit(instr, line)
    }

    /// Patch the jump at `offset` to land on the current end of code.
    pub fn patch_jump(&mut self, offset: usize) {
        let target = self.code.len();
        let relative = (target as isize - offset as isize - 1) as JumpOffset;
        match &mut self.code[offset] {
            Instruction::Jump(off) | Instruction::JumpIfFalse(off) => *off = relative,
            other => unreachable!("patch target is not a jump: {other:?}"),
        }
    }

    /// Emit a backward jump to `target`, computed directly.
    pub fn emit_jump_back(&mut self, target: usize, line: u32) {
        let offset = (self.code.len() + 1 - target) as u32;
        self.emit(Instruction::JumpBack(offset), line);
    }

    /// Debug dump: constants, then one line per instruction as
    /// `<index>: <OPCODE> <operands> on line: <source line>`.
    /// Non-authoritative; format is for humans.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let constants = self.pool.snapshot();
        let _ = writeln!(out, "constants ({}):", constants.len());
        for (i, c) in constants.iter().enumerate() {
            let _ = writeln!(out, "  {i}: {c:?}");
        }
        let _ = writeln!(out, "code ({}):", self.code.len());
        out.push_str(&dump_code(&self.code, &self.positions));
        out
    }
}

/// Shared by chunk and function dumps.
pub fn dump_code(code: &[Instruction], positions: &PositionTable) -> String {
    let mut out = String::new();
    for (i, instr) in code.iter().enumerate() {
        let line = positions.line_for(i).unwrap_or(0);
        let operands = instr.operands();
        if operands.is_empty() {
            let _ = writeln!(out, "{i}: {} on line: {line}", instr.mnemonic());
        } else {
            let _ = writeln!(out, "{i}: {} {operands} on line: {line}", instr.mnemonic());
        }
    }
    out
}
