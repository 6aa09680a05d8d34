//! The Tabula execution engine.
//!
//! Design goals:
//! - Single-threaded run loop: one instruction completes before the next,
//!   no preemption within a VM
//! - Cheap to clone: parallel bulk operations fork the VM, sharing the
//!   chunk and global table while owning private stack/variable state
//! - Introspectable: memory statistics and chunk dumps on demand
//!
//! Runtime faults are fatal to the VM instance. The fault unwinds the
//! frame stack and is reported with the offending function name, module
//! and source line recovered from the position table; the embedding
//! caller decides whether to abort or continue.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::chunk::{Chunk, Instruction};
use crate::env::{OpenUpvalues, Variables};
use crate::library::Library;
use crate::module::ModuleRegistry;
use crate::parallel::ClonePool;
use crate::value::{
    ClosureValue, FunctionValue, HeapRef, RuntimeError, TableValue, Unit, UpValue, UpvalueDesc,
};

/// Maximum call-frame depth before the run loop faults.
const MAX_FRAME_DEPTH: usize = 10_000;

/// The global table: append-only named slots, shared between a VM and its
/// parallel worker clones.
#[derive(Default)]
pub struct Globals {
    pub names: Vec<String>,
    pub values: Vec<Unit>,
}

impl Globals {
    /// Append a new global; declarations are append-only per VM instance.
    pub fn declare(&mut self, name: String, value: Unit) -> u16 {
        self.names.push(name);
        self.values.push(value);
        (self.values.len() - 1) as u16
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One active invocation.
struct CallFrame {
    function: Arc<FunctionValue>,
    /// Instantiated upvalue cells when the callee is a closure.
    upvalues: Vec<Arc<RwLock<UpValue>>>,
    ip: usize,
    /// Stack height to restore on return; the return value lands here.
    ret_stack: usize,
    /// Environment count to restore on return.
    ret_env: usize,
}

/// Signal produced by the inner run loop.
enum ExecSignal {
    /// The frame at the base depth returned; value is on the stack.
    Returned,
    /// An Exit instruction halted the program with this result.
    Exited(Unit),
}

/// A Tabula virtual machine.
///
/// `stack`, `vars` and `stash` are private to this instance; `globals`,
/// the module registry and the clone pool are shared with worker clones.
pub struct Vm {
    pub(crate) stack: Vec<Unit>,
    pub(crate) vars: Variables,
    /// One scratch slot per call depth, shuttling a receiver value across
    /// a chained sequence of indexed/method calls.
    pub(crate) stash: Vec<Unit>,
    frames: Vec<CallFrame>,
    pub(crate) globals: Arc<RwLock<Globals>>,
    pub(crate) upvalues: OpenUpvalues,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) clone_pool: Arc<ClonePool>,
    /// Library registrations, used to seed fresh module VMs with the same
    /// prelude at the same indices.
    pub(crate) prelude: Arc<Vec<(String, Unit)>>,
    /// Name of the compilation unit this VM executes, for fault reports.
    pub(crate) unit_name: Arc<str>,
    /// Module names already attached to this VM, by registry index.
    pub(crate) attached: std::collections::HashMap<String, u16>,
}

impl Vm {
    /// Create a VM with the given prelude library. The library's entries
    /// become globals `0..k` in registration order; the compiler must have
    /// been given the same library so indices agree.
    pub fn new(library: Library) -> Self {
        Self::with_registry(library, Arc::new(ModuleRegistry::unloadable()))
    }

    /// Create a VM wired to a module registry for `require`.
    pub fn with_registry(library: Library, registry: Arc<ModuleRegistry>) -> Self {
        let prelude: Vec<(String, Unit)> = library.into_entries();
        let mut globals = Globals::default();
        for (name, value) in &prelude {
            globals.declare(name.clone(), value.clone());
        }
        Self {
            stack: Vec::new(),
            vars: Variables::new(),
            stash: Vec::new(),
            frames: Vec::new(),
            globals: Arc::new(RwLock::new(globals)),
            upvalues: OpenUpvalues::new(),
            registry,
            clone_pool: Arc::new(ClonePool::new()),
            prelude: Arc::new(prelude),
            unit_name: Arc::from("main"),
            attached: std::collections::HashMap::new(),
        }
    }

    /// Fork a worker clone: shares the global table, registry and clone
    /// pool; owns fresh stack/variables/stash/upvalue state.
    pub(crate) fn fork(&self) -> Vm {
        Vm {
            stack: Vec::new(),
            vars: Variables::new(),
            stash: Vec::new(),
            frames: Vec::new(),
            globals: self.globals.clone(),
            upvalues: OpenUpvalues::new(),
            registry: self.registry.clone(),
            clone_pool: self.clone_pool.clone(),
            prelude: self.prelude.clone(),
            unit_name: self.unit_name.clone(),
            attached: std::collections::HashMap::new(),
        }
    }

    /// Fresh VM for executing a required module: same prelude at the same
    /// global indices, same registry, but its own global table.
    pub(crate) fn fork_for_module(&self, name: &str) -> Vm {
        let mut globals = Globals::default();
        for (gname, value) in self.prelude.iter() {
            globals.declare(gname.clone(), value.clone());
        }
        Vm {
            stack: Vec::new(),
            vars: Variables::new(),
            stash: Vec::new(),
            frames: Vec::new(),
            globals: Arc::new(RwLock::new(globals)),
            upvalues: OpenUpvalues::new(),
            registry: self.registry.clone(),
            clone_pool: self.clone_pool.clone(),
            prelude: self.prelude.clone(),
            unit_name: Arc::from(name),
            attached: std::collections::HashMap::new(),
        }
    }

    /// Number of prelude globals; relocation leaves loads of these alone
    /// since every VM registers them at identical indices.
    pub(crate) fn prelude_len(&self) -> usize {
        self.prelude.len()
    }

    pub fn globals_handle(&self) -> Arc<RwLock<Globals>> {
        self.globals.clone()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Execute a compiled chunk to completion. The chunk's top-level code
    /// is wrapped in a synthetic frame named `<main>`.
    pub fn run(&mut self, chunk: &Chunk) -> Result<Unit, RuntimeError> {
        let main = Arc::new(FunctionValue {
            name: "<main>".to_string(),
            arity: 0,
            code: chunk.code.clone().into(),
            pool: chunk.pool.clone(),
            positions: chunk.positions.clone(),
            module: None,
            line: chunk.positions.line_for(0).unwrap_or(1),
            upvalues: Default::default(),
        });
        let base = self.frames.len();
        self.vars.push_env();
        let ret_env = self.vars.env_count() - 1;
        self.frames.push(CallFrame {
            function: main,
            upvalues: Vec::new(),
            ip: 0,
            ret_stack: self.stack.len(),
            ret_env,
        });
        match self.execute(base) {
            Ok(ExecSignal::Exited(result)) => {
                // close any upvalues still aliasing the halting frames
                self.unwind(base);
                Ok(result)
            }
            Ok(ExecSignal::Returned) => Ok(self.stack.pop().unwrap_or(Unit::Null)),
            Err(err) => {
                self.unwind(base);
                Err(err)
            }
        }
    }

    /// Re-entrant call hook for intrinsics: invoke a script-level callable
    /// with the given arguments and run it to completion.
    pub fn call_function(&mut self, callee: &Unit, args: &[Unit]) -> Result<Unit, RuntimeError> {
        match callee {
            Unit::Heap(HeapRef::Intrinsic(intr)) => {
                if args.len() != intr.arity as usize {
                    return Err(RuntimeError::ArityMismatch {
                        name: intr.name.clone(),
                        expected: intr.arity,
                        found: args.len(),
                    });
                }
                (intr.callback)(self, args)
            }
            Unit::Heap(HeapRef::Function(_)) | Unit::Heap(HeapRef::Closure(_)) => {
                let base = self.frames.len();
                self.stack.push(callee.clone());
                self.stack.extend(args.iter().cloned());
                self.begin_call(args.len() as u8)?;
                match self.execute(base) {
                    Ok(ExecSignal::Returned) => Ok(self.stack.pop().unwrap_or(Unit::Null)),
                    Ok(ExecSignal::Exited(result)) => Ok(result),
                    Err(err) => {
                        self.unwind(base);
                        Err(err)
                    }
                }
            }
            other => Err(RuntimeError::NotCallable(other.kind_name().to_string())),
        }
    }

    /// Drop frames, environments and stack back to a base depth after a
    /// fault, closing any upvalues that still alias dying frames.
    fn unwind(&mut self, base: usize) {
        while self.frames.len() > base {
            let frame = self.frames.pop().expect("frame underflow during unwind");
            self.upvalues.close_from(frame.ret_env, &self.vars);
            self.vars.unwind_to(frame.ret_env);
            self.stack.truncate(frame.ret_stack);
            self.stash.truncate(self.frames.len());
        }
    }

    /// The run loop. Executes frames above `base` until the frame at
    /// `base` returns or an Exit halts the program.
    fn execute(&mut self, base: usize) -> Result<ExecSignal, RuntimeError> {
        loop {
            let signal = match self.step() {
                Ok(signal) => signal,
                Err(err) => return Err(self.attach_fault_site(err)),
            };
            match signal {
                StepResult::Continue => {}
                StepResult::FramePopped => {
                    if self.frames.len() <= base {
                        return Ok(ExecSignal::Returned);
                    }
                }
                StepResult::Exited(result) => return Ok(ExecSignal::Exited(result)),
            }
        }
    }

    /// Wrap a fault with the function, module and line it occurred in.
    fn attach_fault_site(&self, err: RuntimeError) -> RuntimeError {
        let Some(frame) = self.frames.last() else {
            return err;
        };
        // ip already advanced past the faulting instruction
        let at = frame.ip.saturating_sub(1);
        let line = frame.function.positions.line_for(at).unwrap_or(frame.function.line);
        let module = frame
            .function
            .module
            .as_deref()
            .unwrap_or(self.unit_name.as_ref());
        err.trace(&frame.function.name, module, line)
    }

    fn pop(&mut self) -> Result<Unit, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    /// Execute one instruction.
    fn step(&mut self) -> Result<StepResult, RuntimeError> {
        let frame = self.frames.last_mut().ok_or(RuntimeError::StackUnderflow)?;
        let Some(instr) = frame.function.code.get(frame.ip).copied() else {
            // running off the end of a body behaves like a bare return
            return self.finish_frame(Unit::Null);
        };
        frame.ip += 1;

        match instr {
            Instruction::LoadConst(idx) => {
                let value = frame.function.pool.get(idx);
                self.stack.push(value);
            }
            Instruction::LoadNull => self.stack.push(Unit::Null),
            Instruction::LoadTrue => self.stack.push(Unit::Bool(true)),
            Instruction::LoadFalse => self.stack.push(Unit::Bool(false)),

            Instruction::LoadLocal(slot, depth) => {
                let value = self.vars.get(slot as usize, depth as usize)?;
                self.stack.push(value);
            }
            Instruction::StoreLocal(slot, depth) => {
                let value = self.pop()?;
                self.vars.set(slot as usize, depth as usize, value)?;
            }
            Instruction::DeclareLocal => {
                let value = self.pop()?;
                self.vars.declare(value);
            }
            Instruction::LoadGlobal(idx) => {
                let globals = self.globals.read();
                let value = globals
                    .values
                    .get(idx as usize)
                    .cloned()
                    .ok_or(RuntimeError::UndefinedGlobal(idx))?;
                drop(globals);
                self.stack.push(value);
            }
            Instruction::StoreGlobal(idx) => {
                let value = self.pop()?;
                let mut globals = self.globals.write();
                match globals.values.get_mut(idx as usize) {
                    Some(slot) => *slot = value,
                    None => return Err(RuntimeError::UndefinedGlobal(idx)),
                }
            }
            Instruction::DeclareGlobal(idx) => {
                let value = self.pop()?;
                let mut globals = self.globals.write();
                if (idx as usize) < globals.values.len() {
                    globals.values[idx as usize] = value;
                } else {
                    // the compiler assigns indices densely in declaration
                    // order, so this extends by exactly one slot
                    globals.values.resize(idx as usize, Unit::Null);
                    globals.values.push(value);
                }
            }
            Instruction::LoadModuleGlobal(module, idx) => {
                let value = self.registry.module_global(module, idx)?;
                self.stack.push(value);
            }
            Instruction::StoreModuleGlobal(module, idx) => {
                let value = self.pop()?;
                self.registry.set_module_global(module, idx, value)?;
            }
            Instruction::LoadUpvalue(idx) => {
                let cell = frame_upvalue(self.frames.last().expect("frame"), idx)?;
                let value = match &*cell.read() {
                    UpValue::Open { env, slot } => self.vars.get_abs(*env, *slot)?,
                    UpValue::Closed(value) => value.clone(),
                };
                self.stack.push(value);
            }
            Instruction::StoreUpvalue(idx) => {
                let value = self.pop()?;
                let cell = frame_upvalue(self.frames.last().expect("frame"), idx)?;
                let target = {
                    let guard = cell.read();
                    match &*guard {
                        UpValue::Open { env, slot } => Some((*env, *slot)),
                        UpValue::Closed(_) => None,
                    }
                };
                match target {
                    Some((env, slot)) => self.vars.set_abs(env, slot, value)?,
                    None => *cell.write() = UpValue::Closed(value),
                }
            }

            Instruction::GetIndex(count) => {
                let keys = self.pop_n(count as usize)?;
                let mut target = self.pop()?;
                for key in &keys {
                    target = target.get_keyed(key)?;
                }
                self.stack.push(target);
            }
            Instruction::SetIndex(count) => {
                let value = self.pop()?;
                let keys = self.pop_n(count as usize)?;
                let mut target = self.pop()?;
                let (last, path) = keys.split_last().ok_or(RuntimeError::StackUnderflow)?;
                for key in path {
                    target = target.get_keyed(key)?;
                }
                target.set_keyed(last, value)?;
            }
            Instruction::NewTable(dense, assoc) => {
                let mut pairs = Vec::with_capacity(assoc as usize);
                for _ in 0..assoc {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    pairs.push((key, value));
                }
                let items = self.pop_n(dense as usize)?;
                let mut table = TableValue::with_items(items);
                for (key, value) in pairs.into_iter().rev() {
                    table.set(&key, value)?;
                }
                self.stack.push(table.into());
            }

            Instruction::StashStore => {
                let depth = self.frames.len() - 1;
                let value = self.pop()?;
                if self.stash.len() <= depth {
                    self.stash.resize(depth + 1, Unit::Null);
                }
                self.stash[depth] = value;
            }
            Instruction::StashLoad => {
                let depth = self.frames.len() - 1;
                let value = self.stash.get(depth).cloned().unwrap_or(Unit::Null);
                self.stack.push(value);
            }

            Instruction::PushEnv => self.vars.push_env(),
            Instruction::PopEnv | Instruction::CloseEnv => {
                let env = self.vars.top_env();
                self.upvalues.close_env(env, &self.vars);
                self.vars.pop_env();
            }

            Instruction::Jump(offset) => {
                let frame = self.frames.last_mut().expect("frame");
                frame.ip = (frame.ip as isize + offset as isize) as usize;
            }
            Instruction::JumpIfFalse(offset) => {
                let cond = self.pop()?.truthy()?;
                if !cond {
                    let frame = self.frames.last_mut().expect("frame");
                    frame.ip = (frame.ip as isize + offset as isize) as usize;
                }
            }
            Instruction::JumpBack(offset) => {
                let frame = self.frames.last_mut().expect("frame");
                frame.ip -= offset as usize;
            }

            Instruction::Add => self.binary(Unit::add)?,
            Instruction::Sub => self.binary(Unit::sub)?,
            Instruction::Mul => self.binary(Unit::mul)?,
            Instruction::Div => self.binary(Unit::div)?,
            Instruction::Negate => {
                let value = self.pop()?;
                self.stack.push(value.neg()?);
            }
            Instruction::Not => {
                let value = self.pop()?.truthy()?;
                self.stack.push(Unit::Bool(!value));
            }
            Instruction::And => {
                let b = self.pop()?.truthy()?;
                let a = self.pop()?.truthy()?;
                self.stack.push(Unit::Bool(a && b));
            }
            Instruction::Or => {
                let b = self.pop()?.truthy()?;
                let a = self.pop()?.truthy()?;
                self.stack.push(Unit::Bool(a || b));
            }
            Instruction::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Unit::Bool(a.equals(&b)));
            }
            Instruction::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Unit::Bool(!a.equals(&b)));
            }
            Instruction::Less => self.comparison(|o| o.is_lt())?,
            Instruction::LessEqual => self.comparison(|o| o.is_le())?,
            Instruction::Greater => self.comparison(|o| o.is_gt())?,
            Instruction::GreaterEqual => self.comparison(|o| o.is_ge())?,

            Instruction::Call(argc) => {
                self.begin_call(argc)?;
            }
            Instruction::DeclareFunction(idx) => {
                let proto = self.frames.last().expect("frame").function.pool.get(idx);
                let value = self.instantiate(proto)?;
                self.stack.push(value);
            }
            Instruction::Return => {
                let value = self.pop()?;
                return self.finish_frame(value);
            }

            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Exit => {
                let result = self.stack.pop().unwrap_or(Unit::Null);
                return Ok(StepResult::Exited(result));
            }
        }
        Ok(StepResult::Continue)
    }

    fn binary(
        &mut self,
        op: fn(&Unit, &Unit) -> Result<Unit, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.stack.push(op(&a, &b)?);
        Ok(())
    }

    fn comparison(
        &mut self,
        pred: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.stack.push(Unit::Bool(pred(a.compare(&b)?)));
        Ok(())
    }

    /// Pop `n` values, preserving their push order.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Unit>, RuntimeError> {
        if self.stack.len() < n {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    /// Dispatch a call: stack holds the callee followed by `argc`
    /// arguments.
    fn begin_call(&mut self, argc: u8) -> Result<(), RuntimeError> {
        let args = self.pop_n(argc as usize)?;
        let callee = self.pop()?;
        match &callee {
            Unit::Heap(HeapRef::Intrinsic(intr)) => {
                if args.len() != intr.arity as usize {
                    return Err(RuntimeError::ArityMismatch {
                        name: intr.name.clone(),
                        expected: intr.arity,
                        found: args.len(),
                    });
                }
                let intr = intr.clone();
                let result = (intr.callback)(self, &args)?;
                self.stack.push(result);
                Ok(())
            }
            Unit::Heap(HeapRef::Function(func)) => {
                self.push_frame(func.clone(), Vec::new(), args)
            }
            Unit::Heap(HeapRef::Closure(closure)) => {
                self.push_frame(closure.function.clone(), closure.upvalues.clone(), args)
            }
            other => Err(RuntimeError::NotCallable(other.kind_name().to_string())),
        }
    }

    fn push_frame(
        &mut self,
        function: Arc<FunctionValue>,
        upvalues: Vec<Arc<RwLock<UpValue>>>,
        args: Vec<Unit>,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= MAX_FRAME_DEPTH {
            return Err(RuntimeError::StackOverflow);
        }
        if args.len() != function.arity as usize {
            return Err(RuntimeError::ArityMismatch {
                name: function.name.clone(),
                expected: function.arity,
                found: args.len(),
            });
        }
        let ret_stack = self.stack.len();
        let ret_env = self.vars.env_count();
        self.vars.push_env();
        for arg in args {
            self.vars.declare(arg);
        }
        self.frames.push(CallFrame {
            function,
            upvalues,
            ip: 0,
            ret_stack,
            ret_env,
        });
        Ok(())
    }

    /// Pop the current frame: close environments it owns (capturing
    /// upvalues), restore stack and stash, push the return value.
    fn finish_frame(&mut self, value: Unit) -> Result<StepResult, RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
        self.upvalues.close_from(frame.ret_env, &self.vars);
        self.vars.unwind_to(frame.ret_env);
        self.stack.truncate(frame.ret_stack);
        self.stash.truncate(self.frames.len());
        self.stack.push(value);
        Ok(StepResult::FramePopped)
    }

    /// Instantiate a function prototype: a plain function passes through,
    /// a capturing one becomes a closure whose upvalues bind against the
    /// live environment right here.
    fn instantiate(&mut self, proto: Unit) -> Result<Unit, RuntimeError> {
        let Unit::Heap(HeapRef::Function(func)) = &proto else {
            return Err(RuntimeError::NotCallable(proto.kind_name().to_string()));
        };
        if func.upvalues.is_empty() {
            return Ok(proto.clone());
        }
        let mut cells = Vec::with_capacity(func.upvalues.len());
        for desc in &func.upvalues {
            let cell = match desc {
                UpvalueDesc::Local { slot, depth } => {
                    let env = self
                        .vars
                        .env_count()
                        .checked_sub(*depth as usize + 1)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.upvalues.capture(env, *slot as usize)
                }
                UpvalueDesc::Enclosing(idx) => {
                    frame_upvalue(self.frames.last().expect("frame"), *idx)?
                }
            };
            cells.push(cell);
        }
        Ok(Unit::closure(ClosureValue {
            function: func.clone(),
            upvalues: cells,
        }))
    }

    /// Current call depth.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Constant pool of the currently executing compilation unit, the
    /// target of relocation dedup.
    pub(crate) fn current_pool(&self) -> Arc<crate::chunk::ConstantPool> {
        self.frames
            .last()
            .map(|frame| frame.function.pool.clone())
            .unwrap_or_default()
    }
}

fn frame_upvalue(
    frame: &CallFrame,
    idx: u8,
) -> Result<Arc<RwLock<UpValue>>, RuntimeError> {
    frame
        .upvalues
        .get(idx as usize)
        .cloned()
        .ok_or(RuntimeError::IndexOutOfRange {
            index: idx as i64,
            length: frame.upvalues.len(),
        })
}

enum StepResult {
    Continue,
    FramePopped,
    Exited(Unit),
}

// === Intrinsic argument accessors ===
//
// Positional typed accessors over the argument slice an intrinsic
// receives; each fails with a TypeError on the wrong kind.

pub fn arg_int(args: &[Unit], n: usize) -> Result<i64, RuntimeError> {
    match args.get(n) {
        Some(Unit::Int(i)) => Ok(*i),
        other => Err(arg_error("int", other, n)),
    }
}

pub fn arg_float(args: &[Unit], n: usize) -> Result<f64, RuntimeError> {
    match args.get(n) {
        Some(Unit::Float(f)) => Ok(*f),
        other => Err(arg_error("float", other, n)),
    }
}

pub fn arg_bool(args: &[Unit], n: usize) -> Result<bool, RuntimeError> {
    match args.get(n) {
        Some(Unit::Bool(b)) => Ok(*b),
        other => Err(arg_error("bool", other, n)),
    }
}

pub fn arg_str(args: &[Unit], n: usize) -> Result<Arc<str>, RuntimeError> {
    match args.get(n) {
        Some(Unit::Heap(HeapRef::Str(s))) => Ok(s.clone()),
        other => Err(arg_error("string", other, n)),
    }
}

pub fn arg_table(
    args: &[Unit],
    n: usize,
) -> Result<Arc<RwLock<TableValue>>, RuntimeError> {
    match args.get(n) {
        Some(Unit::Heap(HeapRef::Table(t))) => Ok(t.clone()),
        other => Err(arg_error("table", other, n)),
    }
}

pub fn arg_callable(args: &[Unit], n: usize) -> Result<Unit, RuntimeError> {
    match args.get(n) {
        Some(
            u @ (Unit::Heap(HeapRef::Function(_))
            | Unit::Heap(HeapRef::Closure(_))
            | Unit::Heap(HeapRef::Intrinsic(_))),
        ) => Ok(u.clone()),
        other => Err(arg_error("callable", other, n)),
    }
}

fn arg_error(expected: &str, got: Option<&Unit>, n: usize) -> RuntimeError {
    RuntimeError::TypeError {
        expected: format!("{expected} at argument {n}"),
        found: got.map(Unit::kind_name).unwrap_or("missing").to_string(),
    }
}
