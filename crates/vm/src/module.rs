//! Module import and link-time relocation.
//!
//! `require` executes a module's top-level code in a fresh VM with its own
//! global table, then relocates everything the module exposes into the
//! importing VM: function code is copied with global accesses rewritten to
//! module-indexed instructions, and literal constants are interned into the
//! importer's pool. The original instructions are never patched in place,
//! so a module shared by several importers stays consistent.
//!
//! The registry is the cross-VM indirection table: every loaded module gets
//! a registry-global index, and `LoadModuleGlobal`/`StoreModuleGlobal`
//! address module globals through it. Worker clones share the registry, so
//! relocated code runs unchanged inside parallel tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::chunk::{Chunk, ConstIdx, ConstantPool, Instruction, ModuleIdx};
use crate::value::{
    ClosureValue, FunctionValue, HeapRef, ModuleValue, RuntimeError, Unit, UpValue,
};
use crate::vm::Vm;

/// Canonical module name: path separators become dots, a trailing source
/// extension is dropped. `"lib/util.tab"` and `"lib.util"` are the same
/// module.
pub fn normalize_module_name(name: &str) -> String {
    let name = name.strip_suffix(".tab").unwrap_or(name);
    name.replace(['/', '\\'], ".")
}

/// A compiled module as produced by the loader: its chunk plus the global
/// names the compiler assigned, prelude entries included.
pub struct LoadedModule {
    pub chunk: Chunk,
    pub global_names: Vec<String>,
}

/// Source of compiled modules. The embedder supplies one; the compiler
/// crate ships a filesystem-backed implementation.
///
/// Returning `None` means the name resolves to nothing; `require` then
/// yields null rather than faulting.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, name: &str) -> Option<LoadedModule>;
}

/// Loader with no sources; every `require` misses.
struct NoModules;

impl ModuleLoader for NoModules {
    fn load(&self, _name: &str) -> Option<LoadedModule> {
        None
    }
}

/// Per-name link state.
enum LinkState {
    /// Top-level code is still executing; a `require` hitting this is a
    /// circular import.
    InProgress,
    Ready(Arc<ModuleValue>),
}

/// Shared module table: loader, the name cache and the index table that
/// `LoadModuleGlobal`/`StoreModuleGlobal` operands resolve against.
pub struct ModuleRegistry {
    loader: Box<dyn ModuleLoader>,
    by_name: Mutex<HashMap<String, LinkState>>,
    modules: RwLock<Vec<Arc<ModuleValue>>>,
}

/// Outcome of a cache probe.
enum Probe {
    Ready(Arc<ModuleValue>),
    Cycle,
    Vacant,
}

impl ModuleRegistry {
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            by_name: Mutex::new(HashMap::new()),
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Registry for embeddings without module support.
    pub fn unloadable() -> Self {
        Self::new(Box::new(NoModules))
    }

    /// Probe the cache, marking the name in-progress when vacant so a
    /// recursive `require` of the same name reads as a cycle.
    fn probe(&self, name: &str) -> Probe {
        let mut cache = self.by_name.lock();
        match cache.get(name) {
            Some(LinkState::Ready(module)) => Probe::Ready(module.clone()),
            Some(LinkState::InProgress) => Probe::Cycle,
            None => {
                cache.insert(name.to_string(), LinkState::InProgress);
                Probe::Vacant
            }
        }
    }

    /// Drop the in-progress marker after a miss or a faulted load.
    fn abandon(&self, name: &str) {
        self.by_name.lock().remove(name);
    }

    /// Allocate the module's registry index before its code runs, so
    /// relocation of dependents can already address it.
    fn reserve(&self, name: &str) -> Arc<ModuleValue> {
        let mut modules = self.modules.write();
        let module = Arc::new(ModuleValue {
            name: Arc::from(name),
            index: modules.len() as ModuleIdx,
            exported: RwLock::new(Unit::Null),
            globals: RwLock::new(Vec::new()),
            global_names: RwLock::new(Vec::new()),
        });
        modules.push(module.clone());
        module
    }

    /// Flip the name from in-progress to ready.
    fn finish(&self, name: &str, module: Arc<ModuleValue>) {
        self.by_name
            .lock()
            .insert(name.to_string(), LinkState::Ready(module));
    }

    pub fn by_index(&self, index: ModuleIdx) -> Option<Arc<ModuleValue>> {
        self.modules.read().get(index as usize).cloned()
    }

    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }

    /// Read a module's private global, as addressed by relocated code.
    pub fn module_global(&self, module: ModuleIdx, idx: u16) -> Result<Unit, RuntimeError> {
        let target = self
            .by_index(module)
            .ok_or(RuntimeError::UndefinedGlobal(idx))?;
        let globals = target.globals.read();
        globals
            .get(idx as usize)
            .cloned()
            .ok_or(RuntimeError::UndefinedGlobal(idx))
    }

    pub fn set_module_global(
        &self,
        module: ModuleIdx,
        idx: u16,
        value: Unit,
    ) -> Result<(), RuntimeError> {
        let target = self
            .by_index(module)
            .ok_or(RuntimeError::UndefinedGlobal(idx))?;
        let mut globals = target.globals.write();
        match globals.get_mut(idx as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::UndefinedGlobal(idx)),
        }
    }
}

impl Vm {
    /// Import a module by name.
    ///
    /// The first import executes the module's top-level code exactly once;
    /// later imports (from any VM on the same registry) return the cached
    /// module object. An unresolvable name or a circular import yields
    /// null; a runtime fault inside the module's top-level code propagates
    /// to the importer.
    pub fn require(&mut self, name: &str) -> Result<Unit, RuntimeError> {
        let name = normalize_module_name(name);
        if let Some(&idx) = self.attached.get(&name) {
            if let Some(module) = self.registry.by_index(idx) {
                return Ok(Unit::module(module));
            }
        }
        let registry = self.registry.clone();
        match registry.probe(&name) {
            Probe::Ready(module) => {
                self.attached.insert(name, module.index);
                Ok(Unit::module(module))
            }
            Probe::Cycle => Ok(Unit::Null),
            Probe::Vacant => match self.load_and_link(&registry, &name) {
                Ok(Some(module)) => {
                    registry.finish(&name, module.clone());
                    self.attached.insert(name, module.index);
                    Ok(Unit::module(module))
                }
                Ok(None) => {
                    registry.abandon(&name);
                    Ok(Unit::Null)
                }
                Err(err) => {
                    registry.abandon(&name);
                    Err(err)
                }
            },
        }
    }

    /// Load, execute and relocate one module. `None` means the loader had
    /// no source for the name.
    fn load_and_link(
        &mut self,
        registry: &Arc<ModuleRegistry>,
        name: &str,
    ) -> Result<Option<Arc<ModuleValue>>, RuntimeError> {
        let Some(loaded) = registry.loader.load(name) else {
            return Ok(None);
        };
        let module = registry.reserve(name);
        let mut module_vm = self.fork_for_module(name);
        let exported = module_vm.run(&loaded.chunk)?;

        let prelude_len = self.prelude_len();
        let mut relocator = Relocator {
            module: &module,
            pool: self.current_pool(),
            prelude_len,
            fn_map: HashMap::new(),
            const_map: HashMap::new(),
            seen_tables: Vec::new(),
            seen_cells: Vec::new(),
        };

        // module globals beyond the prelude move to the module object,
        // densely renumbered from zero
        let source_globals = module_vm.globals_handle();
        let source = source_globals.read();
        let mut globals = Vec::with_capacity(source.values.len().saturating_sub(prelude_len));
        for value in source.values.iter().skip(prelude_len) {
            globals.push(relocator.relocate(value));
        }
        *module.globals.write() = globals;
        *module.global_names.write() = loaded
            .global_names
            .iter()
            .skip(prelude_len)
            .cloned()
            .collect();
        *module.exported.write() = relocator.relocate(&exported);

        Ok(Some(module))
    }
}

/// One relocation pass: rewrites the value graph a module exposes so its
/// functions run correctly inside any importer.
///
/// Functions and closures are copied (their code is rewritten); tables and
/// closed upvalue cells are rewritten in place so object identity, and
/// therefore shared mutable state, survives the import.
struct Relocator<'a> {
    module: &'a Arc<ModuleValue>,
    /// The importer's constant pool; literals intern into it, relocated
    /// function prototypes append to it.
    pool: Arc<ConstantPool>,
    prelude_len: usize,
    /// Source function pointer to relocated copy, so shared and recursive
    /// references stay shared.
    fn_map: HashMap<*const FunctionValue, Arc<FunctionValue>>,
    /// (source pool, slot) to importer pool slot; keyed per pool because
    /// a module's values can carry functions from its own dependencies.
    const_map: HashMap<(*const ConstantPool, ConstIdx), ConstIdx>,
    seen_tables: Vec<*const ()>,
    seen_cells: Vec<*const ()>,
}

impl Relocator<'_> {
    fn relocate(&mut self, value: &Unit) -> Unit {
        match value {
            Unit::Heap(HeapRef::Function(func)) => {
                Unit::Heap(HeapRef::Function(self.relocate_function(func)))
            }
            Unit::Heap(HeapRef::Closure(closure)) => {
                for cell in &closure.upvalues {
                    self.relocate_cell(cell);
                }
                Unit::closure(ClosureValue {
                    function: self.relocate_function(&closure.function),
                    upvalues: closure.upvalues.clone(),
                })
            }
            Unit::Heap(HeapRef::Table(table)) => {
                let ptr = Arc::as_ptr(table) as *const ();
                if !self.seen_tables.contains(&ptr) {
                    self.seen_tables.push(ptr);
                    let mut guard = table.write();
                    for slot in guard.values_mut() {
                        let relocated = self.relocate(&slot.clone());
                        *slot = relocated;
                    }
                }
                value.clone()
            }
            Unit::Heap(HeapRef::UpValue(cell)) => {
                self.relocate_cell(cell);
                value.clone()
            }
            other => other.clone(),
        }
    }

    /// Rewrite a closed cell's payload in place; the cell itself is shared
    /// so every closure over the same variable keeps aliasing it.
    fn relocate_cell(&mut self, cell: &Arc<RwLock<UpValue>>) {
        let ptr = Arc::as_ptr(cell) as *const ();
        if self.seen_cells.contains(&ptr) {
            return;
        }
        self.seen_cells.push(ptr);
        let inner = match &*cell.read() {
            UpValue::Closed(value) => Some(value.clone()),
            UpValue::Open { .. } => None,
        };
        if let Some(value) = inner {
            *cell.write() = UpValue::Closed(self.relocate(&value));
        }
    }

    fn relocate_function(&mut self, func: &Arc<FunctionValue>) -> Arc<FunctionValue> {
        let key = Arc::as_ptr(func);
        if let Some(done) = self.fn_map.get(&key) {
            return done.clone();
        }
        let code: Vec<Instruction> = func
            .code
            .iter()
            .map(|instr| self.relocate_instruction(func, *instr))
            .collect();
        let relocated = Arc::new(FunctionValue {
            name: func.name.clone(),
            arity: func.arity,
            code: code.into(),
            pool: self.pool.clone(),
            positions: func.positions.clone(),
            // functions re-exported from a dependency keep their defining
            // module's name
            module: func
                .module
                .clone()
                .or_else(|| Some(self.module.name.clone())),
            line: func.line,
            upvalues: func.upvalues.clone(),
        });
        self.fn_map.insert(key, relocated.clone());
        relocated
    }

    fn relocate_instruction(
        &mut self,
        func: &Arc<FunctionValue>,
        instr: Instruction,
    ) -> Instruction {
        let prelude = self.prelude_len as u16;
        match instr {
            Instruction::LoadConst(idx) => Instruction::LoadConst(self.relocate_const(func, idx)),
            Instruction::DeclareFunction(idx) => {
                Instruction::DeclareFunction(self.relocate_const(func, idx))
            }
            // prelude globals sit at identical indices in every VM and are
            // left alone
            Instruction::LoadGlobal(idx) if idx >= prelude => {
                Instruction::LoadModuleGlobal(self.module.index, idx - prelude)
            }
            Instruction::StoreGlobal(idx) | Instruction::DeclareGlobal(idx) if idx >= prelude => {
                Instruction::StoreModuleGlobal(self.module.index, idx - prelude)
            }
            // already-relocated cross-module accesses keep their
            // registry-global operands
            other => other,
        }
    }

    /// Map one source pool slot into the importer's pool: function
    /// prototypes are relocated and appended, literals are interned by
    /// value.
    fn relocate_const(&mut self, func: &Arc<FunctionValue>, idx: ConstIdx) -> ConstIdx {
        let key = (Arc::as_ptr(&func.pool), idx);
        if let Some(&mapped) = self.const_map.get(&key) {
            return mapped;
        }
        let value = func.pool.get(idx);
        let mapped = match &value {
            Unit::Heap(HeapRef::Function(proto)) => {
                let relocated = self.relocate_function(proto);
                self.pool.add(Unit::Heap(HeapRef::Function(relocated)))
            }
            _ => self.pool.intern(value),
        };
        self.const_map.insert(key, mapped);
        mapped
    }
}
