//! Tabula Virtual Machine
//!
//! A stack-based bytecode VM designed for:
//! - Embedding: the host registers intrinsics and tables, runs chunks
//!   and gets plain values back
//! - Closures with precise upvalue lifetimes (open cells close exactly
//!   once, when their frame dies)
//! - Module import with link-time relocation of code and constants
//! - Data-parallel bulk table operations over forked worker VMs

pub mod chunk;
pub mod env;
pub mod library;
pub mod module;
pub mod parallel;
pub mod stats;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, ConstantPool, Instruction, PositionTable};
pub use library::Library;
pub use module::{normalize_module_name, LoadedModule, ModuleLoader, ModuleRegistry};
pub use parallel::ClonePool;
pub use stats::MemoryStats;
pub use value::{
    ClosureValue, FunctionValue, HeapRef, IntrinsicFn, ModuleValue, RuntimeError, TableValue,
    UpValue, UpvalueDesc, Unit, WrapperValue,
};
pub use vm::{arg_bool, arg_callable, arg_float, arg_int, arg_str, arg_table, Globals, Vm};
