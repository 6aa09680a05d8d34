//! Tabula Compiler
//!
//! Compiles AST to bytecode with:
//! - Scope-stack name resolution (locals, upvalue capture, globals)
//! - Inline function compilation with slice-out into pool constants
//! - Table literal desugaring
//! - Accumulated diagnostics with abort-on-first-error

pub mod compile;
pub mod loader;

pub use compile::{compile, CompileError, CompileFailure, CompiledUnit};
pub use loader::{ProgramLoader, ResolveFn};
