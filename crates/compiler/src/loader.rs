//! Module loading for `require`.
//!
//! The VM asks its registry's loader for compiled modules; this loader
//! closes the loop by compiling programs on demand. Source resolution
//! (filesystem lookup, parsing) stays with the embedder as a callback, so
//! the workspace carries no parser or IO policy of its own.

use tabula_syntax::ast::Program;
use tabula_vm::module::{LoadedModule, ModuleLoader};

use crate::compile::compile;

/// Resolves a normalized module name to a parsed program, or nothing when
/// the name has no source.
pub type ResolveFn = dyn Fn(&str) -> Option<Program> + Send + Sync;

/// A [`ModuleLoader`] that compiles resolved programs against a fixed
/// prelude.
///
/// Both resolution misses and compile failures read as a missing module,
/// so `require` yields null for them instead of faulting the importer.
pub struct ProgramLoader {
    resolve: Box<ResolveFn>,
    prelude: Vec<String>,
}

impl ProgramLoader {
    /// The prelude must match the one the importing VMs were built with;
    /// module code is compiled against the same global ordering.
    pub fn new(prelude: Vec<String>, resolve: Box<ResolveFn>) -> Self {
        Self { resolve, prelude }
    }
}

impl ModuleLoader for ProgramLoader {
    fn load(&self, name: &str) -> Option<LoadedModule> {
        let program = (self.resolve)(name)?;
        let unit = compile(&program, &self.prelude).ok()?;
        Some(LoadedModule {
            chunk: unit.chunk,
            global_names: unit.global_names,
        })
    }
}
