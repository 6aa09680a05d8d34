//! Runtime introspection for embedders.

use crate::vm::Vm;

/// Point-in-time snapshot of a VM's memory footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub stack_len: usize,
    pub stack_capacity: usize,
    pub variable_count: usize,
    pub variable_capacity: usize,
    pub env_depth: usize,
    pub frame_depth: usize,
    pub open_upvalues: usize,
    pub stash_len: usize,
}

impl Vm {
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            stack_len: self.stack.len(),
            stack_capacity: self.stack.capacity(),
            variable_count: self.vars.slot_count(),
            variable_capacity: self.vars.slot_capacity(),
            env_depth: self.vars.env_count(),
            frame_depth: self.frame_depth(),
            open_upvalues: self.upvalues.open_count(),
            stash_len: self.stash.len(),
        }
    }
}
