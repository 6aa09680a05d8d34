//! Prelude library descriptor.
//!
//! A `Library` is an ordered list of named intrinsics and named tables,
//! auto-registered as globals `0..k` before user code compiles. The
//! compiler and the VM must be handed the same library so both assign
//! identical global indices for the registration order.
//!
//! The full standard prelude (math, string, file, rand, time) lives with
//! the embedder; this crate only ships the core entries the VM itself
//! defines: table helpers, the bulk table operations and `require`.

use crate::parallel;
use crate::value::{IntrinsicFn, RuntimeError, TableValue, Unit};
use crate::vm::{self, Vm};

/// Ordered prelude registrations.
#[derive(Default)]
pub struct Library {
    entries: Vec<(String, Unit)>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// The core library: keyed/bulk table operations and module import.
    pub fn core() -> Self {
        let mut lib = Self::new();
        lib.register_intrinsic("require", 1, |vm, args| {
            let name = vm::arg_str(args, 0)?;
            vm.require(&name)
        });
        lib.register_intrinsic("len", 1, |_, args| {
            let len = match &args[0] {
                Unit::Heap(crate::value::HeapRef::Str(s)) => s.chars().count(),
                _ => vm::arg_table(args, 0)?.read().len(),
            };
            Ok(Unit::Int(len as i64))
        });
        lib.register_intrinsic("push", 2, |_, args| {
            let table = vm::arg_table(args, 0)?;
            table.write().push(args[1].clone());
            Ok(args[0].clone())
        });
        lib.register_intrinsic("keys", 1, |_, args| {
            let table = vm::arg_table(args, 0)?;
            let keys = table.read().keys();
            Ok(TableValue::with_items(keys).into())
        });
        lib.register_intrinsic("map", 2, parallel::intrinsic_map);
        lib.register_intrinsic("pmap", 2, parallel::intrinsic_pmap);
        lib.register_intrinsic("rmap", 2, parallel::intrinsic_rmap);
        lib.register_intrinsic("foreach", 2, parallel::intrinsic_foreach);
        lib.register_intrinsic("range", 2, parallel::intrinsic_range);
        lib
    }

    /// Append a named intrinsic. Registration order is binding order.
    pub fn register_intrinsic(
        &mut self,
        name: &str,
        arity: u8,
        callback: fn(&mut Vm, &[Unit]) -> Result<Unit, RuntimeError>,
    ) {
        self.entries.push((
            name.to_string(),
            Unit::intrinsic(IntrinsicFn {
                name: name.to_string(),
                arity,
                callback: Box::new(callback),
            }),
        ));
    }

    /// Append a named table (for grouped host APIs).
    pub fn register_table(&mut self, name: &str, table: TableValue) {
        self.entries.push((name.to_string(), table.into()));
    }

    /// Append an arbitrary named value.
    pub fn register_value(&mut self, name: &str, value: Unit) {
        self.entries.push((name.to_string(), value));
    }

    /// Global names in registration order, for the compiler's
    /// pre-registration pass.
    pub fn global_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(String, Unit)> {
        self.entries
    }
}
