//! Bulk table operations, sequential and data-parallel.
//!
//! The parallel forms fork one worker VM per task, partition the dense
//! elements into contiguous slices and fan the slices out over scoped
//! threads. Workers share the global table, the module registry and the
//! clone pool with the parent; stack, variable and stash state is private
//! per worker and recycled through the pool so repeated bulk calls reuse
//! their allocations.
//!
//! A fault in any task sets a cancellation flag; slices not yet started
//! are skipped, already-running slices stop at the next element, and the
//! first fault (lowest slice index) is reported to the caller. Partial
//! results are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::env::Variables;
use crate::value::{ClosureValue, HeapRef, RuntimeError, TableValue, Unit, UpValue};
use crate::vm::{self, Vm};

/// Recyclable per-worker allocations.
#[derive(Default)]
pub(crate) struct WorkerState {
    stack: Vec<Unit>,
    vars: Variables,
    stash: Vec<Unit>,
}

impl WorkerState {
    fn clear(&mut self) {
        self.stack.clear();
        self.vars.unwind_to(0);
        self.stash.clear();
    }
}

/// Pool of worker state, shared by a VM and all its forks. Holds at most
/// one state per hardware thread; surplus returns are dropped.
pub struct ClonePool {
    states: Mutex<Vec<WorkerState>>,
    limit: usize,
}

impl ClonePool {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(Vec::new()),
            limit: hardware_threads(),
        }
    }

    fn acquire(&self) -> WorkerState {
        self.states.lock().pop().unwrap_or_default()
    }

    fn release(&self, mut state: WorkerState) {
        state.clear();
        let mut states = self.states.lock();
        if states.len() < self.limit {
            states.push(state);
        }
    }

    pub fn pooled(&self) -> usize {
        self.states.lock().len()
    }
}

impl Default for ClonePool {
    fn default() -> Self {
        Self::new()
    }
}

fn hardware_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Vm {
    /// Fork a worker and seed it with pooled allocations.
    fn fork_worker(&self) -> Vm {
        let mut worker = self.fork();
        let state = self.clone_pool.acquire();
        worker.stack = state.stack;
        worker.vars = state.vars;
        worker.stash = state.stash;
        worker
    }

    /// Return a finished worker's allocations to the pool.
    fn recycle(mut self) {
        let pool = self.clone_pool.clone();
        pool.release(WorkerState {
            stack: std::mem::take(&mut self.stack),
            vars: std::mem::take(&mut self.vars),
            stash: std::mem::take(&mut self.stash),
        });
    }
}

/// Make `callee` safe to run on a worker VM.
///
/// A closure handed to a bulk op can capture a variable whose frame is
/// still live in the calling VM; its cell is then Open against the
/// caller's variable array, which the worker cannot see. Each worker
/// gets a copy of the closure with every open cell replaced by a closed
/// snapshot of the current value. Already-closed cells stay shared, the
/// same as the sequential forms.
fn detach_callee(vm: &Vm, callee: &Unit) -> Unit {
    let Unit::Heap(HeapRef::Closure(closure)) = callee else {
        return callee.clone();
    };
    if closure.upvalues.iter().all(|cell| !cell.read().is_open()) {
        return callee.clone();
    }
    let upvalues = closure
        .upvalues
        .iter()
        .map(|cell| {
            let snapshot = match &*cell.read() {
                UpValue::Open { env, slot } => {
                    Some(vm.vars.get_abs(*env, *slot).unwrap_or(Unit::Null))
                }
                UpValue::Closed(_) => None,
            };
            match snapshot {
                Some(value) => Arc::new(RwLock::new(UpValue::Closed(value))),
                None => cell.clone(),
            }
        })
        .collect();
    Unit::closure(ClosureValue {
        function: closure.function.clone(),
        upvalues,
    })
}

/// Apply `callee` to every item across forked workers, preserving input
/// order in the result.
fn parallel_apply(
    vm: &Vm,
    callee: &Unit,
    items: Vec<Unit>,
) -> Result<Vec<Unit>, RuntimeError> {
    let count = items.len();
    if count == 0 {
        return Ok(Vec::new());
    }
    let n_tasks = hardware_threads().min(count);
    let slice_len = count.div_ceil(n_tasks);
    let cancel = AtomicBool::new(false);
    let (tx, rx) = crossbeam::channel::unbounded();

    std::thread::scope(|scope| {
        for (task, slice) in items.chunks(slice_len).enumerate() {
            let tx = tx.clone();
            let cancel = &cancel;
            let callee = detach_callee(vm, callee);
            let mut worker = vm.fork_worker();
            scope.spawn(move || {
                let mut out = Vec::with_capacity(slice.len());
                for item in slice {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match worker.call_function(&callee, std::slice::from_ref(item)) {
                        Ok(value) => out.push(value),
                        Err(err) => {
                            cancel.store(true, Ordering::Relaxed);
                            worker.recycle();
                            let _ = tx.send((task, Err(err)));
                            return;
                        }
                    }
                }
                worker.recycle();
                let _ = tx.send((task, Ok(out)));
            });
        }
    });
    drop(tx);

    let mut slices: Vec<Option<Vec<Unit>>> = Vec::new();
    slices.resize_with(items.chunks(slice_len).len(), || None);
    let mut fault: Option<(usize, RuntimeError)> = None;
    for (task, outcome) in rx {
        match outcome {
            Ok(values) => slices[task] = Some(values),
            Err(err) => {
                // report the fault of the lowest slice when several race
                if fault.as_ref().map_or(true, |(t, _)| task < *t) {
                    fault = Some((task, err));
                }
            }
        }
    }
    if let Some((_, err)) = fault {
        return Err(RuntimeError::ParallelFault(Box::new(err)));
    }
    let mut results = Vec::with_capacity(count);
    for slice in slices {
        results.extend(slice.unwrap_or_default());
    }
    Ok(results)
}

/// `map(table, f)`: sequential transform of the dense elements into a new
/// table.
pub(crate) fn intrinsic_map(vm: &mut Vm, args: &[Unit]) -> Result<Unit, RuntimeError> {
    let table = vm::arg_table(args, 0)?;
    let callee = vm::arg_callable(args, 1)?;
    let items = table.read().dense_snapshot();
    let mut out = Vec::with_capacity(items.len());
    for item in &items {
        out.push(vm.call_function(&callee, std::slice::from_ref(item))?);
    }
    Ok(TableValue::with_items(out).into())
}

/// `pmap(table, f)`: like `map` but fanned out over worker VMs. Results
/// land at the same indices as their inputs.
pub(crate) fn intrinsic_pmap(vm: &mut Vm, args: &[Unit]) -> Result<Unit, RuntimeError> {
    let table = vm::arg_table(args, 0)?;
    let callee = vm::arg_callable(args, 1)?;
    let items = table.read().dense_snapshot();
    let out = parallel_apply(vm, &callee, items)?;
    Ok(TableValue::with_items(out).into())
}

/// `rmap(n, f)`: parallel map over the integer range `0..n` without
/// materializing an input table first.
pub(crate) fn intrinsic_rmap(vm: &mut Vm, args: &[Unit]) -> Result<Unit, RuntimeError> {
    let n = vm::arg_int(args, 0)?.max(0);
    let callee = vm::arg_callable(args, 1)?;
    let items: Vec<Unit> = (0..n).map(Unit::Int).collect();
    let out = parallel_apply(vm, &callee, items)?;
    Ok(TableValue::with_items(out).into())
}

/// `foreach(table, f)`: sequential application for effect; returns null.
pub(crate) fn intrinsic_foreach(vm: &mut Vm, args: &[Unit]) -> Result<Unit, RuntimeError> {
    let table = vm::arg_table(args, 0)?;
    let callee = vm::arg_callable(args, 1)?;
    let items = table.read().dense_snapshot();
    for item in &items {
        vm.call_function(&callee, std::slice::from_ref(item))?;
    }
    Ok(Unit::Null)
}

/// `range(start, end)`: dense table of the integers `start..end`; empty
/// when `end <= start`.
pub(crate) fn intrinsic_range(_vm: &mut Vm, args: &[Unit]) -> Result<Unit, RuntimeError> {
    let start = vm::arg_int(args, 0)?;
    let end = vm::arg_int(args, 1)?;
    let items: Vec<Unit> = (start..end).map(Unit::Int).collect();
    Ok(TableValue::with_items(items).into())
}
