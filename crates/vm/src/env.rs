//! Environment memory: one growable variable array shared by every lexical
//! scope, partitioned into frames by marker offsets.
//!
//! A `Variable`'s address is only meaningful inside its declaring frame;
//! frames are created/destroyed on function call/return and block
//! entry/exit. Open upvalues alias live slots of this array and are closed
//! exactly once when their frame goes away.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::{RuntimeError, Unit, UpValue};

/// The shared variable array plus the frame markers that slice it into
/// environments.
#[derive(Default)]
pub struct Variables {
    slots: Vec<Unit>,
    markers: Vec<usize>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new innermost environment frame.
    pub fn push_env(&mut self) {
        self.markers.push(self.slots.len());
    }

    /// Discard the innermost frame and every slot it owns. The caller is
    /// responsible for closing upvalues first.
    pub fn pop_env(&mut self) {
        if let Some(marker) = self.markers.pop() {
            self.slots.truncate(marker);
        }
    }

    /// Number of live environment frames.
    pub fn env_count(&self) -> usize {
        self.markers.len()
    }

    /// Index of the innermost frame.
    pub fn top_env(&self) -> usize {
        self.markers.len().saturating_sub(1)
    }

    /// Append a fresh slot to the innermost frame; returns its address
    /// within the frame.
    pub fn declare(&mut self, value: Unit) -> usize {
        let marker = *self.markers.last().unwrap_or(&0);
        self.slots.push(value);
        self.slots.len() - 1 - marker
    }

    /// Read `slot` in the frame `depth` environments up from the innermost.
    pub fn get(&self, slot: usize, depth: usize) -> Result<Unit, RuntimeError> {
        let env = self
            .markers
            .len()
            .checked_sub(depth + 1)
            .ok_or(RuntimeError::StackOverflow)?;
        self.get_abs(env, slot)
    }

    pub fn set(&mut self, slot: usize, depth: usize, value: Unit) -> Result<(), RuntimeError> {
        let env = self
            .markers
            .len()
            .checked_sub(depth + 1)
            .ok_or(RuntimeError::StackOverflow)?;
        self.set_abs(env, slot, value)
    }

    /// Read by absolute environment index, as open upvalues address slots.
    /// The index is checked: a cell can outlive the frame it aliases when
    /// it crosses into another VM, and that must fault, not panic.
    pub fn get_abs(&self, env: usize, slot: usize) -> Result<Unit, RuntimeError> {
        let idx = self
            .markers
            .get(env)
            .map(|base| base + slot)
            .ok_or(RuntimeError::IndexOutOfRange {
                index: slot as i64,
                length: self.slots.len(),
            })?;
        self.slots.get(idx).cloned().ok_or(RuntimeError::IndexOutOfRange {
            index: slot as i64,
            length: self.slots.len(),
        })
    }

    pub fn set_abs(&mut self, env: usize, slot: usize, value: Unit) -> Result<(), RuntimeError> {
        let idx = self
            .markers
            .get(env)
            .map(|base| base + slot)
            .ok_or(RuntimeError::IndexOutOfRange {
                index: slot as i64,
                length: self.slots.len(),
            })?;
        match self.slots.get_mut(idx) {
            Some(target) => {
                *target = value;
                Ok(())
            }
            None => Err(RuntimeError::IndexOutOfRange {
                index: slot as i64,
                length: self.slots.len(),
            }),
        }
    }

    /// Pop frames until `count` remain, without upvalue handling. Used on
    /// call-frame unwind after the upvalues have been closed.
    pub fn unwind_to(&mut self, count: usize) {
        while self.markers.len() > count {
            self.pop_env();
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_capacity(&self) -> usize {
        self.slots.capacity()
    }
}

/// Registry of open upvalues, keyed by the (absolute environment index,
/// slot) they alias.
///
/// Two closures created while the same frame is live share one cell; once
/// the frame closes, the cell transitions Open→Closed and leaves the
/// registry, so a later frame reusing the same index can never alias it.
#[derive(Default)]
pub struct OpenUpvalues {
    cells: HashMap<(usize, usize), Arc<RwLock<UpValue>>>,
}

impl OpenUpvalues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the open cell aliasing `(env, slot)`.
    pub fn capture(&mut self, env: usize, slot: usize) -> Arc<RwLock<UpValue>> {
        self.cells
            .entry((env, slot))
            .or_insert_with(|| Arc::new(RwLock::new(UpValue::Open { env, slot })))
            .clone()
    }

    /// Close every upvalue registered to `env`: copy the current slot value
    /// into private storage. A cell already closed is left untouched, so
    /// the transition happens at most once.
    pub fn close_env(&mut self, env: usize, vars: &Variables) {
        let keys: Vec<(usize, usize)> = self
            .cells
            .keys()
            .filter(|(e, _)| *e == env)
            .copied()
            .collect();
        for key in keys {
            if let Some(cell) = self.cells.remove(&key) {
                let mut cell = cell.write();
                if cell.is_open() {
                    let value = vars.get_abs(key.0, key.1).unwrap_or(Unit::Null);
                    *cell = UpValue::Closed(value);
                }
            }
        }
    }

    /// Close everything registered to frame `from` or deeper. Used when a
    /// call frame unwinds past several environments at once.
    pub fn close_from(&mut self, from: usize, vars: &Variables) {
        let envs: Vec<usize> = self
            .cells
            .keys()
            .map(|(e, _)| *e)
            .filter(|e| *e >= from)
            .collect();
        for env in envs {
            self.close_env(env, vars);
        }
    }

    pub fn open_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_slice_the_variable_array() {
        let mut vars = Variables::new();
        vars.push_env();
        assert_eq!(vars.declare(Unit::Int(1)), 0);
        assert_eq!(vars.declare(Unit::Int(2)), 1);
        vars.push_env();
        assert_eq!(vars.declare(Unit::Int(3)), 0);
        assert!(vars.get(0, 0).unwrap().equals(&Unit::Int(3)));
        assert!(vars.get(0, 1).unwrap().equals(&Unit::Int(1)));
        vars.pop_env();
        assert!(vars.get(1, 0).unwrap().equals(&Unit::Int(2)));
        assert_eq!(vars.slot_count(), 2);
    }

    #[test]
    fn close_is_idempotent_and_copies_current_value() {
        let mut vars = Variables::new();
        let mut upvals = OpenUpvalues::new();
        vars.push_env();
        vars.declare(Unit::Int(10));
        let cell = upvals.capture(0, 0);
        // same (env, slot) reuses the cell
        assert!(Arc::ptr_eq(&cell, &upvals.capture(0, 0)));

        vars.set(0, 0, Unit::Int(42)).unwrap();
        upvals.close_env(0, &vars);
        match &*cell.read() {
            UpValue::Closed(v) => assert!(v.equals(&Unit::Int(42))),
            open => panic!("still open: {open:?}"),
        }
        // closing again is a no-op
        upvals.close_env(0, &vars);
        assert_eq!(upvals.open_count(), 0);
    }

    #[test]
    fn absolute_access_to_a_dead_frame_faults_instead_of_panicking() {
        let mut vars = Variables::new();
        vars.push_env();
        vars.declare(Unit::Int(1));
        // frame index past the marker list
        assert!(vars.get_abs(1, 0).is_err());
        assert!(vars.set_abs(1, 0, Unit::Null).is_err());
        // valid frame, slot past its end
        assert!(vars.get_abs(0, 5).is_err());
    }

    #[test]
    fn recycled_env_index_gets_a_fresh_cell() {
        let mut vars = Variables::new();
        let mut upvals = OpenUpvalues::new();
        vars.push_env();
        vars.declare(Unit::Int(1));
        let first = upvals.capture(0, 0);
        upvals.close_env(0, &vars);
        vars.pop_env();

        vars.push_env();
        vars.declare(Unit::Int(2));
        let second = upvals.capture(0, 0);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
