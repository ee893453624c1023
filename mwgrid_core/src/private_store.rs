//! Per-agent storage for private variables.

use crate::error::{KernelError, KernelResult};
use crate::versioned::VersionedCell;
use mwgrid_env::{Time, Value, VariableId};
use std::collections::HashMap;

/// Versioned cells for the variables only one agent can see.
///
/// Owned by exactly one agent and only touched from the scheduler thread,
/// so it needs no locking.
#[derive(Debug, Default)]
pub struct PrivateStore {
    cells: HashMap<VariableId, VersionedCell<Value>>,
}

impl PrivateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variable with its initial value at `time`.
    pub fn add(&mut self, variable: VariableId, value: Value, time: Time) -> KernelResult<()> {
        if self.cells.contains_key(&variable) {
            return Err(KernelError::InvalidVariable {
                variable,
                reason: "private variable already added",
            });
        }
        self.cells.insert(variable, VersionedCell::new(time, value));
        Ok(())
    }

    /// Floor-reads a variable at `time`.
    pub fn get(&self, variable: VariableId, time: Time) -> KernelResult<&Value> {
        self.cell(variable)?.read(time)
    }

    /// Writes a variable at exactly `time`.
    ///
    /// A second write at the same time is rejected with `DuplicateWrite` in
    /// every build profile and the first value stays in place. Private state
    /// cannot conflict with another agent, so this is always a caller bug.
    pub fn set(&mut self, variable: VariableId, value: Value, time: Time) -> KernelResult<()> {
        let cell = self
            .cells
            .get_mut(&variable)
            .ok_or(KernelError::InvalidVariable {
                variable,
                reason: "private variable not added",
            })?;
        if cell.write(time, value) {
            Ok(())
        } else {
            Err(KernelError::DuplicateWrite { variable, time })
        }
    }

    pub fn contains(&self, variable: VariableId) -> bool {
        self.cells.contains_key(&variable)
    }

    /// Fossil-collects every cell below `horizon`.
    pub fn prune_below(&mut self, horizon: Time) {
        for cell in self.cells.values_mut() {
            cell.prune_below(horizon);
        }
    }

    /// Rolls every cell back to `time`.
    pub fn prune_above(&mut self, time: Time) {
        for cell in self.cells.values_mut() {
            cell.prune_above(time);
        }
    }

    /// Drops every variable (agent destruction).
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Total number of retained write-periods across all variables.
    pub fn retained_periods(&self) -> usize {
        self.cells.values().map(VersionedCell::len).sum()
    }

    fn cell(&self, variable: VariableId) -> KernelResult<&VersionedCell<Value>> {
        self.cells.get(&variable).ok_or(KernelError::InvalidVariable {
            variable,
            reason: "private variable not added",
        })
    }
}
