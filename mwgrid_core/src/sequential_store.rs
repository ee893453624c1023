//! In-process shared store for single-process runs.

use crate::error::{KernelError, KernelResult};
use crate::shared_store::{Identifier, RollbackLedger, SharedStore};
use crate::variable::{kernel_vars, Variable};
use crate::versioned::VersionedCell;
use mwgrid_env::{EntityId, Location, Role, Time, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::trace;

/// Shared store holding every cell in this process.
///
/// The horizon is computed from the local times the scheduler reports:
/// `min(last reported) - 1`.
#[derive(Debug, Default)]
pub struct SequentialStore {
    cells: RwLock<HashMap<Identifier, VersionedCell<Value>>>,
    reported: Mutex<HashMap<EntityId, Time>>,
    rollbacks: RollbackLedger,
}

impl SequentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered identifiers.
    pub fn len(&self) -> usize {
        self.cells.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total retained write-periods across all cells.
    pub fn retained_periods(&self) -> usize {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VersionedCell::len)
            .sum()
    }
}

impl SharedStore for SequentialStore {
    fn add(&self, entity: EntityId, variable: &Variable, initial: Value, time: Time) -> KernelResult<bool> {
        let id = Identifier::new(entity, variable.id);
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        if cells.contains_key(&id) {
            return Err(KernelError::AlreadyExists(id));
        }
        trace!(%id, time, "Shared variable added");
        cells.insert(id, VersionedCell::new(time, initial));
        Ok(true)
    }

    fn read(&self, reader: EntityId, target: EntityId, variable: &Variable, time: Time) -> KernelResult<Value> {
        let id = Identifier::new(target, variable.id);
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        let cell = cells.get(&id).ok_or(KernelError::NotFound(id))?;
        trace!(%reader, %id, time, "Shared read");
        cell.read(time).cloned()
    }

    fn write(
        &self,
        writer: EntityId,
        target: EntityId,
        variable: &Variable,
        value: Value,
        time: Time,
    ) -> KernelResult<bool> {
        let id = Identifier::new(target, variable.id);
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        let cell = cells.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        let accepted = cell.write(time, value);
        trace!(%writer, %id, time, accepted, "Shared write");
        Ok(accepted)
    }

    fn range_query(
        &self,
        caller: EntityId,
        time: Time,
        a: Location,
        b: Location,
    ) -> KernelResult<HashMap<EntityId, Location>> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        let found: HashMap<EntityId, Location> = cells
            .iter()
            .filter(|(id, _)| id.variable == kernel_vars::LOCATION.id)
            // Entities created after `time` have no location yet and are skipped.
            .filter_map(|(id, cell)| match cell.read(time) {
                Ok(Value::Location(loc)) if loc.within(a, b) => Some((id.entity, *loc)),
                _ => None,
            })
            .collect();
        trace!(%caller, time, %a, %b, hits = found.len(), "Range query");
        Ok(found)
    }

    fn remove_variables(&self, entity: EntityId) {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| id.entity != entity);
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity);
        self.rollbacks.take(entity);
    }

    fn rollbacks(&self) -> &RollbackLedger {
        &self.rollbacks
    }

    fn report_local_time(&self, entity: EntityId, time: Time) {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity, time);
    }

    /// `min(last reported) - 1`, or `Time::MAX` once nothing is left to wait for.
    fn global_horizon(&self) -> KernelResult<Time> {
        let reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(reported
            .values()
            .min()
            .map_or(Time::MAX, |min| min.saturating_sub(1)))
    }

    fn request_horizon(&self) -> KernelResult<()> {
        Ok(())
    }

    fn initialize(&self, _data_dir: &Path) -> KernelResult<()> {
        Ok(())
    }

    fn owns(&self, _entity: EntityId) -> bool {
        true
    }

    fn role(&self) -> Role {
        Role::Worker
    }
}
