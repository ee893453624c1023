//! The shared variable space and the rollback ledger both stores use.
//!
//! # Architecture
//!
//! ```text
//!            Agent facade (reads at localTime-1, writes at localTime)
//!                               │
//!                    ┌──────────▼──────────┐
//!                    │  dyn SharedStore    │
//!                    └──────────┬──────────┘
//!             ┌─────────────────┴─────────────────┐
//!   ┌─────────▼─────────┐              ┌──────────▼──────────┐
//!   │  SequentialStore  │              │ DistributedStore<T> │
//!   │  cells in-process │              │  T: Transport       │
//!   └─────────┬─────────┘              └──────────┬──────────┘
//!             │        ┌────────────────┐         │
//!             └───────►│ RollbackLedger │◄────────┘ (also the transport's RollbackSink)
//!                      └────────────────┘
//! ```

use crate::error::KernelResult;
use crate::variable::Variable;
use mwgrid_env::{EntityId, Location, RollbackRequest, RollbackSink, Role, Time, Value, VariableId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Primary key of the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub entity: EntityId,
    pub variable: VariableId,
}

impl Identifier {
    pub fn new(entity: EntityId, variable: VariableId) -> Self {
        Self { entity, variable }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.variable)
    }
}

/// The shared, versioned variable space.
///
/// Implementations use interior mutability: the store is shared between the
/// scheduler thread and whichever threads create agents.
///
/// # Conflict signal
///
/// [`write`](SharedStore::write) returns `Ok(false)` when a value already
/// exists at exactly the requested time. Callers must turn that into a
/// [`KernelError::Rollback`](crate::KernelError::Rollback), never into a
/// returned failure.
pub trait SharedStore: Send + Sync {
    /// Registers a new shared cell holding `initial` from `time` on.
    ///
    /// # Returns
    /// * `Ok(true)` - The cell was created
    /// * `Err(KernelError::AlreadyExists)` - The identifier is taken
    fn add(&self, entity: EntityId, variable: &Variable, initial: Value, time: Time) -> KernelResult<bool>;

    /// Floor-reads `target`'s variable at `time` on behalf of `reader`.
    fn read(&self, reader: EntityId, target: EntityId, variable: &Variable, time: Time) -> KernelResult<Value>;

    /// Writes at exactly `time`. `Ok(false)` is the conflict signal.
    fn write(
        &self,
        writer: EntityId,
        target: EntityId,
        variable: &Variable,
        value: Value,
        time: Time,
    ) -> KernelResult<bool>;

    /// Every entity whose location at `time` lies in the closed box `a`..`b`.
    fn range_query(
        &self,
        caller: EntityId,
        time: Time,
        a: Location,
        b: Location,
    ) -> KernelResult<HashMap<EntityId, Location>>;

    /// Forgets every identifier of `entity`, along with its rollback and
    /// horizon bookkeeping.
    fn remove_variables(&self, entity: EntityId);

    /// The ledger of outstanding rollbacks.
    fn rollbacks(&self) -> &RollbackLedger;

    /// Records that `entity` must rewind to before `time` (keeps the minimum).
    fn record_rollback(&self, entity: EntityId, time: Time) {
        self.rollbacks().record(entity, time);
    }

    fn has_pending_rollback(&self, entity: EntityId) -> bool {
        self.rollbacks().contains(entity)
    }

    /// Reads and clears the pending rollback for `entity`.
    fn take_pending_rollback(&self, entity: EntityId) -> Option<Time> {
        self.rollbacks().take(entity)
    }

    /// Feeds the agent's local time into horizon bookkeeping.
    fn report_local_time(&self, entity: EntityId, time: Time);

    /// The global horizon: everything at or below it is final.
    fn global_horizon(&self) -> KernelResult<Time>;

    /// Asks for a fresh horizon computation.
    fn request_horizon(&self) -> KernelResult<()>;

    /// Prepares the store for a run (bootstrap file, transport bring-up).
    fn initialize(&self, data_dir: &Path) -> KernelResult<()>;

    /// Whether this process runs `entity`.
    fn owns(&self, entity: EntityId) -> bool;

    fn role(&self) -> Role;

    fn is_coordinator_role(&self) -> bool {
        self.role() == Role::Coordinator
    }

    fn is_worker_role(&self) -> bool {
        self.role() == Role::Worker
    }
}

/// Earliest outstanding rollback time per entity.
///
/// Also the [`RollbackSink`] handed to transports, so rollbacks arriving
/// asynchronously land in the same place as locally recorded ones.
#[derive(Debug, Default)]
pub struct RollbackLedger {
    pending: Mutex<HashMap<EntityId, Time>>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rollback, keeping the earliest time if one is already pending.
    pub fn record(&self, entity: EntityId, time: Time) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending
            .entry(entity)
            .and_modify(|t| *t = (*t).min(time))
            .or_insert(time);
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&entity)
    }

    pub fn take(&self, entity: EntityId) -> Option<Time> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RollbackSink for RollbackLedger {
    fn record_rollback(&self, request: RollbackRequest) {
        tracing::debug!(entity = %request.entity, time = request.time, "Rollback received from transport");
        self.record(request.entity, request.time);
    }
}
