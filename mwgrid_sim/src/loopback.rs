//! In-process transport: every rank lives on a thread of this process.
//!
//! One [`LoopbackCoordinator`] holds the shared cells for the whole
//! deployment. Each rank connects its own [`LoopbackTransport`] to it and
//! hands that to a `DistributedStore`, exactly as a rank would with a real
//! coordinator tree.
//!
//! ```text
//!   rank 0 (coordinator)     rank 1 (worker)       rank 2 (worker)
//!   ┌───────────────┐        ┌───────────────┐     ┌───────────────┐
//!   │ Kernel        │        │ Kernel        │     │ Kernel        │
//!   │ DistributedSt │        │ DistributedSt │     │ DistributedSt │
//!   └──────┬────────┘        └──────┬────────┘     └──────┬────────┘
//!          │ LoopbackTransport      │                     │
//!          └────────────┬───────────┴─────────────────────┘
//!               ┌───────▼─────────────┐
//!               │ LoopbackCoordinator │  cells, access times, horizon
//!               └─────────────────────┘
//! ```

use mwgrid_core::{kernel_vars, BootstrapPlan, Identifier, VersionedCell};
use mwgrid_env::{
    EntityId, Location, RollbackRequest, RollbackSink, Role, Time, Transport, TransportConfig,
    TransportError, Value, VariableId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// A period of a shared cell, tagged with the entity that wrote it.
type Period = (EntityId, Value);

#[derive(Default)]
struct CoordinatorState {
    cells: HashMap<Identifier, VersionedCell<Period>>,
    /// Local time implied by each entity's most recent access.
    last_access: HashMap<EntityId, Time>,
    horizon: Time,
}

/// Owner of the shared state for every rank in the process.
pub struct LoopbackCoordinator {
    config: TransportConfig,
    state: Mutex<CoordinatorState>,
    sinks: Mutex<HashMap<u32, Arc<dyn RollbackSink>>>,
    loaded: AtomicBool,
}

impl LoopbackCoordinator {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let horizon = config.start_time - 1;
        Arc::new(Self {
            config,
            state: Mutex::new(CoordinatorState {
                horizon,
                ..Default::default()
            }),
            sinks: Mutex::new(HashMap::new()),
            loaded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Loads the initial shared variables from the bootstrap file.
    fn load(&self, data_dir: &Path) -> Result<(), TransportError> {
        let plan = BootstrapPlan::read_from(data_dir)
            .map_err(|e| TransportError::bootstrap(e.to_string()))?;
        let start = self.config.start_time;
        let mut state = self.lock_state();
        for var in &plan.variables {
            let id = Identifier::new(var.entity, var.variable);
            state
                .cells
                .insert(id, VersionedCell::new(start, (var.entity, var.value.clone())));
            state.last_access.insert(var.entity, start);
        }
        info!(
            variables = plan.variables.len(),
            workers = plan.ownership.len(),
            "Loopback coordinator loaded bootstrap file"
        );
        drop(state);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Rolls `entity` back to before `time`.
    ///
    /// Every period the entity wrote at or after `time` is retracted and the
    /// owning rank is told to rewind. Returns false, doing nothing, if `time`
    /// is not above the current horizon.
    pub fn inject_rollback(&self, entity: EntityId, time: Time) -> bool {
        {
            let mut state = self.lock_state();
            if time <= state.horizon {
                return false;
            }
            for cell in state.cells.values_mut() {
                cell.retain_after(time - 1, |(writer, _)| *writer != entity);
            }
            let access = state.last_access.entry(entity).or_insert(time);
            *access = (*access).min(time);
        }
        let owner = self.config.owner_of(entity);
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&owner)
            .cloned();
        debug!(%entity, time, owner, "Injecting rollback");
        if let Some(sink) = sink {
            sink.record_rollback(RollbackRequest::new(entity, time));
        }
        true
    }

    /// Current horizon as of the last request.
    pub fn horizon(&self) -> Time {
        self.lock_state().horizon
    }

    fn attach(&self, rank: u32, sink: Arc<dyn RollbackSink>) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rank, sink);
    }

    /// Recomputes the horizon and fossil-collects every cell below it.
    fn refresh_horizon(&self) {
        let mut state = self.lock_state();
        let horizon = state
            .last_access
            .values()
            .min()
            .map_or(Time::MAX, |min| min.saturating_sub(1));
        if horizon > state.horizon {
            trace!(horizon, previous = state.horizon, "Horizon advanced");
            state.horizon = horizon;
            for cell in state.cells.values_mut() {
                cell.prune_below(horizon);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready(&self) -> Result<MutexGuard<'_, CoordinatorState>, TransportError> {
        if !self.is_loaded() {
            return Err(TransportError::NotInitialized);
        }
        Ok(self.lock_state())
    }
}

impl CoordinatorState {
    fn touch(&mut self, entity: EntityId, local_time: Time) {
        self.last_access.insert(entity, local_time);
    }
}

/// One rank's connection to a [`LoopbackCoordinator`].
pub struct LoopbackTransport {
    coordinator: Arc<LoopbackCoordinator>,
    rank: u32,
    role: Role,
}

impl LoopbackTransport {
    /// Connects `rank` to the coordinator.
    ///
    /// # Errors
    /// * `ConnectionError` - `rank` is outside the deployment
    pub fn connect(coordinator: Arc<LoopbackCoordinator>, rank: u32) -> Result<Self, TransportError> {
        let config = coordinator.config();
        if rank >= config.size() {
            return Err(TransportError::connection(format!(
                "rank {rank} outside deployment of {} ranks",
                config.size()
            )));
        }
        let role = config.role_of(rank);
        debug!(rank, %role, "Loopback transport connected");
        Ok(Self {
            coordinator,
            rank,
            role,
        })
    }

    pub fn coordinator(&self) -> &Arc<LoopbackCoordinator> {
        &self.coordinator
    }
}

impl Transport for LoopbackTransport {
    /// Rank 0 loads the bootstrap file; every other rank waits for it.
    fn initialize(&self, data_dir: &Path) -> Result<(), TransportError> {
        if self.rank == 0 {
            return self.coordinator.load(data_dir);
        }
        if !self.coordinator.is_loaded() {
            return Err(TransportError::NotInitialized);
        }
        Ok(())
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn role(&self) -> Role {
        self.role
    }

    fn attach_rollback_sink(&self, sink: Arc<dyn RollbackSink>) {
        self.coordinator.attach(self.rank, sink);
    }

    fn add(&self, entity: EntityId, variable: VariableId, value: &Value, time: Time) -> Result<bool, TransportError> {
        let mut state = self.coordinator.ready()?;
        let id = Identifier::new(entity, variable);
        if state.cells.contains_key(&id) {
            return Err(TransportError::AlreadyExists { entity, variable });
        }
        state.cells.insert(id, VersionedCell::new(time, (entity, value.clone())));
        state.last_access.entry(entity).or_insert(time);
        Ok(true)
    }

    fn read(&self, reader: EntityId, target: EntityId, variable: VariableId, time: Time) -> Result<Value, TransportError> {
        let mut state = self.coordinator.ready()?;
        let value = {
            let cell = state
                .cells
                .get(&Identifier::new(target, variable))
                .ok_or(TransportError::NotFound {
                    entity: target,
                    variable,
                })?;
            let (_, value) = cell.read(time).map_err(|_| TransportError::BeforeHistory {
                entity: target,
                variable,
                time,
            })?;
            value.clone()
        };
        state.touch(reader, time + 1);
        Ok(value)
    }

    fn write(
        &self,
        writer: EntityId,
        target: EntityId,
        variable: VariableId,
        value: &Value,
        time: Time,
    ) -> Result<bool, TransportError> {
        let mut state = self.coordinator.ready()?;
        let accepted = state
            .cells
            .get_mut(&Identifier::new(target, variable))
            .ok_or(TransportError::NotFound {
                entity: target,
                variable,
            })?
            .write(time, (writer, value.clone()));
        state.touch(writer, time);
        if !accepted {
            trace!(%writer, %target, variable, time, "Write conflict");
        }
        Ok(accepted)
    }

    fn range_query(
        &self,
        agent: EntityId,
        time: Time,
        a: Location,
        b: Location,
    ) -> Result<HashMap<EntityId, Location>, TransportError> {
        let mut state = self.coordinator.ready()?;
        let found = state
            .cells
            .iter()
            .filter(|(id, _)| id.variable == kernel_vars::LOCATION.id)
            .filter_map(|(id, cell)| {
                let (_, value) = cell.read(time).ok()?;
                let location = value.as_location()?;
                location.within(a, b).then_some((id.entity, location))
            })
            .collect();
        state.touch(agent, time + 1);
        Ok(found)
    }

    fn global_horizon(&self) -> Result<Time, TransportError> {
        Ok(self.coordinator.ready()?.horizon)
    }

    fn request_horizon(&self) -> Result<(), TransportError> {
        self.coordinator.ready()?;
        self.coordinator.refresh_horizon();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwgrid_core::{InitialVariable, RollbackLedger};

    fn deployment(dir: &Path) -> (Arc<LoopbackCoordinator>, LoopbackTransport, LoopbackTransport) {
        let config = TransportConfig::new(2, 1, 0, 10);
        let variables = [1u64, 2].into_iter().flat_map(|e| {
            [
                InitialVariable {
                    entity: EntityId(e),
                    variable: kernel_vars::CLASS.id,
                    value: Value::Int(1),
                },
                InitialVariable {
                    entity: EntityId(e),
                    variable: kernel_vars::LOCATION.id,
                    value: Value::Location(Location::new(e as i32, 0)),
                },
            ]
        });
        BootstrapPlan::build(&config, variables)
            .unwrap()
            .write_to(dir)
            .unwrap();
        let coordinator = LoopbackCoordinator::new(config);
        let rank0 = LoopbackTransport::connect(coordinator.clone(), 0).unwrap();
        let rank1 = LoopbackTransport::connect(coordinator.clone(), 1).unwrap();
        (coordinator, rank0, rank1)
    }

    #[test]
    fn test_connect_checks_rank() {
        let coordinator = LoopbackCoordinator::new(TransportConfig::new(2, 1, 0, 10));
        assert!(LoopbackTransport::connect(coordinator.clone(), 3).is_err());
        let worker = LoopbackTransport::connect(coordinator, 2).unwrap();
        assert_eq!(worker.role(), Role::Worker);
    }

    #[test]
    fn test_workers_wait_for_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, rank0, rank1) = deployment(dir.path());
        assert!(matches!(
            rank1.initialize(dir.path()),
            Err(TransportError::NotInitialized)
        ));
        assert!(matches!(
            rank1.read(EntityId(1), EntityId(2), kernel_vars::CLASS.id, 0),
            Err(TransportError::NotInitialized)
        ));
        rank0.initialize(dir.path()).unwrap();
        assert!(coordinator.is_loaded());
        rank1.initialize(dir.path()).unwrap();
        assert_eq!(
            rank1
                .read(EntityId(1), EntityId(2), kernel_vars::LOCATION.id, 0)
                .unwrap(),
            Value::Location(Location::new(2, 0))
        );
    }

    #[test]
    fn test_write_once_per_time() {
        let dir = tempfile::tempdir().unwrap();
        let (_, rank0, rank1) = deployment(dir.path());
        rank0.initialize(dir.path()).unwrap();
        let loc = Value::Location(Location::new(5, 5));
        assert!(rank1
            .write(EntityId(1), EntityId(1), kernel_vars::LOCATION.id, &loc, 1)
            .unwrap());
        assert!(!rank1
            .write(EntityId(2), EntityId(1), kernel_vars::LOCATION.id, &loc, 1)
            .unwrap());
        assert!(matches!(
            rank1.write(EntityId(1), EntityId(9), kernel_vars::LOCATION.id, &loc, 1),
            Err(TransportError::NotFound { .. })
        ));
    }

    #[test]
    fn test_range_query_reads_at_time() {
        let dir = tempfile::tempdir().unwrap();
        let (_, rank0, rank1) = deployment(dir.path());
        rank0.initialize(dir.path()).unwrap();
        rank1
            .write(
                EntityId(2),
                EntityId(2),
                kernel_vars::LOCATION.id,
                &Value::Location(Location::new(9, 9)),
                1,
            )
            .unwrap();
        let box_a = Location::new(0, 0);
        let box_b = Location::new(3, 3);
        assert_eq!(rank1.range_query(EntityId(1), 0, box_a, box_b).unwrap().len(), 2);
        let later = rank1.range_query(EntityId(1), 1, box_a, box_b).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[&EntityId(1)], Location::new(1, 0));
    }

    #[test]
    fn test_horizon_follows_slowest_entity() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, rank0, rank1) = deployment(dir.path());
        rank0.initialize(dir.path()).unwrap();
        assert_eq!(rank1.global_horizon().unwrap(), -1);

        // Entity 1 at local time 6, entity 2 at local time 3
        rank1.read(EntityId(1), EntityId(1), kernel_vars::CLASS.id, 5).unwrap();
        rank1.read(EntityId(2), EntityId(2), kernel_vars::CLASS.id, 2).unwrap();
        // Unchanged until requested
        assert_eq!(rank1.global_horizon().unwrap(), -1);
        rank1.request_horizon().unwrap();
        assert_eq!(coordinator.horizon(), 2);
        assert_eq!(rank0.global_horizon().unwrap(), 2);
    }

    #[test]
    fn test_inject_rollback_retracts_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, rank0, rank1) = deployment(dir.path());
        // Entity 1 belongs to rank 1
        let ledger = Arc::new(RollbackLedger::new());
        rank1.attach_rollback_sink(ledger.clone());
        rank0.initialize(dir.path()).unwrap();

        let var = kernel_vars::LOCATION.id;
        for t in 1..=4 {
            let loc = Value::Location(Location::new(t as i32 * 10, 0));
            assert!(rank1.write(EntityId(1), EntityId(1), var, &loc, t).unwrap());
        }
        assert!(coordinator.inject_rollback(EntityId(1), 3));
        assert_eq!(ledger.take(EntityId(1)), Some(3));

        assert_eq!(
            rank1.read(EntityId(2), EntityId(1), var, 10).unwrap(),
            Value::Location(Location::new(20, 0))
        );
        // Time 3 can be written again
        let loc = Value::Location(Location::new(31, 0));
        assert!(rank1.write(EntityId(1), EntityId(1), var, &loc, 3).unwrap());
    }

    #[test]
    fn test_inject_rollback_below_horizon_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, rank0, rank1) = deployment(dir.path());
        rank0.initialize(dir.path()).unwrap();
        rank1.read(EntityId(1), EntityId(1), kernel_vars::CLASS.id, 5).unwrap();
        rank1.read(EntityId(2), EntityId(2), kernel_vars::CLASS.id, 5).unwrap();
        rank1.request_horizon().unwrap();
        assert_eq!(coordinator.horizon(), 5);
        assert!(!coordinator.inject_rollback(EntityId(1), 5));
        assert!(coordinator.inject_rollback(EntityId(1), 6));
    }
}
