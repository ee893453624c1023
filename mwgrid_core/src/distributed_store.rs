//! Shared store that delegates to a multi-process transport.
//!
//! Before initialization every process registers the full population
//! locally; the coordinator turns that registry into the bootstrap file.
//! After initialization, reads, writes, range queries and the horizon all
//! go through the transport.

use crate::bootstrap::{BootstrapPlan, InitialVariable};
use crate::error::{KernelError, KernelResult};
use crate::shared_store::{Identifier, RollbackLedger, SharedStore};
use crate::variable::Variable;
use mwgrid_env::{EntityId, Location, Role, Time, Transport, TransportConfig, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, trace};

/// Shared store backed by a [`Transport`].
pub struct DistributedStore<T: Transport> {
    transport: Arc<T>,
    config: TransportConfig,
    /// Initial values of every shared variable registered in this process.
    registry: RwLock<BTreeMap<Identifier, (Time, Value)>>,
    rollbacks: Arc<RollbackLedger>,
    initialized: AtomicBool,
}

impl<T: Transport> DistributedStore<T> {
    /// Wraps a connected transport and subscribes to its rollbacks.
    pub fn new(transport: Arc<T>, config: TransportConfig) -> Self {
        let rollbacks = Arc::new(RollbackLedger::new());
        transport.attach_rollback_sink(rollbacks.clone());
        Self {
            transport,
            config,
            registry: RwLock::new(BTreeMap::new()),
            rollbacks,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The bootstrap plan for everything registered so far.
    pub fn bootstrap_plan(&self) -> KernelResult<BootstrapPlan> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let variables = registry.iter().map(|(id, (_, value))| InitialVariable {
            entity: id.entity,
            variable: id.variable,
            value: value.clone(),
        });
        BootstrapPlan::build(&self.config, variables)
    }
}

impl<T: Transport> SharedStore for DistributedStore<T> {
    fn add(&self, entity: EntityId, variable: &Variable, initial: Value, time: Time) -> KernelResult<bool> {
        let id = Identifier::new(entity, variable.id);
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if registry.contains_key(&id) {
                return Err(KernelError::AlreadyExists(id));
            }
            registry.insert(id, (time, initial.clone()));
        }
        // Variables created mid-run are not in the bootstrap file.
        if self.is_initialized() {
            return Ok(self.transport.add(entity, variable.id, &initial, time)?);
        }
        Ok(true)
    }

    fn read(&self, reader: EntityId, target: EntityId, variable: &Variable, time: Time) -> KernelResult<Value> {
        trace!(%reader, %target, variable = variable.id, time, "Remote read");
        Ok(self.transport.read(reader, target, variable.id, time)?)
    }

    fn write(
        &self,
        writer: EntityId,
        target: EntityId,
        variable: &Variable,
        value: Value,
        time: Time,
    ) -> KernelResult<bool> {
        trace!(%writer, %target, variable = variable.id, time, "Remote write");
        Ok(self.transport.write(writer, target, variable.id, &value, time)?)
    }

    fn range_query(
        &self,
        caller: EntityId,
        time: Time,
        a: Location,
        b: Location,
    ) -> KernelResult<HashMap<EntityId, Location>> {
        Ok(self.transport.range_query(caller, time, a, b)?)
    }

    fn remove_variables(&self, entity: EntityId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| id.entity != entity);
        self.rollbacks.take(entity);
    }

    fn rollbacks(&self) -> &RollbackLedger {
        &self.rollbacks
    }

    /// The transport derives agent times from its own traffic.
    fn report_local_time(&self, _entity: EntityId, _time: Time) {}

    fn global_horizon(&self) -> KernelResult<Time> {
        Ok(self.transport.global_horizon()?)
    }

    fn request_horizon(&self) -> KernelResult<()> {
        Ok(self.transport.request_horizon()?)
    }

    /// Writes the bootstrap file (coordinator only), then brings the
    /// transport up.
    fn initialize(&self, data_dir: &Path) -> KernelResult<()> {
        if self.is_coordinator_role() {
            let plan = self.bootstrap_plan()?;
            let path = plan.write_to(data_dir)?;
            info!(
                path = %path.display(),
                variables = plan.variables.len(),
                "Bootstrap file written"
            );
        }
        self.transport.initialize(data_dir)?;
        self.initialized.store(true, Ordering::Release);
        debug!(rank = self.transport.rank(), role = %self.role(), "Transport initialized");
        Ok(())
    }

    fn owns(&self, entity: EntityId) -> bool {
        match self.role() {
            Role::Coordinator => false,
            Role::Worker => self.config.owner_of(entity) == self.transport.rank(),
        }
    }

    fn role(&self) -> Role {
        self.transport.role()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BOOTSTRAP_FILE;
    use crate::variable::kernel_vars::{CLASS, LOCATION};
    use mwgrid_env::{RollbackRequest, RollbackSink, TransportError, VariableId};
    use std::sync::Mutex;

    /// Transport double that records calls and replays scripted answers.
    #[derive(Default)]
    struct ScriptedTransport {
        rank: u32,
        sink: Mutex<Option<Arc<dyn RollbackSink>>>,
        writes: Mutex<Vec<(EntityId, EntityId, VariableId, Time)>>,
        adds: Mutex<Vec<(EntityId, VariableId)>>,
        reject_writes_at: Option<Time>,
        rollback_reads_at: Option<Time>,
        horizon: Time,
    }

    impl ScriptedTransport {
        fn push_rollback(&self, request: RollbackRequest) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.record_rollback(request);
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn initialize(&self, _data_dir: &Path) -> Result<(), TransportError> {
            Ok(())
        }

        fn rank(&self) -> u32 {
            self.rank
        }

        fn role(&self) -> Role {
            if self.rank == 0 {
                Role::Coordinator
            } else {
                Role::Worker
            }
        }

        fn attach_rollback_sink(&self, sink: Arc<dyn RollbackSink>) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn add(&self, entity: EntityId, variable: VariableId, _: &Value, _: Time) -> Result<bool, TransportError> {
            self.adds.lock().unwrap().push((entity, variable));
            Ok(true)
        }

        fn read(&self, reader: EntityId, _: EntityId, _: VariableId, time: Time) -> Result<Value, TransportError> {
            match self.rollback_reads_at {
                Some(t) if t == time => Err(TransportError::Rollback(RollbackRequest::new(reader, time))),
                _ => Ok(Value::Int(42)),
            }
        }

        fn write(
            &self,
            writer: EntityId,
            target: EntityId,
            variable: VariableId,
            _: &Value,
            time: Time,
        ) -> Result<bool, TransportError> {
            self.writes.lock().unwrap().push((writer, target, variable, time));
            Ok(self.reject_writes_at != Some(time))
        }

        fn range_query(
            &self,
            agent: EntityId,
            _: Time,
            a: Location,
            _: Location,
        ) -> Result<HashMap<EntityId, Location>, TransportError> {
            Ok(HashMap::from([(agent, a)]))
        }

        fn global_horizon(&self) -> Result<Time, TransportError> {
            Ok(self.horizon)
        }

        fn request_horizon(&self) -> Result<(), TransportError> {
            Err(TransportError::connection("horizon channel closed"))
        }
    }

    fn store(transport: ScriptedTransport) -> DistributedStore<ScriptedTransport> {
        DistributedStore::new(Arc::new(transport), TransportConfig::new(2, 1, 0, 10))
    }

    #[test]
    fn test_transport_rollbacks_reach_ledger() {
        let store = store(ScriptedTransport::default());
        store
            .transport()
            .push_rollback(RollbackRequest::new(EntityId(3), 8));
        store
            .transport()
            .push_rollback(RollbackRequest::new(EntityId(3), 5));
        assert!(store.has_pending_rollback(EntityId(3)));
        assert_eq!(store.take_pending_rollback(EntityId(3)), Some(5));
    }

    #[test]
    fn test_reads_and_writes_forward() {
        let store = store(ScriptedTransport {
            rank: 1,
            reject_writes_at: Some(4),
            rollback_reads_at: Some(6),
            horizon: 17,
            ..Default::default()
        });
        let (a, b) = (EntityId(1), EntityId(2));
        assert_eq!(store.read(a, b, &CLASS, 2).unwrap(), Value::Int(42));
        assert!(store.write(a, b, &CLASS, Value::Int(1), 3).unwrap());
        assert!(!store.write(a, b, &CLASS, Value::Int(1), 4).unwrap());
        assert_eq!(store.transport().writes.lock().unwrap().len(), 2);

        let err = store.read(a, b, &CLASS, 6).unwrap_err();
        assert_eq!(err.rollback_request(), Some(RollbackRequest::new(a, 6)));

        assert_eq!(store.global_horizon().unwrap(), 17);
        assert!(matches!(store.request_horizon(), Err(KernelError::Transport(_))));
        let hits = store
            .range_query(a, 1, Location::new(1, 1), Location::new(2, 2))
            .unwrap();
        assert_eq!(hits[&a], Location::new(1, 1));
    }

    #[test]
    fn test_add_is_local_until_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(ScriptedTransport {
            rank: 1,
            ..Default::default()
        });
        store.add(EntityId(1), &CLASS, Value::Int(0), 0).unwrap();
        assert!(matches!(
            store.add(EntityId(1), &CLASS, Value::Int(0), 0),
            Err(KernelError::AlreadyExists(_))
        ));
        assert!(store.transport().adds.lock().unwrap().is_empty());

        store.initialize(dir.path()).unwrap();
        // Workers do not write the bootstrap file
        assert!(!dir.path().join(BOOTSTRAP_FILE).exists());

        store
            .add(EntityId(5), &LOCATION, Value::Location(Location::new(0, 0)), 3)
            .unwrap();
        assert_eq!(*store.transport().adds.lock().unwrap(), vec![(EntityId(5), LOCATION.id)]);
    }

    #[test]
    fn test_coordinator_writes_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(ScriptedTransport::default());
        store.add(EntityId(1), &CLASS, Value::Int(2), 0).unwrap();
        store
            .add(EntityId(1), &LOCATION, Value::Location(Location::new(3, 4)), 0)
            .unwrap();
        store.initialize(dir.path()).unwrap();

        let plan = BootstrapPlan::read_from(dir.path()).unwrap();
        assert_eq!(plan.variables.len(), 2);
        assert_eq!(plan.ownership, vec![(1, 0), (2, 0)]);
        assert_eq!(plan.partitions[0].min, Location::new(3, 4));
    }

    #[test]
    fn test_ownership_by_rank() {
        let coordinator = store(ScriptedTransport::default());
        assert!(coordinator.is_coordinator_role());
        assert!(!coordinator.owns(EntityId(1)));

        let worker = store(ScriptedTransport {
            rank: 2,
            ..Default::default()
        });
        assert!(worker.is_worker_role());
        assert!(!worker.owns(EntityId(1)));
        assert!(worker.owns(EntityId(2)));
        assert!(worker.owns(EntityId(4)));
    }
}
