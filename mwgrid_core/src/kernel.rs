//! The kernel context: one simulation's store, clock, configuration and
//! registration buffers.
//!
//! There is no global kernel. A [`Kernel`] is created once per simulation
//! and handed (as an `Arc`) to the [`Scheduler`](crate::Scheduler); agents
//! keep a weak handle to it so they can spawn and destroy peers.
//!
//! # Usage
//!
//! ```ignore
//! use mwgrid_core::{Kernel, KernelConfig, Scheduler};
//!
//! let kernel = Kernel::sequential(KernelConfig::new(100));
//! kernel.spawn(1, MyBehavior::default())?;
//! kernel.register_listener(Arc::new(MyListener));
//!
//! let scheduler = Scheduler::new(kernel);
//! scheduler.start()?;
//! let summary = scheduler.join()?;
//! ```

use crate::agent::{Agent, Behavior, SimObject};
use crate::distributed_store::DistributedStore;
use crate::error::KernelResult;
use crate::sequential_store::SequentialStore;
use crate::shared_store::SharedStore;
use mwgrid_env::{EntityId, KernelContext, SystemContext, Time, Transport, TransportConfig};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Local time every agent starts at (default: 0)
    pub start_time: Time,

    /// Last time unit agents step through
    pub end_time: Time,

    /// Rounds between periodic horizon requests (default: 10)
    pub horizon_interval: u32,

    /// Pause after probing once every agent is past `end_time` (default: 1s)
    pub convergence_pause: Duration,
}

impl KernelConfig {
    /// Creates a configuration running until `end_time`.
    pub fn new(end_time: Time) -> Self {
        Self {
            end_time,
            ..Default::default()
        }
    }

    pub fn with_start_time(mut self, start_time: Time) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_horizon_interval(mut self, rounds: u32) -> Self {
        self.horizon_interval = rounds.max(1);
        self
    }

    pub fn with_convergence_pause(mut self, pause: Duration) -> Self {
        self.convergence_pause = pause;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: 100,
            horizon_interval: 10,
            convergence_pause: Duration::from_millis(1000),
        }
    }
}

/// Receiver of agent reports.
pub trait ReportListener: Send + Sync {
    fn collect_report(&self, entity: EntityId, time: Time, report: &str);
}

/// Handle returned by [`Kernel::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registration changes waiting for the next round.
#[derive(Default)]
struct Registry {
    pending_add: Mutex<Vec<SimObject>>,
    pending_remove: Mutex<Vec<EntityId>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ReportListener>)>>,
    next_listener: AtomicU64,
}

/// One simulation's shared context.
pub struct Kernel {
    config: KernelConfig,
    store: Arc<dyn SharedStore>,
    context: Arc<dyn KernelContext>,
    registry: Registry,
    next_id: AtomicU64,
}

impl Kernel {
    /// Creates a kernel over an arbitrary store and context.
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn SharedStore>,
        context: Arc<dyn KernelContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            context,
            registry: Registry::default(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Single-process kernel on the system clock.
    pub fn sequential(config: KernelConfig) -> Arc<Self> {
        Self::new(config, Arc::new(SequentialStore::new()), SystemContext::shared())
    }

    /// Multi-process kernel delegating shared state to `transport`.
    pub fn distributed<T: Transport>(
        config: KernelConfig,
        transport: Arc<T>,
        transport_config: TransportConfig,
        context: Arc<dyn KernelContext>,
    ) -> Arc<Self> {
        let store = DistributedStore::new(transport, transport_config);
        Self::new(config, Arc::new(store), context)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<dyn KernelContext> {
        &self.context
    }

    /// Allocates the next entity id. Ids start at 1.
    pub fn next_entity_id(&self) -> EntityId {
        EntityId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========== AGENTS ==========

    /// Creates an agent driven by `behavior`.
    ///
    /// The agent's variables are registered immediately; it joins the
    /// scheduler's live set at the start of the next round.
    pub fn spawn(self: &Arc<Self>, class_id: i32, behavior: impl Behavior + 'static) -> KernelResult<EntityId> {
        self.spawn_boxed(class_id, Box::new(behavior))
    }

    pub fn spawn_boxed(self: &Arc<Self>, class_id: i32, mut behavior: Box<dyn Behavior>) -> KernelResult<EntityId> {
        let id = self.next_entity_id();
        let created = Agent::new(self, id, class_id).and_then(|mut agent| {
            behavior.setup(&mut agent)?;
            Ok(agent)
        });
        let agent = match created {
            Ok(agent) => agent,
            Err(e) => {
                // Shared variables registered before the failure must not outlive it
                self.store.remove_variables(id);
                debug!(entity = %id, class_id, error = %e, "Agent creation failed");
                return Err(e);
            }
        };
        debug!(entity = %id, class_id, "Agent created");
        lock(&self.registry.pending_add).push(SimObject::new(agent, behavior));
        Ok(id)
    }

    /// Queues an agent for removal at the start of the next round.
    pub fn destroy(&self, entity: EntityId) {
        debug!(%entity, "Agent destruction requested");
        lock(&self.registry.pending_remove).push(entity);
    }

    pub fn pending_additions(&self) -> usize {
        lock(&self.registry.pending_add).len()
    }

    pub fn pending_removals(&self) -> usize {
        lock(&self.registry.pending_remove).len()
    }

    /// Moves pending additions into `live`, then applies pending removals.
    ///
    /// Removed agents have their private store cleared and their shared
    /// variables dropped.
    pub(crate) fn flush_into(&self, live: &mut Vec<SimObject>) {
        let added = std::mem::take(&mut *lock(&self.registry.pending_add));
        let removed = std::mem::take(&mut *lock(&self.registry.pending_remove));
        if added.is_empty() && removed.is_empty() {
            return;
        }
        debug!(added = added.len(), removed = removed.len(), "Flushing registration buffers");
        live.extend(added);
        if removed.is_empty() {
            return;
        }
        live.retain_mut(|object| {
            if removed.contains(&object.id()) {
                object.agent.clear_private();
                false
            } else {
                true
            }
        });
        for entity in removed {
            self.store.remove_variables(entity);
        }
    }

    /// Prepares a multi-process run.
    ///
    /// Writes the bootstrap file (coordinator), brings the transport up and
    /// destroys every pending agent this process does not own.
    pub fn initialize(&self, data_dir: &Path) -> KernelResult<()> {
        self.store.initialize(data_dir)?;
        let mut pending = lock(&self.registry.pending_add);
        let before = pending.len();
        let mut foreign = Vec::new();
        pending.retain_mut(|object| {
            if self.store.owns(object.id()) {
                true
            } else {
                object.agent.clear_private();
                foreign.push(object.id());
                false
            }
        });
        drop(pending);
        for entity in &foreign {
            self.store.remove_variables(*entity);
        }
        info!(
            role = %self.store.role(),
            kept = before - foreign.len(),
            dropped = foreign.len(),
            "Kernel initialized"
        );
        Ok(())
    }

    // ========== LISTENERS ==========

    pub fn register_listener(&self, listener: Arc<dyn ReportListener>) -> ListenerId {
        let id = ListenerId(self.registry.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.registry.listeners).push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.registry.listeners);
        let before = listeners.len();
        listeners.retain(|(known, _)| *known != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry.listeners).len()
    }

    /// Snapshot of the registered listeners.
    pub(crate) fn listeners(&self) -> Vec<Arc<dyn ReportListener>> {
        lock(&self.registry.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::variable::kernel_vars;
    use mwgrid_env::{Location, Value};

    struct Quiet;

    impl Behavior for Quiet {
        fn step(&mut self, _agent: &mut Agent) -> KernelResult<()> {
            Ok(())
        }

        fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
            Ok(String::new())
        }
    }

    struct NullListener;

    impl ReportListener for NullListener {
        fn collect_report(&self, _entity: EntityId, _time: Time, _report: &str) {}
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let kernel = Kernel::sequential(KernelConfig::new(5));
        assert_eq!(kernel.spawn(1, Quiet).unwrap(), EntityId(1));
        assert_eq!(kernel.spawn(1, Quiet).unwrap(), EntityId(2));
        assert_eq!(kernel.pending_additions(), 2);
    }

    #[test]
    fn test_flush_applies_adds_then_removes() {
        let kernel = Kernel::sequential(KernelConfig::new(5));
        let a = kernel.spawn(1, Quiet).unwrap();
        let b = kernel.spawn(1, Quiet).unwrap();
        kernel.destroy(a);

        let mut live = Vec::new();
        kernel.flush_into(&mut live);
        assert_eq!(live.iter().map(SimObject::id).collect::<Vec<_>>(), vec![b]);
        assert_eq!(kernel.pending_additions(), 0);
        assert_eq!(kernel.pending_removals(), 0);
        assert!(kernel
            .store()
            .read(b, a, &kernel_vars::CLASS, 0)
            .is_err());
    }

    /// Registers a location, then fails.
    struct Stillborn;

    impl Behavior for Stillborn {
        fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
            agent.add_variable(&kernel_vars::LOCATION, Value::Location(Location::new(1, 1)))?;
            Err(KernelError::InvalidVariable {
                variable: kernel_vars::LOCATION.id,
                reason: "setup refused",
            })
        }

        fn step(&mut self, _agent: &mut Agent) -> KernelResult<()> {
            Ok(())
        }

        fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_failed_spawn_leaves_no_shared_state() {
        let kernel = Kernel::sequential(KernelConfig::new(5));
        let survivor = kernel.spawn(1, Quiet).unwrap();
        assert!(matches!(
            kernel.spawn(2, Stillborn),
            Err(KernelError::InvalidVariable { .. })
        ));
        assert_eq!(kernel.pending_additions(), 1);

        let store = kernel.store();
        let found = store
            .range_query(survivor, 0, Location::new(0, 0), Location::new(2, 2))
            .unwrap();
        assert!(found.is_empty());
        let ghost = EntityId(2);
        assert!(matches!(
            store.read(survivor, ghost, &kernel_vars::CLASS, 0),
            Err(KernelError::NotFound(_))
        ));
        assert!(matches!(
            store.read(survivor, ghost, &kernel_vars::MESSAGES, 0),
            Err(KernelError::NotFound(_))
        ));
        // The id is spent but the next spawn works normally
        assert_eq!(kernel.spawn(1, Quiet).unwrap(), EntityId(3));
    }

    #[test]
    fn test_listener_registration() {
        let kernel = Kernel::sequential(KernelConfig::new(5));
        let first = kernel.register_listener(Arc::new(NullListener));
        let second = kernel.register_listener(Arc::new(NullListener));
        assert_ne!(first, second);
        assert_eq!(kernel.listener_count(), 2);
        assert!(kernel.deregister_listener(first));
        assert!(!kernel.deregister_listener(first));
        assert_eq!(kernel.listeners().len(), 1);
    }

    #[test]
    fn test_config_builder() {
        let config = KernelConfig::new(50)
            .with_horizon_interval(0)
            .with_convergence_pause(Duration::ZERO)
            .with_start_time(0);
        assert_eq!(config.end_time, 50);
        assert_eq!(config.horizon_interval, 1);
        assert!(config.convergence_pause.is_zero());
    }
}
