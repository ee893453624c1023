//! Agents: one identity, one local clock, one private store.
//!
//! An [`Agent`] is the facade behavior code programs against. It enforces
//! the causal protocol of the kernel:
//!
//! - private variables are read and written at `local_time`
//! - shared variables are read at `local_time - 1` and written at `local_time`
//! - a rejected shared write becomes [`KernelError::Rollback`]
//!
//! The behavior itself implements [`Behavior`]; the scheduler owns both as
//! a [`SimObject`].

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mailbox::{Mailbox, Message, Payload, EMPTY_MAILBOX};
use crate::private_store::PrivateStore;
use crate::shared_store::SharedStore;
use crate::variable::{kernel_vars, Variable, Visibility};
use mwgrid_env::{EntityId, Location, RollbackRequest, Time, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Simulated behavior of an agent.
///
/// `step` and `report` may only fail with [`KernelError::Rollback`] in a
/// well-formed behavior; any other error aborts the run.
pub trait Behavior: Send {
    /// Registers the behavior's own variables. Called once, at local time 0.
    fn setup(&mut self, _agent: &mut Agent) -> KernelResult<()> {
        Ok(())
    }

    /// Advances the agent by one time unit.
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()>;

    /// Describes the agent's state at its current local time.
    fn report(&mut self, agent: &mut Agent) -> KernelResult<String>;
}

/// Per-entity state and the kernel-facing API behaviors use.
pub struct Agent {
    id: EntityId,
    class_id: i32,
    local_time: Time,
    rolled_back: bool,
    rollbacks: u64,
    private: PrivateStore,
    store: Arc<dyn SharedStore>,
    kernel: Weak<Kernel>,
}

impl Agent {
    /// Creates an agent and registers its built-in shared variables.
    pub(crate) fn new(kernel: &Arc<Kernel>, id: EntityId, class_id: i32) -> KernelResult<Self> {
        let mut agent = Self {
            id,
            class_id,
            local_time: kernel.config().start_time,
            rolled_back: false,
            rollbacks: 0,
            private: PrivateStore::new(),
            store: Arc::clone(kernel.store()),
            kernel: Arc::downgrade(kernel),
        };
        agent.add_variable(&kernel_vars::CLASS, Value::Int(class_id))?;
        agent.add_variable(&kernel_vars::MESSAGES, Value::Text(EMPTY_MAILBOX.to_string()))?;
        Ok(agent)
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn class_id(&self) -> i32 {
        self.class_id
    }

    pub fn local_time(&self) -> Time {
        self.local_time
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Number of rollbacks this agent has gone through.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    /// The owning kernel, if it is still alive.
    pub fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.upgrade()
    }

    pub fn private_store(&self) -> &PrivateStore {
        &self.private
    }

    // ========== VARIABLES ==========

    /// Registers a variable with its initial value at the current local time.
    pub fn add_variable(&mut self, variable: &Variable, value: Value) -> KernelResult<()> {
        variable.check(&value)?;
        match variable.visibility {
            Visibility::Private => self.private.add(variable.id, value, self.local_time),
            Visibility::Public => self
                .store
                .add(self.id, variable, value, self.local_time)
                .map(|_| ()),
        }
    }

    /// Reads one of this agent's own variables.
    pub fn get(&self, variable: &Variable) -> KernelResult<Value> {
        let value = match variable.visibility {
            Visibility::Private => self.private.get(variable.id, self.local_time)?.clone(),
            Visibility::Public => self.read_shared(self.id, variable)?,
        };
        variable.check(&value)?;
        Ok(value)
    }

    /// Reads another entity's public variable as of the previous time unit.
    pub fn get_of(&self, entity: EntityId, variable: &Variable) -> KernelResult<Value> {
        if entity == self.id {
            return self.get(variable);
        }
        if variable.visibility == Visibility::Private {
            return Err(KernelError::InvalidVariable {
                variable: variable.id,
                reason: "private variables cannot be read across entities",
            });
        }
        let value = self.read_shared(entity, variable)?;
        variable.check(&value)?;
        Ok(value)
    }

    /// Writes one of this agent's own variables at the current local time.
    pub fn set(&mut self, variable: &Variable, value: Value) -> KernelResult<()> {
        variable.check(&value)?;
        match variable.visibility {
            Visibility::Private => self.private.set(variable.id, value, self.local_time),
            Visibility::Public => self.write_shared(self.id, variable, value),
        }
    }

    /// Writes another entity's public variable at the current local time.
    pub fn set_of(&mut self, entity: EntityId, variable: &Variable, value: Value) -> KernelResult<()> {
        if entity == self.id {
            return self.set(variable, value);
        }
        if variable.visibility == Visibility::Private {
            return Err(KernelError::InvalidVariable {
                variable: variable.id,
                reason: "private variables cannot be written across entities",
            });
        }
        variable.check(&value)?;
        self.write_shared(entity, variable, value)
    }

    /// This agent's own location as of the previous time unit.
    pub fn location(&self) -> KernelResult<Location> {
        match self.get(&kernel_vars::LOCATION)? {
            Value::Location(location) => Ok(location),
            other => Err(KernelError::TypeMismatch {
                variable: kernel_vars::LOCATION.id,
                expected: kernel_vars::LOCATION.value_type,
                found: other.value_type(),
            }),
        }
    }

    // ========== SPATIAL QUERIES ==========

    /// Every entity located in the closed box `a`..`b` one time unit ago.
    pub fn range_query(&self, a: Location, b: Location) -> KernelResult<HashMap<EntityId, Location>> {
        self.store.range_query(self.id, self.local_time - 1, a, b)
    }

    /// Like [`range_query`](Self::range_query), restricted to one behavior
    /// class and optionally excluding one entity (usually the caller).
    pub fn range_query_class(
        &self,
        class_id: i32,
        exclude: Option<EntityId>,
        a: Location,
        b: Location,
    ) -> KernelResult<HashMap<EntityId, Location>> {
        let mut found = HashMap::new();
        for (entity, location) in self.range_query(a, b)? {
            if Some(entity) == exclude {
                continue;
            }
            if self.get_of(entity, &kernel_vars::CLASS)?.as_int() == Some(class_id) {
                found.insert(entity, location);
            }
        }
        Ok(found)
    }

    // ========== MAILBOX ==========

    /// Builds a message from this agent, stamped with the current local time.
    pub fn compose(&self, destination: EntityId, payload: Payload) -> Message {
        Message::new(destination, self.id, self.local_time, payload)
    }

    /// Appends `message` to its destination's mailbox.
    ///
    /// This is a shared write at the current local time and can conflict.
    pub fn send_message(&mut self, message: Message) -> KernelResult<()> {
        let destination = message.destination();
        let mut mailbox = self.read_mailbox(destination)?;
        mailbox.push(message);
        self.set_of(destination, &kernel_vars::MESSAGES, Value::Text(mailbox.encode()))
    }

    /// Pops the earliest message sent before the current local time.
    ///
    /// The trimmed mailbox is written back; a conflict on that write is
    /// returned as a rollback and the message is not consumed.
    pub fn get_message(&mut self) -> KernelResult<Option<Message>> {
        let mut mailbox = self.read_mailbox(self.id)?;
        let Some(message) = mailbox.pop_before(self.local_time) else {
            return Ok(None);
        };
        self.set(&kernel_vars::MESSAGES, Value::Text(mailbox.encode()))?;
        Ok(Some(message))
    }

    fn read_mailbox(&self, owner: EntityId) -> KernelResult<Mailbox> {
        match self.get_of(owner, &kernel_vars::MESSAGES)? {
            Value::Text(encoded) => Mailbox::decode(&encoded),
            _ => Ok(Mailbox::new()),
        }
    }

    // ========== LIFECYCLE ==========

    /// Creates a new agent in the same kernel. It joins the next round.
    pub fn spawn(&self, class_id: i32, behavior: impl Behavior + 'static) -> KernelResult<EntityId> {
        let kernel = self
            .kernel()
            .ok_or_else(|| KernelError::scheduler("kernel dropped"))?;
        kernel.spawn(class_id, behavior)
    }

    /// Queues this agent for removal at the start of the next round.
    pub fn destroy(&self) {
        if let Some(kernel) = self.kernel() {
            kernel.destroy(self.id);
        }
    }

    /// Rewinds private history and local time to `to_time`.
    ///
    /// Shared history is left untouched.
    pub fn rollback(&mut self, to_time: Time) {
        self.private.prune_above(to_time);
        self.local_time = to_time;
        self.rolled_back = true;
        self.rollbacks += 1;
    }

    /// Discards private history below `horizon`.
    pub fn advance_to_horizon(&mut self, horizon: Time) {
        if horizon < 1 {
            return;
        }
        self.private.prune_below(horizon);
    }

    /// Clears the rolled-back flag, returning its previous value.
    pub fn reset_rolled_back_flag(&mut self) -> bool {
        std::mem::take(&mut self.rolled_back)
    }

    pub(crate) fn increase_time(&mut self) {
        self.local_time += 1;
    }

    /// Liveness ping: a read-only shared access so a finished agent still
    /// takes part in conflict detection.
    pub(crate) fn ping(&self) -> KernelResult<i32> {
        let class = self.get(&kernel_vars::CLASS)?;
        Ok(class.as_int().unwrap_or(self.class_id))
    }

    pub(crate) fn clear_private(&mut self) {
        self.private.clear();
    }

    fn read_shared(&self, target: EntityId, variable: &Variable) -> KernelResult<Value> {
        self.store.read(self.id, target, variable, self.local_time - 1)
    }

    fn write_shared(&mut self, target: EntityId, variable: &Variable, value: Value) -> KernelResult<()> {
        match self.store.write(self.id, target, variable, value, self.local_time) {
            Ok(true) => Ok(()),
            Ok(false) => Err(KernelError::Rollback(RollbackRequest::new(self.id, self.local_time))),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("class_id", &self.class_id)
            .field("local_time", &self.local_time)
            .field("rolled_back", &self.rolled_back)
            .finish()
    }
}

/// An agent together with the behavior driving it.
pub struct SimObject {
    pub agent: Agent,
    pub behavior: Box<dyn Behavior>,
}

impl SimObject {
    pub fn new(agent: Agent, behavior: Box<dyn Behavior>) -> Self {
        Self { agent, behavior }
    }

    pub fn id(&self) -> EntityId {
        self.agent.id()
    }

    pub(crate) fn step(&mut self) -> KernelResult<()> {
        self.behavior.step(&mut self.agent)
    }

    pub(crate) fn report(&mut self) -> KernelResult<String> {
        self.behavior.report(&mut self.agent)
    }
}
