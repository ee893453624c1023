//! Transport abstraction for multi-process shared state.

use crate::error::TransportError;
use crate::types::{EntityId, Location, RollbackRequest, Role, Time, Value, VariableId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Abstraction for the process layer that owns shared variables remotely.
///
/// Construction is implementation-specific; implementations expose an
/// explicit, fallible `connect` taking a [`TransportConfig`](crate::TransportConfig),
/// followed by [`initialize`](Transport::initialize) once the bootstrap file
/// exists. Nothing happens at load time.
///
/// # Implementations
///
/// - **Production**: a binding to a PDES-MAS style coordinator tree
/// - **Simulation**: `LoopbackTransport` (mwgrid_sim), in-process
///
/// # Call Flow
///
/// ```text
/// Worker (agent)              Transport                 Coordinator
///   |                             |                          |
///   |-- read(t) ----------------->|-- request ------------->|
///   |                             |<-- value / rollback -----|
///   |<-- Ok(value) | Err(Rollback)|                          |
///   |                             |<-- async rollback -------|
///   |<-- RollbackSink::record ----|                          |
/// ```
///
/// Every call may block and every call may fail with
/// [`TransportError::Rollback`].
pub trait Transport: Send + Sync + 'static {
    /// Brings the transport up using the bootstrap file in `data_dir`.
    ///
    /// # Returns
    /// * `Ok(())` - Ready for traffic
    /// * `Err(TransportError::NotInitialized)` - A dependency (e.g. the coordinator) is not up
    fn initialize(&self, data_dir: &Path) -> Result<(), TransportError>;

    /// This process's rank.
    fn rank(&self) -> u32;

    /// This process's role.
    fn role(&self) -> Role;

    /// Registers the sink that receives rollbacks detected asynchronously.
    fn attach_rollback_sink(&self, sink: Arc<dyn RollbackSink>);

    /// Registers a shared variable created after initialization.
    ///
    /// # Returns
    /// * `Ok(true)` - The variable was added
    /// * `Err(TransportError::AlreadyExists)` - Identifier already registered
    fn add(
        &self,
        entity: EntityId,
        variable: VariableId,
        value: &Value,
        time: Time,
    ) -> Result<bool, TransportError>;

    /// Floor-reads `target`'s variable at `time` on behalf of `reader`.
    ///
    /// # Arguments
    /// * `reader` - The agent performing the read (charged with any rollback)
    /// * `target` - Owner of the variable
    /// * `variable` - Variable id
    /// * `time` - Read time (the reader's local time minus one)
    fn read(
        &self,
        reader: EntityId,
        target: EntityId,
        variable: VariableId,
        time: Time,
    ) -> Result<Value, TransportError>;

    /// Writes `value` at exactly `time`.
    ///
    /// # Returns
    /// * `Ok(true)` - Write accepted
    /// * `Ok(false)` - A write already exists at `time` (conflict)
    fn write(
        &self,
        writer: EntityId,
        target: EntityId,
        variable: VariableId,
        value: &Value,
        time: Time,
    ) -> Result<bool, TransportError>;

    /// All entities whose location at `time` lies in the closed box `a`..`b`.
    fn range_query(
        &self,
        agent: EntityId,
        time: Time,
        a: Location,
        b: Location,
    ) -> Result<HashMap<EntityId, Location>, TransportError>;

    /// The current global horizon as last computed by the transport.
    fn global_horizon(&self) -> Result<Time, TransportError>;

    /// Asks the transport to start a new horizon computation.
    fn request_horizon(&self) -> Result<(), TransportError>;
}

/// Receiver for rollbacks the transport detects outside of a read/write call.
///
/// The kernel's shared stores implement this with the same ledger the
/// scheduler consumes, so rollback handling does not depend on where the
/// conflict was detected.
pub trait RollbackSink: Send + Sync {
    /// Records that `request.entity` must rewind to before `request.time`.
    fn record_rollback(&self, request: RollbackRequest);
}
