//! mwgrid Core - Optimistic Parallel Discrete-Event Simulation Kernel
//!
//! Agents advance their own local clocks and read each other's state one
//! time unit in the past. Conflicting writes roll the losing agent back and
//! the global horizon tells everyone which history is final.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Scheduler                        │
//! │   flush → step → report → horizon → termination      │
//! └──────────────┬────────────────────────┬──────────────┘
//!                │                        │
//!        ┌───────▼───────┐        ┌───────▼────────┐
//!        │    Agents     │        │ ReportListener │
//!        │ PrivateStore  │        └────────────────┘
//!        └───────┬───────┘
//!                │ reads at t-1, writes at t
//!        ┌───────▼──────────────────────────┐
//!        │ SharedStore                      │
//!        │  SequentialStore | Distributed   │
//!        └──────────────────────────────────┘
//! ```
//!
//! Everything a run needs hangs off one [`Kernel`]; there is no global state.

pub mod agent;
pub mod bootstrap;
pub mod distributed_store;
pub mod error;
pub mod kernel;
pub mod mailbox;
pub mod private_store;
pub mod scheduler;
pub mod sequential_store;
pub mod shared_store;
pub mod variable;
pub mod versioned;

// Re-export key types for convenience
pub use agent::{Agent, Behavior, SimObject};
pub use bootstrap::{BootstrapPlan, InitialVariable, PartitionBounds, BOOTSTRAP_FILE};
pub use distributed_store::DistributedStore;
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelConfig, ListenerId, ReportListener};
pub use mailbox::{Mailbox, Message, MessageHeader, Payload, EMPTY_MAILBOX};
pub use private_store::PrivateStore;
pub use scheduler::{RunSummary, Scheduler, SchedulerState};
pub use sequential_store::SequentialStore;
pub use shared_store::{Identifier, RollbackLedger, SharedStore};
pub use variable::{kernel_vars, Variable, Visibility};
pub use versioned::VersionedCell;

pub use mwgrid_env::{EntityId, Location, RollbackRequest, Role, Time, Value, ValueType, VariableId};
