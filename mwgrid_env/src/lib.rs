//! mwgrid Environment Abstraction Layer
//!
//! This crate holds everything the simulation kernel needs from the outside
//! world, so that the same kernel runs **in-process** (sequential store) and
//! **multi-process** (a transport delegating to remote coordinators).
//!
//! # Core Concept: The Transport Seam
//!
//! The kernel never talks to a network directly. Cross-process operations go
//! through the [`Transport`] trait:
//! - Shared-variable traffic (`read()`, `write()`, `range_query()`)
//! - Global time (`global_horizon()`, `request_horizon()`)
//! - Lifecycle (`initialize()`, `rank()`, `role()`)
//!
//! Rollbacks that the transport detects on its own are pushed back into the
//! kernel through a [`RollbackSink`].
//!
//! Time itself (`now()`, `sleep()`) is intercepted through [`KernelContext`]
//! so that simulated runs can advance a virtual clock instead of blocking.
//!
//! # Example
//!
//! ```ignore
//! use mwgrid_env::{Transport, TransportConfig};
//!
//! fn bootstrap<T: Transport>(transport: &T, data_dir: &Path) -> Result<(), TransportError> {
//!     transport.initialize(data_dir)?;
//!     println!("rank {} running as {}", transport.rank(), transport.role());
//!     Ok(())
//! }
//! ```

mod context;
mod error;
mod system_impl;
mod transport;
mod types;

pub use context::KernelContext;
pub use error::{ParseError, TransportError};
pub use system_impl::SystemContext;
pub use transport::{RollbackSink, Transport};
pub use types::{
    EntityId, Location, RollbackRequest, Role, Time, TransportConfig, Value, ValueType,
    VariableId,
};
