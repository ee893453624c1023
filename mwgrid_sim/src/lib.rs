//! mwgrid Scenario Harness
//!
//! Runs the mwgrid kernel end to end: reference behaviors, named scenarios
//! with pass/fail checks, and an in-process loopback transport so the
//! distributed store can be exercised without a real coordinator tree.
//!
//! # Core Principle: Reproducible Runs
//!
//! Every source of variation is pinned to the master seed:
//! - **Time**: the kernel context runs on a virtual clock
//! - **Randomness**: each agent draws from a stream derived from the seed
//!   and its entity id, so every rank builds identical agents
//! - **Reports**: agents report JSON documents the runner can check
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌───────────────┐    ┌───────────────┐                     │
//! │  │ Kernel        │ .. │ Kernel        │  one per rank       │
//! │  │  + Scheduler  │    │  + Scheduler  │  (one if sequential)│
//! │  └──────┬────────┘    └──────┬────────┘                     │
//! │         │ reports            │                              │
//! │  ┌──────▼────────────────────▼──────┐                       │
//! │  │ ReportLog (crossbeam channel)    │                       │
//! │  └──────────────────────────────────┘                       │
//! │         │ shared state (distributed only)                   │
//! │  ┌──────▼──────────────┐                                    │
//! │  │ LoopbackCoordinator │                                    │
//! │  └─────────────────────┘                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mwgrid_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 8).with_end_time(50);
//! let result = runner.run(ScenarioId::Validation);
//! assert!(result.passed);
//! ```

pub mod behaviors;
mod context;
mod error;
mod exporter;
mod loopback;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use error::{SimError, SimResult};
pub use exporter::{ReportLog, ReportRecord, ReportRecorder, RunExport};
pub use loopback::{LoopbackCoordinator, LoopbackTransport};
pub use runner::{ScenarioResult, ScenarioRunner};
