//! Scenario runner - builds kernels, runs them to completion and checks the
//! reports they produced.

use crate::behaviors::{
    classes, Beacon, BeaconReport, Claimant, ClaimReport, CourierReceiver, CourierReport,
    CourierSender, RandomWalker, Spawner, SpawnerReport, ValidationReport, ValidationWalker,
    WalkerReport,
};
use crate::context::SimContext;
use crate::error::{SimError, SimResult};
use crate::exporter::ReportLog;
use crate::loopback::{LoopbackCoordinator, LoopbackTransport};
use crate::scenarios::ScenarioId;

use mwgrid_core::{Kernel, KernelConfig, RunSummary, Scheduler, SequentialStore};
use mwgrid_env::{EntityId, KernelContext, Location, Time, TransportConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Entities that reported at least once
    pub final_entity_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Kernel counters, summed over worker ranks for distributed runs
    pub summary: RunSummary,
}

/// Everything a scenario produced before its checks are turned into a result.
struct Outcome {
    summary: RunSummary,
    log: ReportLog,
    failures: Vec<String>,
}

impl Outcome {
    fn new(summary: RunSummary, log: ReportLog) -> Self {
        Self {
            summary,
            log,
            failures: Vec::new(),
        }
    }

    fn check(&mut self, ok: bool, failure: impl FnOnce() -> String) {
        if !ok {
            self.failures.push(failure());
        }
    }

    /// Fails unless `entity` reported exactly the times `1..=end_time`.
    fn check_reported_every_step(&mut self, entity: EntityId, end_time: Time) {
        let times = self.log.times(entity);
        let expected: Vec<Time> = (1..=end_time).collect();
        self.check(times == expected, || {
            format!(
                "entity {} reported {} of {} time units",
                entity,
                times.len(),
                end_time
            )
        });
    }

    fn decode<T: serde::de::DeserializeOwned>(&mut self, entity: EntityId) -> Option<T> {
        let decoded = self.log.decode_latest(entity);
        self.check(decoded.is_some(), || format!("entity {} has no readable report", entity));
        decoded
    }
}

/// Runs kernel scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of agents
    num_agents: usize,

    /// Last time unit agents step through
    end_time: Time,

    /// Worker ranks for distributed scenarios
    workers: u32,

    /// Where distributed scenarios write the bootstrap file
    data_dir: Option<PathBuf>,

    context: Arc<SimContext>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self {
            seed,
            num_agents: num_agents.max(1),
            end_time: 20,
            workers: 2,
            data_dir: None,
            context: SimContext::shared(seed),
        }
    }

    /// Sets the end time.
    pub fn with_end_time(mut self, end_time: Time) -> Self {
        self.end_time = end_time.max(1);
        self
    }

    /// Sets the number of worker ranks.
    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the bootstrap directory (default: `$TMP/mwgrid/<seed>`).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn end_time(&self) -> Time {
        self.end_time
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_logged(scenario).0
    }

    /// Runs a scenario and also returns every report it delivered.
    pub fn run_logged(&self, scenario: ScenarioId) -> (ScenarioResult, ReportLog) {
        info!(
            "Starting scenario: {} (seed={}, agents={}, end_time={})",
            scenario.name(),
            self.seed,
            self.num_agents,
            self.end_time
        );

        let outcome = match scenario {
            ScenarioId::RandomWalk => self.run_random_walk(),
            ScenarioId::Validation => self.run_validation(),
            ScenarioId::Messaging => self.run_messaging(),
            ScenarioId::Spawning => self.run_spawning(),
            ScenarioId::Contention => self.run_contention(),
            ScenarioId::DistributedWalk => self.run_distributed_walk(),
        };

        match outcome {
            Ok(outcome) => {
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: outcome.failures.is_empty(),
                    final_entity_count: outcome.log.entities().len(),
                    failure_reason: outcome.failures.first().cloned(),
                    summary: outcome.summary,
                };
                if outcome.failures.len() > 1 {
                    debug!(failures = ?outcome.failures, "Scenario checks failed");
                }
                (result, outcome.log)
            }
            Err(e) => {
                error!("Scenario {} aborted: {}", scenario.name(), e);
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    final_entity_count: 0,
                    failure_reason: Some(e.to_string()),
                    summary: RunSummary::default(),
                };
                (result, ReportLog::new())
            }
        }
    }

    // ========== KERNEL SETUP ==========

    fn kernel_config(&self) -> KernelConfig {
        KernelConfig::new(self.end_time).with_horizon_interval(5)
    }

    fn context(&self) -> Arc<dyn KernelContext> {
        self.context.clone()
    }

    fn sequential_kernel(&self) -> Arc<Kernel> {
        Kernel::new(
            self.kernel_config(),
            Arc::new(SequentialStore::new()),
            self.context(),
        )
    }

    fn execute(kernel: Arc<Kernel>) -> SimResult<Outcome> {
        let mut log = ReportLog::new();
        kernel.register_listener(log.recorder());
        let scheduler = Scheduler::new(kernel);
        scheduler.start()?;
        let summary = scheduler.join()?;
        log.drain();
        debug!(?summary, reports = log.len(), "Run finished");
        Ok(Outcome::new(summary, log))
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir()
                .join("mwgrid")
                .join(self.seed.to_string())
        })
    }

    // ========== SCENARIOS ==========

    /// MW-001: walkers on a grid twice as wide as needed to seat them all.
    fn run_random_walk(&self) -> SimResult<Outcome> {
        let side = ((self.num_agents as f64).sqrt().ceil() as i32).max(1) * 2;
        let bounds = (Location::new(0, 0), Location::new(side - 1, side - 1));
        let kernel = self.sequential_kernel();
        let mut walkers = Vec::with_capacity(self.num_agents);
        for i in 0..self.num_agents {
            let slot = (i as i32) * 2;
            let start = Location::new(slot % side, (slot / side) * 2);
            let rng = self.context.derive_rng(i as u64 + 1);
            walkers.push(kernel.spawn(classes::WALKER, RandomWalker::new(rng, start, bounds))?);
        }

        let mut outcome = Self::execute(kernel)?;
        for walker in walkers {
            outcome.check_reported_every_step(walker, self.end_time);
            if let Some(report) = outcome.decode::<WalkerReport>(walker) {
                let at = Location::new(report.x, report.y);
                outcome.check(at.within(bounds.0, bounds.1), || {
                    format!("walker {} left the grid at {}", walker, at)
                });
                outcome.check(
                    i64::from(report.moves + report.blocked) == self.end_time,
                    || format!("walker {} missed steps", walker),
                );
            }
        }
        Ok(outcome)
    }

    /// MW-002: every read a lane walker makes must return its own past.
    fn run_validation(&self) -> SimResult<Outcome> {
        let kernel = self.sequential_kernel();
        let walkers = (0..self.num_agents)
            .map(|_| kernel.spawn(classes::VALIDATOR, ValidationWalker::new()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut outcome = Self::execute(kernel)?;
        let expected_reports = self.num_agents as u64 * self.end_time as u64;
        outcome.check(outcome.summary.reports == expected_reports, || {
            format!("expected {} reports", expected_reports)
        });
        for walker in walkers {
            self.check_validation(&mut outcome, walker);
        }
        Ok(outcome)
    }

    fn check_validation(&self, outcome: &mut Outcome, walker: EntityId) {
        outcome.check_reported_every_step(walker, self.end_time);
        if let Some(report) = outcome.decode::<ValidationReport>(walker) {
            outcome.check(report.violations == 0, || {
                format!("walker {} saw {} bad reads", walker, report.violations)
            });
        }
    }

    /// MW-003: one message per even time unit, each read one unit later.
    fn run_messaging(&self) -> SimResult<Outcome> {
        let kernel = self.sequential_kernel();
        let pairs = (self.num_agents / 2).max(1);
        let mut receivers = Vec::with_capacity(pairs);
        for _ in 0..pairs {
            // Ids are handed out in spawn order, so the receiver is next
            let sender = EntityId(kernel.pending_additions() as u64 + 1);
            let receiver = EntityId(sender.as_u64() + 1);
            kernel.spawn(classes::SENDER, CourierSender::new(receiver))?;
            kernel.spawn(classes::RECEIVER, CourierReceiver::new(sender))?;
            receivers.push(receiver);
        }

        let mut outcome = Self::execute(kernel)?;
        let expected = ((self.end_time - 1) / 2) as u32;
        for receiver in receivers {
            if let Some(report) = outcome.decode::<CourierReport>(receiver) {
                outcome.check(report.received == expected && report.mismatched == 0, || {
                    format!(
                        "receiver {} got {} messages ({} mismatched), expected {}",
                        receiver, report.received, report.mismatched, expected
                    )
                });
            }
        }
        Ok(outcome)
    }

    /// MW-004: children join at time 0 and catch up with their parent.
    fn run_spawning(&self) -> SimResult<Outcome> {
        let kernel = self.sequential_kernel();
        let cap = self.num_agents as u32;
        let parent = kernel.spawn(classes::SPAWNER, Spawner::new(cap))?;

        let mut outcome = Self::execute(kernel)?;
        let expected = i64::from(cap).min(self.end_time);
        if let Some(report) = outcome.decode::<SpawnerReport>(parent) {
            outcome.check(i64::from(report.spawned) == expected, || {
                format!("spawner created {} children, expected {}", report.spawned, expected)
            });
        }
        for child in 0..expected {
            self.check_validation(&mut outcome, EntityId(parent.as_u64() + 1 + child as u64));
        }
        Ok(outcome)
    }

    /// MW-005: the second claimant loses every contested period.
    fn run_contention(&self) -> SimResult<Outcome> {
        const PERIOD: Time = 5;
        let kernel = self.sequential_kernel();
        let beacon = kernel.spawn(classes::BEACON, Beacon)?;
        let first = kernel.spawn(classes::CLAIMANT, Claimant::new(beacon, PERIOD))?;
        let second = kernel.spawn(classes::CLAIMANT, Claimant::new(beacon, PERIOD))?;

        let mut outcome = Self::execute(kernel)?;
        let contested = self.end_time / PERIOD;
        let rollbacks = outcome.summary.rollbacks;
        outcome.check(rollbacks == contested as u64, || {
            format!("expected {} rollbacks, saw {}", contested, rollbacks)
        });
        if let Some(report) = outcome.decode::<ClaimReport>(first) {
            outcome.check(i64::from(report.claims) == contested && report.losses == 0, || {
                format!("first claimant: {:?}", report)
            });
        }
        if let Some(report) = outcome.decode::<ClaimReport>(second) {
            outcome.check(report.claims == 0 && i64::from(report.losses) == contested, || {
                format!("second claimant: {:?}", report)
            });
        }
        if contested > 0 {
            if let Some(report) = outcome.decode::<BeaconReport>(beacon) {
                outcome.check(report.holder == first.as_u64() as i32, || {
                    format!("beacon held by {}", report.holder)
                });
            }
        }
        Ok(outcome)
    }

    /// MW-006: the validation walk over one coordinator and several workers.
    ///
    /// Every rank builds the full population in the same order, so entity
    /// ids agree everywhere. Rank 0 initializes first and publishes the
    /// bootstrap file; the workers then keep only the agents they own.
    fn run_distributed_walk(&self) -> SimResult<Outcome> {
        let transport_config = TransportConfig::new(self.workers, 1, 0, self.end_time);
        let data_dir = self.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let coordinator = LoopbackCoordinator::new(transport_config);

        let rank0 = self.rank_kernel(&coordinator, 0)?;
        rank0.initialize(&data_dir)?;
        info!(
            workers = self.workers,
            data_dir = %data_dir.display(),
            "Coordinator published bootstrap file"
        );

        let mut log = ReportLog::new();
        let mut schedulers = Vec::with_capacity(self.workers as usize);
        for rank in 1..=self.workers {
            let kernel = self.rank_kernel(&coordinator, rank)?;
            kernel.initialize(&data_dir)?;
            if kernel.pending_additions() == 0 {
                debug!(rank, "Worker owns no agents, not scheduling it");
                continue;
            }
            kernel.register_listener(log.recorder());
            schedulers.push((rank, Scheduler::new(kernel)));
        }
        for (_, scheduler) in &schedulers {
            scheduler.start()?;
        }

        let mut summary = RunSummary {
            final_horizon: Time::MAX,
            ..Default::default()
        };
        for (rank, scheduler) in &schedulers {
            let worker = scheduler.join().map_err(|e| {
                error!(rank, "Worker rank failed: {}", e);
                SimError::WorkerFailed(*rank)
            })?;
            merge_summary(&mut summary, &worker);
        }
        log.drain();
        debug!(?summary, horizon = coordinator.horizon(), "Distributed run finished");

        let mut outcome = Outcome::new(summary, log);
        for id in 1..=self.num_agents as u64 {
            self.check_validation(&mut outcome, EntityId(id));
        }
        Ok(outcome)
    }

    fn rank_kernel(&self, coordinator: &Arc<LoopbackCoordinator>, rank: u32) -> SimResult<Arc<Kernel>> {
        let transport = Arc::new(LoopbackTransport::connect(coordinator.clone(), rank)?);
        let kernel = Kernel::distributed(
            self.kernel_config(),
            transport,
            *coordinator.config(),
            self.context(),
        );
        for _ in 0..self.num_agents {
            kernel.spawn(classes::VALIDATOR, ValidationWalker::new())?;
        }
        Ok(kernel)
    }
}

/// Adds one worker's counters into the deployment total.
fn merge_summary(total: &mut RunSummary, worker: &RunSummary) {
    total.rounds = total.rounds.max(worker.rounds);
    total.steps += worker.steps;
    total.pings += worker.pings;
    total.reports += worker.reports;
    total.rollbacks += worker.rollbacks;
    total.stale_rollbacks += worker.stale_rollbacks;
    total.final_horizon = total.final_horizon.min(worker.final_horizon);
}
