//! The round-based optimistic scheduler.
//!
//! One background thread drives every live agent of a [`Kernel`] through
//! repeated rounds:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ flush buffers│──►│  step pass   │──►│ report pass  │──►│ horizon pass │──►│ termination │
//! │ (add/remove) │   │ (per agent)  │   │(per listener)│   │ (fossil GC)  │   │    check    │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘   └──────┬──────┘
//!        ▲                                                                           │
//!        └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A rollback raised while stepping or reporting rewinds that agent only;
//! every other error stops the run and is returned from [`Scheduler::join`].

use crate::agent::SimObject;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use mwgrid_env::Time;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Name of the scheduler's background thread.
pub const SCHEDULER_THREAD: &str = "mwgrid-scheduler";

/// Lifecycle of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Counters collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Rounds executed
    pub rounds: u64,

    /// Successful calls to `step`
    pub steps: u64,

    /// Liveness pings of agents already past the end time
    pub pings: u64,

    /// Reports delivered to listeners
    pub reports: u64,

    /// Rollbacks applied
    pub rollbacks: u64,

    /// Pending rollbacks dropped because they lay in the agent's future
    pub stale_rollbacks: u64,

    /// Global horizon observed in the last round
    pub final_horizon: Time,
}

/// Drives a kernel's agents on a background thread.
pub struct Scheduler {
    kernel: Arc<Kernel>,
    state: Arc<Mutex<SchedulerState>>,
    stop_requested: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<KernelResult<RunSummary>>>>,
}

impl Scheduler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Starts the round loop.
    ///
    /// # Errors
    /// * `SchedulerError` - No listener is registered, no agent is pending,
    ///   or the scheduler already ran
    pub fn start(&self) -> KernelResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SchedulerState::Idle {
            return Err(KernelError::scheduler(format!("cannot start from state {state:?}")));
        }
        if self.kernel.listener_count() == 0 {
            return Err(KernelError::scheduler("no report listener registered"));
        }
        if self.kernel.pending_additions() == 0 {
            return Err(KernelError::scheduler("no agents to schedule"));
        }

        info!(
            end_time = self.kernel.config().end_time,
            agents = self.kernel.pending_additions(),
            "Scheduler starting"
        );
        let mut rounds = RoundLoop::new(Arc::clone(&self.kernel), Arc::clone(&self.stop_requested));
        let shared_state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name(SCHEDULER_THREAD.to_string())
            .spawn(move || {
                let result = rounds.run();
                *shared_state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Stopped;
                result
            })?;

        *state = SchedulerState::Running;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Asks the loop to stop after the current round.
    pub fn stop(&self) {
        debug!("Scheduler stop requested");
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the background thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for the loop to finish and returns its summary.
    pub fn join(&self) -> KernelResult<RunSummary> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| KernelError::scheduler("scheduler not running"))?;
        handle
            .join()
            .map_err(|_| KernelError::scheduler("scheduler thread panicked"))?
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the scheduler thread.
struct RoundLoop {
    kernel: Arc<Kernel>,
    stop_requested: Arc<AtomicBool>,
    live: Vec<SimObject>,
    summary: RunSummary,
    last_horizon: Time,
    rounds_since_request: u32,
}

impl RoundLoop {
    fn new(kernel: Arc<Kernel>, stop_requested: Arc<AtomicBool>) -> Self {
        let last_horizon = kernel.config().start_time;
        Self {
            kernel,
            stop_requested,
            live: Vec::new(),
            summary: RunSummary::default(),
            last_horizon,
            rounds_since_request: 0,
        }
    }

    fn run(&mut self) -> KernelResult<RunSummary> {
        while !self.stop_requested.load(Ordering::Acquire) {
            if let Err(e) = self.round() {
                error!(error = %e, round = self.summary.rounds, "Scheduler aborted");
                return Err(e);
            }
        }
        self.summary.final_horizon = self.last_horizon;
        info!(
            rounds = self.summary.rounds,
            steps = self.summary.steps,
            rollbacks = self.summary.rollbacks,
            horizon = self.last_horizon,
            "Scheduler stopped"
        );
        Ok(self.summary.clone())
    }

    fn round(&mut self) -> KernelResult<()> {
        self.summary.rounds += 1;
        self.kernel.flush_into(&mut self.live);
        self.step_pass()?;
        self.report_pass()?;
        self.horizon_pass()?;
        self.check_termination()
    }

    // ========== STEP ==========

    fn step_pass(&mut self) -> KernelResult<()> {
        let end_time = self.kernel.config().end_time;
        let store = Arc::clone(self.kernel.store());
        for object in &mut self.live {
            apply_pending_rollback(&self.kernel, object, &mut self.summary);
            object.agent.reset_rolled_back_flag();
            object.agent.increase_time();

            let now = object.agent.local_time();
            let outcome = if end_time.saturating_add(1) > now {
                trace!(entity = %object.id(), time = now, "Step");
                object.step().map(|_| self.summary.steps += 1)
            } else {
                object.agent.ping().map(|_| self.summary.pings += 1)
            };

            match outcome {
                Ok(()) => store.report_local_time(object.id(), object.agent.local_time()),
                Err(e) => handle_rollback_error(e, object, &mut self.summary)?,
            }
        }
        Ok(())
    }

    // ========== REPORT ==========

    fn report_pass(&mut self) -> KernelResult<()> {
        let end_time = self.kernel.config().end_time;
        let store = Arc::clone(self.kernel.store());
        for listener in self.kernel.listeners() {
            for object in &mut self.live {
                apply_pending_rollback(&self.kernel, object, &mut self.summary);
                let rolled_back = object.agent.reset_rolled_back_flag();
                let now = object.agent.local_time();
                if !rolled_back && end_time.saturating_add(1) > now {
                    match object.report() {
                        Ok(report) => {
                            listener.collect_report(object.id(), now, &report);
                            self.summary.reports += 1;
                        }
                        Err(e) => {
                            handle_rollback_error(e, object, &mut self.summary)?;
                            // Picked up again next round rather than skipped
                            object.agent.reset_rolled_back_flag();
                            continue;
                        }
                    }
                } else {
                    trace!(entity = %object.id(), time = now, "Report skipped");
                }
                store.report_local_time(object.id(), object.agent.local_time());
            }
        }
        Ok(())
    }

    // ========== HORIZON ==========

    fn horizon_pass(&mut self) -> KernelResult<()> {
        let horizon = self.kernel.store().global_horizon()?;
        if horizon == self.last_horizon {
            return Ok(());
        }
        trace!(horizon, previous = self.last_horizon, "Horizon moved");
        let floor = horizon.saturating_sub(1);
        for object in &mut self.live {
            object.agent.advance_to_horizon(floor);
        }
        Ok(())
    }

    fn check_termination(&mut self) -> KernelResult<()> {
        let config = self.kernel.config();
        let store = self.kernel.store();

        self.rounds_since_request += 1;
        if self.rounds_since_request >= config.horizon_interval {
            self.rounds_since_request = 0;
            store.request_horizon()?;
        }

        let lowest = self
            .live
            .iter()
            .map(|object| object.agent.local_time())
            .min()
            .unwrap_or(Time::MAX);
        if lowest > config.end_time {
            store.request_horizon()?;
            self.kernel.context().sleep(config.convergence_pause);
        }

        self.last_horizon = store.global_horizon()?;
        if self.last_horizon >= config.end_time {
            debug!(horizon = self.last_horizon, end_time = config.end_time, "Horizon reached end time");
            self.stop_requested.store(true, Ordering::Release);
        }
        Ok(())
    }
}

/// Rewinds `object` if a rollback is pending for it.
///
/// A pending time later than the agent's local time concerns work it has not
/// done yet and is dropped.
fn apply_pending_rollback(kernel: &Kernel, object: &mut SimObject, summary: &mut RunSummary) {
    let Some(time) = kernel.store().take_pending_rollback(object.id()) else {
        return;
    };
    let now = object.agent.local_time();
    if time <= now {
        debug!(entity = %object.id(), from = now, to = time - 1, "Applying pending rollback");
        object.agent.rollback(time - 1);
        summary.rollbacks += 1;
    } else {
        warn!(entity = %object.id(), time, local_time = now, "Ignoring rollback into the future");
        summary.stale_rollbacks += 1;
    }
}

/// Rewinds `object` for a rollback raised by its own step or report;
/// any other error is returned.
fn handle_rollback_error(error: KernelError, object: &mut SimObject, summary: &mut RunSummary) -> KernelResult<()> {
    let Some(request) = error.rollback_request() else {
        return Err(error);
    };
    let now = object.agent.local_time();
    if request.time <= now {
        debug!(entity = %object.id(), from = now, to = request.time - 1, "Rollback after conflict");
        object.agent.rollback(request.time - 1);
        summary.rollbacks += 1;
    } else {
        summary.stale_rollbacks += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, Behavior};
    use crate::kernel::{KernelConfig, ReportListener};
    use crate::variable::Variable;
    use mwgrid_env::{EntityId, Value, ValueType};
    use std::time::Duration;

    const COUNTER: Variable = Variable::public(20, "COUNTER", ValueType::Int);

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<Vec<(EntityId, Time, String)>>,
    }

    impl Recorder {
        fn times(&self, entity: EntityId) -> Vec<Time> {
            self.reports
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _, _)| *e == entity)
                .map(|(_, t, _)| *t)
                .collect()
        }
    }

    impl ReportListener for Recorder {
        fn collect_report(&self, entity: EntityId, time: Time, report: &str) {
            self.reports.lock().unwrap().push((entity, time, report.to_string()));
        }
    }

    struct Ticker;

    impl Behavior for Ticker {
        fn step(&mut self, _agent: &mut Agent) -> KernelResult<()> {
            Ok(())
        }

        fn report(&mut self, agent: &mut Agent) -> KernelResult<String> {
            Ok(format!("tick {}", agent.local_time()))
        }
    }

    fn config(end_time: Time) -> KernelConfig {
        KernelConfig::new(end_time).with_convergence_pause(Duration::ZERO)
    }

    #[test]
    fn test_start_requires_listener_and_agents() {
        let kernel = Kernel::sequential(config(5));
        let scheduler = Scheduler::new(Arc::clone(&kernel));
        kernel.spawn(1, Ticker).unwrap();
        assert!(matches!(scheduler.start(), Err(KernelError::SchedulerError(_))));

        let kernel = Kernel::sequential(config(5));
        kernel.register_listener(Arc::new(Recorder::default()));
        let scheduler = Scheduler::new(kernel);
        assert!(matches!(scheduler.start(), Err(KernelError::SchedulerError(_))));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_join_without_start_fails() {
        let scheduler = Scheduler::new(Kernel::sequential(config(5)));
        assert!(scheduler.join().is_err());
        assert!(!scheduler.is_alive());
    }

    #[test]
    fn test_runs_to_end_time() {
        let kernel = Kernel::sequential(config(10));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        let id = kernel.spawn(1, Ticker).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        let summary = scheduler.join().unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(summary.steps, 10);
        assert_eq!(summary.pings, 1);
        assert_eq!(summary.rounds, 11);
        assert_eq!(summary.final_horizon, 10);
        assert_eq!(recorder.times(id), (1..=10).collect::<Vec<_>>());
        assert_eq!(recorder.reports.lock().unwrap()[0].2, "tick 1");
    }

    #[test]
    fn test_end_time_one() {
        let kernel = Kernel::sequential(config(1));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        let id = kernel.spawn(1, Ticker).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        let summary = scheduler.join().unwrap();
        assert_eq!(summary.steps, 1);
        assert_eq!(recorder.times(id), vec![1]);
    }

    #[test]
    fn test_every_listener_gets_every_report() {
        let kernel = Kernel::sequential(config(3));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        kernel.register_listener(first.clone());
        kernel.register_listener(second.clone());
        let a = kernel.spawn(1, Ticker).unwrap();
        let b = kernel.spawn(1, Ticker).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        let summary = scheduler.join().unwrap();
        assert_eq!(summary.reports, 12);
        for recorder in [&first, &second] {
            assert_eq!(recorder.times(a), vec![1, 2, 3]);
            assert_eq!(recorder.times(b), vec![1, 2, 3]);
        }
    }

    /// Writes a shared counter at `at`, on its first attempt only.
    struct Poker {
        target: Option<EntityId>,
        at: Time,
        attempts: u32,
    }

    impl Poker {
        fn new(target: Option<EntityId>, at: Time) -> Self {
            Self { target, at, attempts: 0 }
        }
    }

    impl Behavior for Poker {
        fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
            agent.add_variable(&COUNTER, Value::Int(0))
        }

        fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
            if agent.local_time() != self.at || self.attempts > 0 {
                return Ok(());
            }
            self.attempts += 1;
            match self.target {
                Some(target) => agent.set_of(target, &COUNTER, Value::Int(1)),
                None => agent.set(&COUNTER, Value::Int(2)),
            }
        }

        fn report(&mut self, agent: &mut Agent) -> KernelResult<String> {
            Ok(agent.rollbacks().to_string())
        }
    }

    #[test]
    fn test_conflict_rewinds_only_the_loser() {
        let kernel = Kernel::sequential(config(6));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        // Stepped first, so its write at t = 3 wins
        let owner = kernel.spawn(1, Poker::new(None, 3)).unwrap();
        let loser = kernel.spawn(1, Poker::new(Some(owner), 3)).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        let summary = scheduler.join().unwrap();

        assert_eq!(summary.rollbacks, 1);
        assert_eq!(summary.steps, 12);
        assert_eq!(recorder.times(owner), (1..=6).collect::<Vec<_>>());
        assert_eq!(recorder.times(loser), (1..=6).collect::<Vec<_>>());
        let loser_reports: Vec<String> = recorder
            .reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| *e == loser)
            .map(|(_, _, r)| r.clone())
            .collect();
        assert_eq!(loser_reports, vec!["0", "0", "1", "1", "1", "1"]);
    }

    /// Writes its own counter at every time unit but fails once at `fail_at`
    /// with a conflict, as if another writer had been first.
    struct Flaky {
        fail_at: Time,
        failed: bool,
        executed: Arc<Mutex<Vec<Time>>>,
    }

    impl Behavior for Flaky {
        fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
            let now = agent.local_time();
            self.executed.lock().unwrap().push(now);
            if now == self.fail_at && !self.failed {
                self.failed = true;
                return Err(KernelError::Rollback(mwgrid_env::RollbackRequest::new(agent.id(), now)));
            }
            Ok(())
        }

        fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_rollback_reexecutes_same_time() {
        let kernel = Kernel::sequential(config(5));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        let executed = Arc::new(Mutex::new(Vec::new()));
        let id = kernel
            .spawn(1, Flaky {
                fail_at: 3,
                failed: false,
                executed: executed.clone(),
            })
            .unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        let summary = scheduler.join().unwrap();

        assert_eq!(*executed.lock().unwrap(), vec![1, 2, 3, 3, 4, 5]);
        assert_eq!(summary.rollbacks, 1);
        assert_eq!(summary.steps, 5);
        // No report for the failed attempt
        assert_eq!(recorder.times(id), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_pending_rollback_applied_before_step() {
        let kernel = Kernel::sequential(config(4));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        let id = kernel.spawn(1, Ticker).unwrap();
        // Recorded ahead of the agent: dropped on the first round
        kernel.store().record_rollback(id, 7);

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        let summary = scheduler.join().unwrap();
        assert_eq!(summary.stale_rollbacks, 1);
        assert_eq!(summary.rollbacks, 0);
        assert_eq!(recorder.times(id), vec![1, 2, 3, 4]);
    }

    struct Fatal;

    impl Behavior for Fatal {
        fn step(&mut self, _agent: &mut Agent) -> KernelResult<()> {
            Err(KernelError::codec("corrupt mailbox"))
        }

        fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_fatal_error_stops_run() {
        let kernel = Kernel::sequential(config(5));
        kernel.register_listener(Arc::new(Recorder::default()));
        kernel.spawn(1, Fatal).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.join(), Err(KernelError::CodecError(_))));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    /// Spawns one child per step until `remaining` reaches zero.
    struct Parent {
        remaining: u32,
    }

    impl Behavior for Parent {
        fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
            if self.remaining > 0 {
                self.remaining -= 1;
                agent.spawn(2, Ticker)?;
            }
            Ok(())
        }

        fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
            Ok(self.remaining.to_string())
        }
    }

    #[test]
    fn test_spawned_agents_join_next_round() {
        let kernel = Kernel::sequential(config(5));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        kernel.spawn(1, Parent { remaining: 2 }).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        scheduler.join().unwrap();

        // Children start at time 0 and catch up from time 1
        assert_eq!(recorder.times(EntityId(2)), vec![1, 2, 3, 4, 5]);
        assert_eq!(recorder.times(EntityId(3)), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stop_interrupts_long_run() {
        let kernel = Kernel::sequential(config(Time::MAX - 1));
        kernel.register_listener(Arc::new(Recorder::default()));
        kernel.spawn(1, Ticker).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.stop();
        let summary = scheduler.join().unwrap();
        assert!(summary.rounds >= 1);
        assert!(!scheduler.is_alive());
    }

    #[test]
    fn test_unbounded_end_time_keeps_stepping() {
        let kernel = Kernel::sequential(config(Time::MAX));
        let recorder = Arc::new(Recorder::default());
        kernel.register_listener(recorder.clone());
        let id = kernel.spawn(1, Ticker).unwrap();

        let scheduler = Scheduler::new(kernel);
        scheduler.start().unwrap();
        for _ in 0..5000 {
            if recorder.times(id).len() >= 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop();
        let summary = scheduler.join().unwrap();
        assert!(summary.steps >= 3);
        assert_eq!(summary.pings, 0);
        assert_eq!(recorder.times(id)[..3], [1, 2, 3]);
    }
}
