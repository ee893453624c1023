//! End-to-end runs of the sequential kernel through its public API.

use mwgrid_core::{
    kernel_vars, Agent, Behavior, EntityId, Kernel, KernelConfig, KernelError, KernelResult,
    Location, Payload, ReportListener, Scheduler, Time, Value, ValueType, Variable,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COUNTER: Variable = Variable::public(30, "COUNTER", ValueType::Int);

#[derive(Default)]
struct Collector {
    reports: Mutex<BTreeMap<(EntityId, Time), String>>,
}

impl Collector {
    fn report(&self, entity: EntityId, time: Time) -> Option<String> {
        self.reports.lock().unwrap().get(&(entity, time)).cloned()
    }

    fn count(&self, entity: EntityId) -> usize {
        self.reports
            .lock()
            .unwrap()
            .keys()
            .filter(|(e, _)| *e == entity)
            .count()
    }
}

impl ReportListener for Collector {
    fn collect_report(&self, entity: EntityId, time: Time, report: &str) {
        self.reports
            .lock()
            .unwrap()
            .insert((entity, time), report.to_string());
    }
}

fn run(kernel: Arc<Kernel>) -> mwgrid_core::RunSummary {
    let scheduler = Scheduler::new(kernel);
    scheduler.start().unwrap();
    scheduler.join().unwrap()
}

fn config(end_time: Time) -> KernelConfig {
    KernelConfig::new(end_time).with_convergence_pause(Duration::ZERO)
}

/// Publishes its local time in COUNTER every step.
struct Clock;

impl Behavior for Clock {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        agent.add_variable(&COUNTER, Value::Int(0))
    }

    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let now = agent.local_time() as i32;
        agent.set(&COUNTER, Value::Int(now))
    }

    fn report(&mut self, agent: &mut Agent) -> KernelResult<String> {
        Ok(agent.local_time().to_string())
    }
}

/// Reads another agent's COUNTER every step.
struct Observer {
    target: EntityId,
    seen: i32,
}

impl Behavior for Observer {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        self.seen = agent.get_of(self.target, &COUNTER)?.as_int().unwrap_or(-1);
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        Ok(self.seen.to_string())
    }
}

#[test]
fn test_observers_see_previous_time_unit() {
    let kernel = Kernel::sequential(config(8));
    let collector = Arc::new(Collector::default());
    kernel.register_listener(collector.clone());
    // One observer is stepped before the clock in every round, one after
    let clock = EntityId(2);
    let early = kernel.spawn(2, Observer { target: clock, seen: -1 }).unwrap();
    assert_eq!(kernel.spawn(1, Clock).unwrap(), clock);
    let late = kernel.spawn(2, Observer { target: clock, seen: -1 }).unwrap();

    let summary = run(kernel);
    assert_eq!(summary.rollbacks, 0);
    for t in 1..=8 {
        let expected = (t - 1).to_string();
        assert_eq!(collector.report(early, t), Some(expected.clone()));
        assert_eq!(collector.report(late, t), Some(expected));
    }
}

/// Sends a signal to `peer` on even times and drains its own mailbox on odd ones.
struct Pinger {
    peer: EntityId,
    received: Vec<Time>,
}

impl Behavior for Pinger {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        if agent.local_time() % 2 == 0 {
            let message = agent.compose(self.peer, Payload::Signal);
            agent.send_message(message)
        } else {
            if let Some(message) = agent.get_message()? {
                self.received.push(message.send_time());
            }
            Ok(())
        }
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        Ok(format!("{:?}", self.received))
    }
}

#[test]
fn test_messages_arrive_one_step_later() {
    let kernel = Kernel::sequential(config(7));
    let collector = Arc::new(Collector::default());
    kernel.register_listener(collector.clone());
    let a = EntityId(1);
    let b = EntityId(2);
    kernel
        .spawn(1, Pinger {
            peer: b,
            received: Vec::new(),
        })
        .unwrap();
    kernel
        .spawn(1, Pinger {
            peer: a,
            received: Vec::new(),
        })
        .unwrap();

    let summary = run(kernel);
    assert_eq!(summary.rollbacks, 0);
    assert_eq!(collector.report(a, 7).as_deref(), Some("[2, 4, 6]"));
    assert_eq!(collector.report(b, 7).as_deref(), Some("[2, 4, 6]"));
}

/// Destroys itself at `at`.
struct Mayfly {
    at: Time,
}

impl Behavior for Mayfly {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        agent.add_variable(&kernel_vars::LOCATION, Value::Location(Location::new(0, 0)))
    }

    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        if agent.local_time() == self.at {
            agent.destroy();
        }
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        Ok(String::new())
    }
}

#[test]
fn test_destroyed_agent_leaves_next_round() {
    let kernel = Kernel::sequential(config(6));
    let collector = Arc::new(Collector::default());
    kernel.register_listener(collector.clone());
    let mayfly = kernel.spawn(3, Mayfly { at: 3 }).unwrap();
    let clock = kernel.spawn(1, Clock).unwrap();

    run(Arc::clone(&kernel));
    // Reported through the round it asked to leave in
    assert_eq!(collector.count(mayfly), 3);
    assert_eq!(collector.count(clock), 6);
    assert!(kernel
        .store()
        .read(clock, mayfly, &kernel_vars::LOCATION, 1)
        .is_err());
}

/// Follows a peer's location until the peer disappears.
struct Watcher {
    target: EntityId,
    last_seen: Option<Time>,
    gone_at: Option<Time>,
}

impl Watcher {
    fn new(target: EntityId) -> Self {
        Self {
            target,
            last_seen: None,
            gone_at: None,
        }
    }
}

impl Behavior for Watcher {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        if self.gone_at.is_some() {
            return Ok(());
        }
        match agent.get_of(self.target, &kernel_vars::LOCATION) {
            Ok(_) => self.last_seen = Some(agent.local_time()),
            Err(KernelError::NotFound(_)) => self.gone_at = Some(agent.local_time()),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        Ok(format!("{:?}/{:?}", self.last_seen, self.gone_at))
    }
}

#[test]
fn test_peer_destroyed_mid_round_visible_until_flush() {
    let kernel = Kernel::sequential(config(6));
    let collector = Arc::new(Collector::default());
    kernel.register_listener(collector.clone());
    // One watcher is stepped before the mayfly in every round, one after
    let mayfly = EntityId(2);
    let early = kernel.spawn(2, Watcher::new(mayfly)).unwrap();
    assert_eq!(kernel.spawn(3, Mayfly { at: 3 }).unwrap(), mayfly);
    let late = kernel.spawn(2, Watcher::new(mayfly)).unwrap();

    let summary = run(kernel);
    assert_eq!(summary.rollbacks, 0);
    for watcher in [early, late] {
        // Still readable for the rest of the round it left in
        assert_eq!(collector.report(watcher, 3).as_deref(), Some("Some(3)/None"));
        assert_eq!(collector.report(watcher, 4).as_deref(), Some("Some(3)/Some(4)"));
        assert_eq!(collector.report(watcher, 6).as_deref(), Some("Some(3)/Some(4)"));
    }
}

#[test]
fn test_run_without_any_agent_left_terminates() {
    let kernel = Kernel::sequential(config(50));
    kernel.register_listener(Arc::new(Collector::default()));
    kernel.spawn(3, Mayfly { at: 1 }).unwrap();

    let summary = run(kernel);
    assert_eq!(summary.steps, 1);
    assert_eq!(summary.final_horizon, Time::MAX);
}
