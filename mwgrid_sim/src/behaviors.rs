//! Reference behaviors the scenarios are built from.
//!
//! Each behavior reports a small JSON document so runs can be checked (and
//! exported) without parsing free text.

use mwgrid_core::{kernel_vars, Agent, Behavior, KernelError, KernelResult, Payload, Variable};
use mwgrid_env::{EntityId, Location, Time, Value, ValueType};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Current holder of a beacon (an entity id, 0 when unclaimed).
pub const BEACON: Variable = Variable::public(10, "BEACON", ValueType::Int);

/// Messages a courier receiver has consumed.
pub const RECEIVED: Variable = Variable::private(11, "RECEIVED", ValueType::Int);

/// Behavior class ids, stored in each agent's CLASS variable.
pub mod classes {
    pub const WALKER: i32 = 1;
    pub const VALIDATOR: i32 = 2;
    pub const SENDER: i32 = 3;
    pub const RECEIVER: i32 = 4;
    pub const SPAWNER: i32 = 5;
    pub const BEACON: i32 = 6;
    pub const CLAIMANT: i32 = 7;
}

fn to_report<T: Serialize>(report: &T) -> KernelResult<String> {
    serde_json::to_string(report).map_err(|e| KernelError::codec(e.to_string()))
}

fn entity_int(entity: EntityId) -> i32 {
    entity.as_u64() as i32
}

// ========== RANDOM WALK ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkerReport {
    pub x: i32,
    pub y: i32,
    pub moves: u32,
    pub blocked: u32,
}

/// Moves to a random unoccupied 8-neighbour inside `bounds` every step.
pub struct RandomWalker {
    rng: ChaCha8Rng,
    position: Location,
    bounds: (Location, Location),
    moves: u32,
    blocked: u32,
}

impl RandomWalker {
    pub fn new(rng: ChaCha8Rng, start: Location, bounds: (Location, Location)) -> Self {
        Self {
            rng,
            position: start,
            bounds,
            moves: 0,
            blocked: 0,
        }
    }
}

impl Behavior for RandomWalker {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        agent.add_variable(&kernel_vars::LOCATION, Value::Location(self.position))?;
        agent.add_variable(&kernel_vars::PREVIOUS, Value::Location(self.position))
    }

    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let here = agent.location()?;
        let occupied = agent.range_query_class(
            classes::WALKER,
            Some(agent.id()),
            here.offset(-1, -1),
            here.offset(1, 1),
        )?;
        let (low, high) = self.bounds;
        let free: Vec<Location> = here
            .neighbours()
            .into_iter()
            .filter(|n| n.within(low, high))
            .filter(|n| !occupied.values().any(|o| o == n))
            .collect();

        let Some(&next) = free.choose(&mut self.rng) else {
            self.blocked += 1;
            trace!(entity = %agent.id(), %here, "Walker boxed in");
            return Ok(());
        };
        agent.set(&kernel_vars::PREVIOUS, Value::Location(here))?;
        agent.set(&kernel_vars::LOCATION, Value::Location(next))?;
        self.position = next;
        self.moves += 1;
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        to_report(&WalkerReport {
            x: self.position.x,
            y: self.position.y,
            moves: self.moves,
            blocked: self.blocked,
        })
    }
}

// ========== VALIDATION ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checked: u32,
    pub violations: u32,
}

/// Walks +1 along x from `(0, id - 1)` and checks its own history each step.
///
/// At local time `t` the shared location read must be `(t - 1, id - 1)` and
/// the private previous location `(max(t - 2, 0), id - 1)`. Any mismatch
/// means a read saw the wrong period.
#[derive(Debug, Default)]
pub struct ValidationWalker {
    checked: u32,
    violations: u32,
}

impl ValidationWalker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(agent: &Agent) -> i32 {
        entity_int(agent.id()) - 1
    }
}

impl Behavior for ValidationWalker {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let origin = Location::new(0, Self::lane(agent));
        agent.add_variable(&kernel_vars::LOCATION, Value::Location(origin))?;
        agent.add_variable(&kernel_vars::PREVIOUS, Value::Location(origin))
    }

    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let now = agent.local_time();
        let lane = Self::lane(agent);
        let here = agent.location()?;
        let previous = agent.get(&kernel_vars::PREVIOUS)?.as_location();

        let expected_here = Location::new((now - 1) as i32, lane);
        let expected_previous = Location::new((now - 2).max(0) as i32, lane);
        self.checked += 1;
        if here != expected_here || previous != Some(expected_previous) {
            self.violations += 1;
            warn!(
                entity = %agent.id(),
                time = now,
                %here,
                expected = %expected_here,
                "Validation walker read an unexpected location"
            );
        }

        agent.set(&kernel_vars::PREVIOUS, Value::Location(here))?;
        agent.set(&kernel_vars::LOCATION, Value::Location(here.offset(1, 0)))
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        to_report(&ValidationReport {
            checked: self.checked,
            violations: self.violations,
        })
    }
}

// ========== MESSAGING ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CourierReport {
    pub sent: u32,
    pub received: u32,
    pub mismatched: u32,
}

/// Sends its local time to `peer` on every even time unit.
pub struct CourierSender {
    peer: EntityId,
    sent: u32,
}

impl CourierSender {
    pub fn new(peer: EntityId) -> Self {
        Self { peer, sent: 0 }
    }
}

impl Behavior for CourierSender {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let now = agent.local_time();
        if now % 2 != 0 {
            return Ok(());
        }
        let message = agent.compose(self.peer, Payload::Int(now as i32));
        agent.send_message(message)?;
        self.sent += 1;
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        to_report(&CourierReport {
            sent: self.sent,
            ..Default::default()
        })
    }
}

/// Takes one message per odd time unit and checks it came from `peer`
/// carrying its send time.
pub struct CourierReceiver {
    peer: EntityId,
    mismatched: u32,
}

impl CourierReceiver {
    pub fn new(peer: EntityId) -> Self {
        Self { peer, mismatched: 0 }
    }
}

impl Behavior for CourierReceiver {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        agent.add_variable(&RECEIVED, Value::Int(0))
    }

    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        if agent.local_time() % 2 != 1 {
            return Ok(());
        }
        let Some(message) = agent.get_message()? else {
            return Ok(());
        };
        let expected = Payload::Int(message.send_time() as i32);
        if message.source() != self.peer || message.payload != expected {
            self.mismatched += 1;
        }
        let received = agent.get(&RECEIVED)?.as_int().unwrap_or(0);
        agent.set(&RECEIVED, Value::Int(received + 1))
    }

    fn report(&mut self, agent: &mut Agent) -> KernelResult<String> {
        let received = agent.get(&RECEIVED)?.as_int().unwrap_or(0);
        to_report(&CourierReport {
            received: received as u32,
            mismatched: self.mismatched,
            ..Default::default()
        })
    }
}

// ========== SPAWNING ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnerReport {
    pub spawned: u32,
}

/// Spawns one [`ValidationWalker`] per step until `cap` children exist.
pub struct Spawner {
    cap: u32,
    spawned: u32,
}

impl Spawner {
    pub fn new(cap: u32) -> Self {
        Self { cap, spawned: 0 }
    }
}

impl Behavior for Spawner {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        if self.spawned >= self.cap {
            return Ok(());
        }
        let child = agent.spawn(classes::VALIDATOR, ValidationWalker::new())?;
        trace!(parent = %agent.id(), %child, time = agent.local_time(), "Spawned child");
        self.spawned += 1;
        Ok(())
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        to_report(&SpawnerReport { spawned: self.spawned })
    }
}

// ========== CONTENTION ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconReport {
    pub holder: i32,
}

/// Owns the contested [`BEACON`] cell and reports who holds it.
#[derive(Debug, Default)]
pub struct Beacon;

impl Behavior for Beacon {
    fn setup(&mut self, agent: &mut Agent) -> KernelResult<()> {
        agent.add_variable(&BEACON, Value::Int(0))
    }

    fn step(&mut self, _agent: &mut Agent) -> KernelResult<()> {
        Ok(())
    }

    fn report(&mut self, agent: &mut Agent) -> KernelResult<String> {
        let holder = agent.get(&BEACON)?.as_int().unwrap_or(0);
        to_report(&BeaconReport { holder })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReport {
    pub claims: u32,
    pub losses: u32,
}

/// Claims a beacon every `period` time units.
///
/// When another claimant got there first at the same time the claim is
/// rolled back; on re-execution of that time unit the claimant backs off
/// instead of trying again.
pub struct Claimant {
    beacon: EntityId,
    period: Time,
    lost_at: Option<Time>,
    claims: u32,
    losses: u32,
}

impl Claimant {
    pub fn new(beacon: EntityId, period: Time) -> Self {
        Self {
            beacon,
            period: period.max(1),
            lost_at: None,
            claims: 0,
            losses: 0,
        }
    }
}

impl Behavior for Claimant {
    fn step(&mut self, agent: &mut Agent) -> KernelResult<()> {
        let now = agent.local_time();
        if now % self.period != 0 || self.lost_at == Some(now) {
            return Ok(());
        }
        match agent.set_of(self.beacon, &BEACON, Value::Int(entity_int(agent.id()))) {
            Ok(()) => {
                self.claims += 1;
                Ok(())
            }
            Err(e) if e.is_rollback() => {
                self.losses += 1;
                self.lost_at = Some(now);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn report(&mut self, _agent: &mut Agent) -> KernelResult<String> {
        to_report(&ClaimReport {
            claims: self.claims,
            losses: self.losses,
        })
    }
}
