//! Named kernel scenarios the harness can run.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// MW-001: Random walkers on a bounded grid
    RandomWalk,

    /// MW-002: Lane walkers checking their own read history
    Validation,

    /// MW-003: Sender/receiver pairs exchanging messages
    Messaging,

    /// MW-004: One agent spawning children mid-run
    Spawning,

    /// MW-005: Two claimants contending for one shared cell
    Contention,

    /// MW-006: Lane walkers spread over loopback worker ranks
    DistributedWalk,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RandomWalk,
            ScenarioId::Validation,
            ScenarioId::Messaging,
            ScenarioId::Spawning,
            ScenarioId::Contention,
            ScenarioId::DistributedWalk,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RandomWalk => "random_walk",
            ScenarioId::Validation => "validation",
            ScenarioId::Messaging => "messaging",
            ScenarioId::Spawning => "spawning",
            ScenarioId::Contention => "contention",
            ScenarioId::DistributedWalk => "distributed_walk",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RandomWalk => "Agents step to free neighbouring cells inside a bounded grid",
            ScenarioId::Validation => "Each agent walks its own lane and verifies every read it makes",
            ScenarioId::Messaging => "Couriers send on even time units and receive on odd ones",
            ScenarioId::Spawning => "A parent spawns validating children that start at time 0",
            ScenarioId::Contention => "Same-time writes to one cell force the later writer to roll back",
            ScenarioId::DistributedWalk => "Validation walk over a coordinator and several worker ranks",
        }
    }

    /// Returns true if the scenario runs over the loopback transport.
    pub fn is_distributed(&self) -> bool {
        matches!(self, ScenarioId::DistributedWalk)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random_walk" | "randomwalk" | "mw-001" => Ok(ScenarioId::RandomWalk),
            "validation" | "mw-002" => Ok(ScenarioId::Validation),
            "messaging" | "mw-003" => Ok(ScenarioId::Messaging),
            "spawning" | "mw-004" => Ok(ScenarioId::Spawning),
            "contention" | "mw-005" => Ok(ScenarioId::Contention),
            "distributed_walk" | "distributedwalk" | "mw-006" => Ok(ScenarioId::DistributedWalk),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
