//! The bootstrap file a multi-process run starts from.
//!
//! Written once by the coordinator before the run and read by the transport.
//! It is line-oriented:
//!
//! ```text
//! message: SingleReadMessage          one line per wire message type
//! alp: 1 -> 0                         worker rank -> leaf coordinator rank
//! ssv: 0, 7, 3, POINT, <4:5>          initial shared variables
//! clp: 0, <0:0>, <9:9>                spatial bounds per coordinator
//! ```
//!
//! STRING values are percent-escaped the way mailbox text is, so a value
//! never spans lines.

use crate::error::{KernelError, KernelResult};
use crate::mailbox::{escape, unescape};
use mwgrid_env::{EntityId, Location, TransportConfig, Value, ValueType, VariableId};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the bootstrap file inside the data directory.
pub const BOOTSTRAP_FILE: &str = "Initialisation.dat";

/// Wire message types announced to the transport, in declaration order.
pub const MESSAGE_TYPES: [&str; 14] = [
    "SingleReadMessage",
    "SingleReadResponseMessage",
    "SingleReadAntiMessage",
    "RangeQueryMessage",
    "RangeQueryAntiMessage",
    "WriteMessage",
    "WriteResponseMessage",
    "WriteAntiMessage",
    "GvtControlMessage",
    "GvtRequestMessage",
    "GvtValueMessage",
    "RollbackMessage",
    "StateMigrationMessage",
    "RangeUpdateMessage",
];

/// Coordinator counts the tree layout supports: complete binary trees.
const SUPPORTED_COORDINATORS: [u32; 10] = [1, 3, 7, 15, 31, 63, 127, 255, 511, 1023];

/// One initial shared variable.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialVariable {
    pub entity: EntityId,
    pub variable: VariableId,
    pub value: Value,
}

/// Spatial bounds assigned to a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionBounds {
    pub coordinator: u32,
    pub min: Location,
    pub max: Location,
}

/// Parsed or generated contents of the bootstrap file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BootstrapPlan {
    pub message_types: Vec<String>,
    /// `(worker rank, coordinator rank)`
    pub ownership: Vec<(u32, u32)>,
    pub variables: Vec<InitialVariable>,
    pub partitions: Vec<PartitionBounds>,
}

impl BootstrapPlan {
    /// Lays out a deployment for the given initial variables.
    ///
    /// Workers are attached to the leaf coordinators (the last `(n + 1) / 2`
    /// ranks of the tree) in contiguous blocks. Coordinator 0 receives the
    /// bounding box of every initial location; the others start empty. With
    /// no initial location at all, coordinator 0 starts empty too.
    pub fn build(
        config: &TransportConfig,
        variables: impl IntoIterator<Item = InitialVariable>,
    ) -> KernelResult<Self> {
        let coordinators = config.num_coordinators;
        if !SUPPORTED_COORDINATORS.contains(&coordinators) {
            return Err(KernelError::bootstrap(format!(
                "unsupported coordinator count {coordinators}, expected 2^k - 1"
            )));
        }
        let leaves = (coordinators + 1) / 2;
        let per_leaf = config.num_workers.div_ceil(leaves).max(1);
        let ownership = (0..config.num_workers)
            .map(|i| {
                let worker = coordinators + i;
                let leaf = coordinators - leaves + i / per_leaf;
                (worker, leaf)
            })
            .collect();

        let mut variables: Vec<InitialVariable> = variables.into_iter().collect();
        variables.sort_by_key(|v| (v.entity, v.variable));

        let bounding_box = variables
            .iter()
            .filter_map(|v| v.value.as_location())
            .fold(None, |acc: Option<(Location, Location)>, loc| {
                Some(match acc {
                    None => (loc, loc),
                    Some((min, max)) => (
                        Location::new(min.x.min(loc.x), min.y.min(loc.y)),
                        Location::new(max.x.max(loc.x), max.y.max(loc.y)),
                    ),
                })
            });
        let empty = Location::new(i32::MAX, i32::MAX);
        let partitions = (0..coordinators)
            .map(|coordinator| {
                let (min, max) = match (coordinator, bounding_box) {
                    (0, Some(bounds)) => bounds,
                    _ => (empty, empty),
                };
                PartitionBounds { coordinator, min, max }
            })
            .collect();

        Ok(Self {
            message_types: MESSAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            ownership,
            variables,
            partitions,
        })
    }

    /// Renders the file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for name in &self.message_types {
            let _ = writeln!(out, "message: {name}");
        }
        for (worker, coordinator) in &self.ownership {
            let _ = writeln!(out, "alp: {worker} -> {coordinator}");
        }
        for var in &self.variables {
            let value = match &var.value {
                Value::Text(text) => escape(text),
                other => other.to_string(),
            };
            let _ = writeln!(
                out,
                "ssv: 0, {}, {}, {}, <{}>",
                var.entity,
                var.variable,
                var.value.value_type().tag(),
                value
            );
        }
        for bounds in &self.partitions {
            let _ = writeln!(out, "clp: {}, <{}>, <{}>", bounds.coordinator, bounds.min, bounds.max);
        }
        out
    }

    /// Parses file contents produced by [`render`](Self::render).
    pub fn parse(text: &str) -> KernelResult<Self> {
        let mut plan = BootstrapPlan::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = |what: &str| {
                KernelError::bootstrap(format!("line {}: {what}: '{line}'", index + 1))
            };
            let (kind, rest) = line.split_once(':').ok_or_else(|| bad("missing record kind"))?;
            let rest = rest.trim();
            match kind.trim() {
                "message" => plan.message_types.push(rest.to_string()),
                "alp" => {
                    let (worker, coordinator) =
                        rest.split_once("->").ok_or_else(|| bad("expected 'w -> c'"))?;
                    let worker = worker.trim().parse().map_err(|_| bad("bad worker rank"))?;
                    let coordinator = coordinator
                        .trim()
                        .parse()
                        .map_err(|_| bad("bad coordinator rank"))?;
                    plan.ownership.push((worker, coordinator));
                }
                "ssv" => {
                    let fields: Vec<&str> = rest.splitn(5, ',').map(str::trim).collect();
                    let [_, entity, variable, tag, value] = fields[..] else {
                        return Err(bad("expected 5 fields"));
                    };
                    let entity = entity.parse().map_err(|_| bad("bad entity id"))?;
                    let variable = variable.parse().map_err(|_| bad("bad variable id"))?;
                    let value_type: ValueType = tag.parse().map_err(|_| bad("bad type tag"))?;
                    let value = unbracket(value).ok_or_else(|| bad("value not in <>"))?;
                    let value = match value_type {
                        ValueType::Text => {
                            Value::Text(unescape(value).map_err(|_| bad("bad escape"))?)
                        }
                        _ => value_type.parse_value(value).map_err(|_| bad("bad value"))?,
                    };
                    plan.variables.push(InitialVariable {
                        entity: EntityId(entity),
                        variable,
                        value,
                    });
                }
                "clp" => {
                    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
                    let [coordinator, min, max] = fields[..] else {
                        return Err(bad("expected 3 fields"));
                    };
                    let location = |s: &str| -> KernelResult<Location> {
                        unbracket(s)
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| bad("bad corner"))
                    };
                    plan.partitions.push(PartitionBounds {
                        coordinator: coordinator.parse().map_err(|_| bad("bad coordinator rank"))?,
                        min: location(min)?,
                        max: location(max)?,
                    });
                }
                _ => return Err(bad("unknown record kind")),
            }
        }
        Ok(plan)
    }

    /// Writes the plan to `<dir>/Initialisation.dat`.
    pub fn write_to(&self, dir: &Path) -> KernelResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(BOOTSTRAP_FILE);
        fs::write(&path, self.render())?;
        Ok(path)
    }

    /// Reads `<dir>/Initialisation.dat`.
    pub fn read_from(dir: &Path) -> KernelResult<Self> {
        let text = fs::read_to_string(dir.join(BOOTSTRAP_FILE))?;
        Self::parse(&text)
    }
}

fn unbracket(s: &str) -> Option<&str> {
    s.trim().strip_prefix('<')?.strip_suffix('>')
}
