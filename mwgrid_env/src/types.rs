//! Common types shared by the kernel and its transports.

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Virtual time. Agents start at 0 and advance by one per step.
pub type Time = i64;

/// Identifier of a variable, unique within one entity.
pub type VariableId = u32;

/// Unique identifier for a simulated entity (agent).
///
/// Ids are assigned monotonically by the kernel starting at 1, so every
/// process that builds the same population derives the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the integer grid agents live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: i32,
    pub y: i32,
}

impl Location {
    /// Creates a location.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns true if this point lies in the closed box spanned by `a` and `b`.
    ///
    /// The corners may be given in any order; all four bounds are inclusive.
    pub fn within(&self, a: Location, b: Location) -> bool {
        let (min_x, max_x) = (a.x.min(b.x), a.x.max(b.x));
        let (min_y, max_y) = (a.y.min(b.y), a.y.max(b.y));
        (min_x..=max_x).contains(&self.x) && (min_y..=max_y).contains(&self.y)
    }

    /// The eight surrounding cells (Moore neighbourhood), clockwise from north-west.
    pub fn neighbours(&self) -> [Location; 8] {
        let Location { x, y } = *self;
        [
            Location::new(x - 1, y - 1),
            Location::new(x, y - 1),
            Location::new(x + 1, y - 1),
            Location::new(x + 1, y),
            Location::new(x + 1, y + 1),
            Location::new(x, y + 1),
            Location::new(x - 1, y + 1),
            Location::new(x - 1, y),
        ]
    }

    /// The four orthogonally adjacent cells (von Neumann neighbourhood).
    pub fn orthogonal_neighbours(&self) -> [Location; 4] {
        let Location { x, y } = *self;
        [
            Location::new(x, y - 1),
            Location::new(x + 1, y),
            Location::new(x, y + 1),
            Location::new(x - 1, y),
        ]
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Location) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        dx.hypot(dy)
    }

    /// Returns a copy shifted by the given offsets.
    pub fn offset(&self, dx: i32, dy: i32) -> Location {
        Location::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.y)
    }
}

impl FromStr for Location {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidLocation(s.to_string());
        let (x, y) = s.trim().split_once(':').ok_or_else(invalid)?;
        let x = x.trim().parse().map_err(|_| invalid())?;
        let y = y.trim().parse().map_err(|_| invalid())?;
        Ok(Location::new(x, y))
    }
}

/// Declared type of a variable. Also the type tag used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Double,
    Location,
    Text,
}

impl ValueType {
    /// Wire/bootstrap tag for this type.
    pub fn tag(&self) -> &'static str {
        match self {
            ValueType::Int => "INT",
            ValueType::Double => "DOUBLE",
            ValueType::Location => "POINT",
            ValueType::Text => "STRING",
        }
    }

    /// Parses a value of this type from its textual form.
    pub fn parse_value(&self, text: &str) -> Result<Value, ParseError> {
        let invalid = || ParseError::InvalidValue {
            kind: self.tag(),
            text: text.to_string(),
        };
        match self {
            ValueType::Int => text.trim().parse().map(Value::Int).map_err(|_| invalid()),
            ValueType::Double => text.trim().parse().map(Value::Double).map_err(|_| invalid()),
            ValueType::Location => text.parse().map(Value::Location),
            ValueType::Text => Ok(Value::Text(text.to_string())),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ValueType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "INT" => Ok(ValueType::Int),
            "DOUBLE" => Ok(ValueType::Double),
            "POINT" => Ok(ValueType::Location),
            "STRING" => Ok(ValueType::Text),
            other => Err(ParseError::UnknownType(other.to_string())),
        }
    }
}

/// A value stored in a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Double(f64),
    Location(Location),
    Text(String),
}

impl Value {
    /// Returns the runtime type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Double(_) => ValueType::Double,
            Value::Location(_) => ValueType::Location,
            Value::Text(_) => ValueType::Text,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<Location> {
        match self {
            Value::Location(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Location(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Location> for Value {
    fn from(v: Location) -> Self {
        Value::Location(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// The conflict signal: `entity` must rewind to `time - 1` and re-execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub entity: EntityId,
    pub time: Time,
}

impl RollbackRequest {
    pub fn new(entity: EntityId, time: Time) -> Self {
        Self { entity, time }
    }
}

impl fmt::Display for RollbackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity {} at time {}", self.entity, self.time)
    }
}

/// Role of a process in a multi-process deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Hosts shared state (a CLP in PDES-MAS terms). Runs no agents.
    Coordinator,
    /// Runs agents (an ALP).
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => f.write_str("coordinator"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

/// Shape of a multi-process deployment, handed to a transport on connect.
///
/// Coordinators occupy ranks `0..num_coordinators`, workers the ranks after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub num_workers: u32,
    pub num_coordinators: u32,
    pub start_time: Time,
    pub end_time: Time,
}

impl TransportConfig {
    pub fn new(num_workers: u32, num_coordinators: u32, start_time: Time, end_time: Time) -> Self {
        Self {
            num_workers,
            num_coordinators,
            start_time,
            end_time,
        }
    }

    /// Total number of processes.
    pub fn size(&self) -> u32 {
        self.num_workers + self.num_coordinators
    }

    /// Role of the process at `rank`.
    pub fn role_of(&self, rank: u32) -> Role {
        if rank < self.num_coordinators {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }

    /// Worker rank that runs the given entity.
    pub fn owner_of(&self, entity: EntityId) -> u32 {
        let workers = u64::from(self.num_workers.max(1));
        // Bounded by num_workers, so the narrowing cannot truncate.
        let slot = (entity.0.saturating_sub(1) % workers) as u32;
        self.num_coordinators + slot
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(1, 1, 0, 100)
    }
}
