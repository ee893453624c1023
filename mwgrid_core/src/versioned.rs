//! Versioned cells: one variable's history over virtual time.
//!
//! A cell is an ordered set of write-periods `(time, value)`. A value written
//! at `t` holds until the next write, so reads are floor lookups:
//!
//! ```text
//!   writes:   t=0 "a"        t=4 "b"     t=9 "c"
//!   ─────────●──────────────●───────────●──────────▶ time
//!   read(3) = "a"   read(4) = "b"   read(100) = "c"
//! ```
//!
//! Rollback trims the future (`prune_above`); fossil collection compacts the
//! past below the global horizon (`prune_below`).

use crate::error::{KernelError, KernelResult};
use mwgrid_env::Time;
use std::collections::BTreeMap;

/// The history of a single variable.
///
/// Never empty: the initial value is installed at creation and neither
/// pruning operation removes the last remaining period.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedCell<V> {
    periods: BTreeMap<Time, V>,
}

impl<V> VersionedCell<V> {
    /// Creates a cell holding `value` from `time` onwards.
    pub fn new(time: Time, value: V) -> Self {
        let mut periods = BTreeMap::new();
        periods.insert(time, value);
        Self { periods }
    }

    /// Floor read: the value of the latest period starting at or before `time`.
    ///
    /// # Returns
    /// * `Ok(&value)` - The value in force at `time`
    /// * `Err(KernelError::NotYetWritten)` - `time` precedes the retained history
    pub fn read(&self, time: Time) -> KernelResult<&V> {
        self.periods
            .range(..=time)
            .next_back()
            .map(|(_, value)| value)
            .ok_or(KernelError::NotYetWritten {
                time,
                earliest: self.earliest(),
            })
    }

    /// Starts a new period at exactly `time`.
    ///
    /// Returns `false` and leaves the cell untouched if a period already
    /// starts at `time`. This is the conflict signal.
    pub fn write(&mut self, time: Time, value: V) -> bool {
        use std::collections::btree_map::Entry;
        match self.periods.entry(time) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Fossil collection: drops history strictly before the floor of `horizon`.
    ///
    /// The floor period is re-keyed to `horizon` so that reads at or after
    /// the horizon are unchanged while the cell holds one representative
    /// entry for the compacted range. No-op if nothing starts at or before
    /// `horizon` (an earlier compaction already covered it).
    pub fn prune_below(&mut self, horizon: Time) {
        let floor = match self.periods.range(..=horizon).next_back() {
            Some((&time, _)) => time,
            None => return,
        };
        self.periods = self.periods.split_off(&floor);
        if floor != horizon {
            if let Some(value) = self.periods.remove(&floor) {
                self.periods.insert(horizon, value);
            }
        }
    }

    /// Rollback: drops every period starting after `time`.
    ///
    /// The earliest period always survives, even when `time` precedes it.
    pub fn prune_above(&mut self, time: Time) {
        let keep_through = time.max(self.earliest());
        if let Some(cut) = keep_through.checked_add(1) {
            self.periods.split_off(&cut);
        }
    }

    /// Drops periods after `time` whose value fails `keep`, sparing the earliest.
    ///
    /// Used by transports that retract one writer's periods on rollback.
    pub fn retain_after(&mut self, time: Time, mut keep: impl FnMut(&V) -> bool) {
        let earliest = self.earliest();
        self.periods
            .retain(|&t, value| t <= time || t == earliest || keep(value));
    }

    /// Start of the earliest retained period.
    pub fn earliest(&self) -> Time {
        self.periods.keys().next().copied().unwrap_or(Time::MIN)
    }

    /// Start of the latest period.
    pub fn latest(&self) -> Time {
        self.periods.keys().next_back().copied().unwrap_or(Time::MIN)
    }

    /// Value of the latest period.
    pub fn current(&self) -> Option<&V> {
        self.periods.values().next_back()
    }

    /// Number of retained periods.
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    /// Always false for a constructed cell.
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Iterates periods in time order.
    pub fn iter(&self) -> impl Iterator<Item = (Time, &V)> {
        self.periods.iter().map(|(t, v)| (*t, v))
    }
}
