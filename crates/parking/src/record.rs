//! Row-level occupancy records published by camera workers.

use std::{
    collections::BTreeMap,
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
};

/// A camera address decomposed as `site_level_row`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowAddress {
    pub site: String,
    pub level: String,
    pub row: String,
}

impl RowAddress {
    /// Split an address on underscores. Exactly three non-empty alphanumeric parts are required.
    pub fn parse(address: &str) -> Option<Self> {
        let mut parts = address.split('_');
        let site = parts.next()?;
        let level = parts.next()?;
        let row = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let valid = |part: &str| !part.is_empty() && part.chars().all(char::is_alphanumeric);
        if !(valid(site) && valid(level) && valid(row)) {
            return None;
        }
        Some(Self {
            site: site.to_string(),
            level: level.to_string(),
            row: row.to_string(),
        })
    }

    /// Overlay label for the stall at zero-based `index`.
    pub fn stall_label(&self, index: usize) -> String {
        format!("{}_{}", self.row, index + 1)
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.site, self.level, self.row)
    }
}

/// Stall counts for a row, level, or site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollup {
    pub total: u32,
    pub occupied: u32,
    pub unoccupied: u32,
}

impl Add for Rollup {
    type Output = Rollup;

    fn add(self, rhs: Rollup) -> Rollup {
        Rollup {
            total: self.total + rhs.total,
            occupied: self.occupied + rhs.occupied,
            unoccupied: self.unoccupied + rhs.unoccupied,
        }
    }
}

impl AddAssign for Rollup {
    fn add_assign(&mut self, rhs: Rollup) {
        *self = *self + rhs;
    }
}

impl Sum for Rollup {
    fn sum<I: Iterator<Item = Rollup>>(iter: I) -> Rollup {
        iter.fold(Rollup::default(), Add::add)
    }
}

/// Per-stall state of one row plus its counts. Stall ids are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowOccupancy {
    pub stalls: BTreeMap<u32, u8>,
    pub summary: Rollup,
}

impl RowOccupancy {
    /// Build from a smoothed occupancy vector; any non-zero entry counts as occupied.
    pub fn from_vector(vector: &[u8]) -> Self {
        let stalls: BTreeMap<u32, u8> = vector
            .iter()
            .enumerate()
            .map(|(idx, value)| (idx as u32 + 1, u8::from(*value != 0)))
            .collect();
        let occupied = stalls.values().filter(|v| **v == 1).count() as u32;
        let total = stalls.len() as u32;
        Self {
            stalls,
            summary: Rollup {
                total,
                occupied,
                unoccupied: total - occupied,
            },
        }
    }
}

/// One frame's smoothed occupancy for one camera row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    pub address: RowAddress,
    pub row: RowOccupancy,
}

impl RowRecord {
    pub fn new(address: RowAddress, smoothed: &[u8]) -> Self {
        Self {
            address,
            row: RowOccupancy::from_vector(smoothed),
        }
    }
}
