//! Static cardinality intervals.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::seqtype::Occ;

/// `[min, max]` number of items or tuples; `max == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeBounds {
    pub min: u64,
    pub max: Option<u64>,
}

impl SizeBounds {
    pub const EMPTY: SizeBounds = SizeBounds {
        min: 0,
        max: Some(0),
    };
    pub const ONE: SizeBounds = SizeBounds {
        min: 1,
        max: Some(1),
    };
    pub const ANY: SizeBounds = SizeBounds { min: 0, max: None };

    pub const fn exact(n: u64) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub fn of_occ(occ: Occ) -> Self {
        Self {
            min: occ.min(),
            max: occ.max(),
        }
    }

    pub fn occ(&self) -> Occ {
        Occ::from_bounds(self.min, self.max)
    }

    /// `Some(n)` when min and max agree.
    pub fn exact_value(&self) -> Option<u64> {
        match self.max {
            Some(max) if max == self.min => Some(max),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max == Some(0)
    }

    /// Product of two intervals; zero absorbs unbounded.
    pub fn times(self, other: SizeBounds) -> SizeBounds {
        let max = match (self.max, other.max) {
            (Some(0), _) | (_, Some(0)) => Some(0),
            (Some(a), Some(b)) => a.checked_mul(b),
            _ => None,
        };
        SizeBounds {
            min: self.min.saturating_mul(other.min),
            max,
        }
    }

    pub fn plus(self, other: SizeBounds) -> SizeBounds {
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => a.checked_add(b),
            _ => None,
        };
        SizeBounds {
            min: self.min.saturating_add(other.min),
            max,
        }
    }

    /// An `allowing empty` source still produces one round.
    pub fn at_least_one(self) -> SizeBounds {
        SizeBounds {
            min: self.min.max(1),
            max: self.max.map(|m| m.max(1)),
        }
    }
}

impl Default for SizeBounds {
    fn default() -> Self {
        SizeBounds::ONE
    }
}

impl fmt::Display for SizeBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {}]", self.min, max),
            None => write!(f, "[{}, *]", self.min),
        }
    }
}
