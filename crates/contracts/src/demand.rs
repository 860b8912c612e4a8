//! Demand - authorized element count on one upstream/downstream edge.

use std::fmt;

/// Outstanding demand, saturating at `u64::MAX` (unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Demand(u64);

impl Demand {
    /// No demand
    pub const NONE: Demand = Demand(0);

    /// Unbounded demand, never consumed
    pub const UNBOUNDED: Demand = Demand(u64::MAX);

    /// Create demand from a raw count
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    /// Raw count (`u64::MAX` when unbounded)
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` if the demand is unbounded
    pub const fn is_unbounded(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns `true` if at least one element may be emitted
    pub const fn has_demand(self) -> bool {
        self.0 > 0
    }

    /// Add `n` to the demand, saturating at unbounded
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// Consume one unit of demand
    ///
    /// Unbounded demand is never consumed. Returns `None` when no demand is left.
    #[must_use]
    pub const fn consume_one(self) -> Option<Self> {
        match self.0 {
            0 => None,
            u64::MAX => Some(self),
            n => Some(Self(n - 1)),
        }
    }
}

impl From<u64> for Demand {
    fn from(count: u64) -> Self {
        Self(count)
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            f.write_str("unbounded")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
